//! Shared fixtures for cashless tests: fixed keys, a scripted ledger,
//! pre-provisioned bracelets and a fully wired terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use cashless_codec::{CashlessAccount, LogicalTagRecord, MinorUnits, TagCodec, TagKeys};
use cashless_core::{
    CashlessBalance, CashlessConfig, CashlessTransaction, Collaborators, ConnectivityMonitor,
    Ledger, LedgerError, LedgerReceipt, MemoryStore, TagSecurityConfig, TransactionOrchestrator,
};
use cashless_nfc::{SessionManager, SimulatedRadio, SimulatedTag};

pub const FESTIVAL_ID: &str = "f1";
pub const VENDOR_ID: &str = "v1";
pub const ENCRYPTION_KEY_HEX: &str =
    "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a";
pub const SIGNING_KEY_HEX: &str =
    "1717171717171717171717171717171717171717171717171717171717171717";

/// UID of the default test bracelet and its hex id.
pub const BRACELET_UID: [u8; 4] = [0x04, 0xA2, 0x2B, 0x91];
pub const BRACELET_ID: &str = "04A22B91";

pub fn tag_keys() -> TagKeys {
    // Constant, known-valid key material.
    TagKeys::from_hex(ENCRYPTION_KEY_HEX, SIGNING_KEY_HEX).expect("fixture keys are valid")
}

pub fn codec() -> Arc<TagCodec> {
    Arc::new(TagCodec::new(tag_keys()))
}

/// Config for festival `f1` / vendor `v1` with the fixture keys.
pub fn test_config() -> CashlessConfig {
    CashlessConfig {
        api_base_url: "http://ledger.test".into(),
        festival_id: FESTIVAL_ID.into(),
        vendor_id: Some(VENDOR_ID.into()),
        tag: TagSecurityConfig {
            encryption_key: ENCRYPTION_KEY_HEX.into(),
            signing_key: SIGNING_KEY_HEX.into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn ledger_balance(bracelet_id: &str, balance: MinorUnits) -> CashlessBalance {
    CashlessBalance {
        bracelet_id: bracelet_id.into(),
        balance,
        currency: "EUR".into(),
        last_updated: chrono::Utc::now(),
        festival_id: FESTIVAL_ID.into(),
        user_id: Some("user-1".into()),
        is_active: true,
        daily_limit: None,
        daily_spent: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BRACELETS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn cashless_record(account_id: &str, balance: MinorUnits) -> LogicalTagRecord {
    LogicalTagRecord::cashless(FESTIVAL_ID, CashlessAccount::new(account_id, balance), 1_700_000_000_000)
}

/// A bracelet provisioned with a signed, encrypted cashless record.
pub fn cashless_bracelet(uid: &[u8], account_id: &str, balance: MinorUnits) -> Result<SimulatedTag> {
    let (_, bytes) = codec()
        .to_ndef(&cashless_record(account_id, balance), true, true)
        .map_err(|e| anyhow!("encode fixture record: {e}"))?;
    Ok(SimulatedTag::with_ndef(uid.to_vec(), bytes))
}

/// Decode the cashless account currently on the radio's tag.
pub async fn tag_account(radio: &SimulatedRadio) -> Result<CashlessAccount> {
    let tag = radio.current().await.context("no tag present")?;
    let codec = codec();
    let payload = codec
        .payload_from_ndef(&tag.ndef)
        .map_err(|e| anyhow!("ndef: {e}"))?
        .context("tag is blank")?;
    if !codec.verify_signature(&payload) {
        return Err(anyhow!("tag signature invalid"));
    }
    let record = codec.decode(&payload, true).map_err(|e| anyhow!("decode: {e}"))?;
    record
        .cashless_account()
        .cloned()
        .context("not a cashless tag")
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPTED LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process ledger that applies accepted transactions to its own balances.
#[derive(Default)]
pub struct ScriptedLedger {
    balances: Mutex<HashMap<String, CashlessBalance>>,
    accepted: Mutex<Vec<CashlessTransaction>>,
    submit_calls: AtomicUsize,
    balance_calls: AtomicUsize,
    unreachable: AtomicBool,
    reject_next: Mutex<Option<LedgerError>>,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, balance: CashlessBalance) -> Self {
        self.set_balance(balance);
        self
    }

    pub fn set_balance(&self, balance: CashlessBalance) {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(balance.bracelet_id.clone(), balance);
    }

    pub fn balance_of(&self, bracelet_id: &str) -> Option<MinorUnits> {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bracelet_id)
            .map(|b| b.balance)
    }

    /// Every request fails as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next submission with `error`.
    pub fn reject_next(&self, error: LedgerError) {
        *self.reject_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> Vec<CashlessTransaction> {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(LedgerError::Network("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    async fn fetch_balance(&self, bracelet_id: &str) -> Result<CashlessBalance, LedgerError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bracelet_id)
            .cloned()
            .ok_or_else(|| LedgerError::Server {
                status: 404,
                code: Some("NOT_FOUND".into()),
                message: format!("unknown bracelet {bracelet_id}"),
            })
    }

    async fn submit_transaction(
        &self,
        transaction: &CashlessTransaction,
    ) -> Result<LedgerReceipt, LedgerError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_reachable()?;
        if let Some(error) = self.reject_next.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(error);
        }

        if let Some(balance) = self.balances.lock().unwrap_or_else(PoisonError::into_inner).get_mut(&transaction.bracelet_id) {
            balance.balance = if transaction.transaction_type.is_debit() {
                balance.balance.saturating_sub(transaction.amount)
            } else {
                balance.balance.saturating_add(transaction.amount)
            };
        }

        let receipt = LedgerReceipt {
            id: Some(format!("srv-{n}")),
            signature: Some(format!("ledger-sig-{n}")),
        };
        let mut recorded = transaction.clone();
        recorded.id = format!("srv-{n}");
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).push(recorded);
        Ok(receipt)
    }

    async fn list_transactions(
        &self,
        bracelet_id: &str,
        limit: usize,
    ) -> Result<Vec<CashlessTransaction>, LedgerError> {
        self.check_reachable()?;
        Ok(self
            .accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .filter(|tx| tx.bracelet_id == bracelet_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.check_reachable()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TERMINAL HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

/// A point-of-sale terminal over simulated hardware.
pub struct Terminal {
    pub orchestrator: Arc<TransactionOrchestrator>,
    pub radio: Arc<SimulatedRadio>,
    pub ledger: Arc<ScriptedLedger>,
    pub store: Arc<MemoryStore>,
    pub network: ConnectivityMonitor,
}

impl Terminal {
    pub async fn new(config: CashlessConfig, ledger: ScriptedLedger, tag: SimulatedTag) -> Result<Self> {
        let radio = Arc::new(SimulatedRadio::with_tag(tag));
        let session = SessionManager::new(radio.clone());
        session.initialize().await;

        let ledger = Arc::new(ledger);
        let store = Arc::new(MemoryStore::new());
        let network = ConnectivityMonitor::new(true);
        let orchestrator = TransactionOrchestrator::new(
            config,
            Collaborators {
                ledger: ledger.clone(),
                store: store.clone(),
                network: network.clone(),
                session,
            },
        )?;

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            radio,
            ledger,
            store,
            network,
        })
    }

    /// Terminal for the default bracelet holding `balance` on the tag and
    /// in the ledger.
    pub async fn with_bracelet(balance: MinorUnits) -> Result<Self> {
        Self::new(
            test_config(),
            ScriptedLedger::new().with_balance(ledger_balance(BRACELET_ID, balance)),
            cashless_bracelet(&BRACELET_UID, "acc-1", balance)?,
        )
        .await
    }

    pub async fn tag_balance(&self) -> Result<MinorUnits> {
        Ok(tag_account(&self.radio).await?.balance)
    }

    pub fn go_offline(&self) {
        self.ledger.set_unreachable(true);
        self.network.set_online(false);
    }

    pub fn go_online(&self) {
        self.ledger.set_unreachable(false);
        self.network.set_online(true);
    }
}
