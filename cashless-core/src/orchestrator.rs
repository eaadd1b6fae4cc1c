//! Payment, topup, transfer and refund processing.
//!
//! Every transaction starts in `processing` and ends in one of three ways:
//!
//! ```text
//!                       ┌─► ledger accepts ───────────────► completed / synced
//!   processing ─online─►┤
//!        │              └─► any ledger failure ┐
//!        │                                     ▼
//!        └─────────────offline────────► offline allowed and within limit?
//!                                           │yes                     │no
//!                                           ▼                        ▼
//!                                  pending / pending (queued)      failed
//! ```
//!
//! After a commit (online or queued) the bracelet and the local cache are
//! brought up to date on a best-effort basis and transaction listeners are
//! notified. Listeners cannot tell the two paths apart except through
//! `sync_status`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use cashless_codec::{CashlessAccount, MinorUnits, TagCodec};
use cashless_nfc::{ListenerId, Listeners, SessionManager, TagReader, TagWriter};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balance::BalanceAuthority;
use crate::config::CashlessConfig;
use crate::error::CashlessError;
use crate::ledger::Ledger;
use crate::network::ConnectivityMonitor;
use crate::queue::OfflineQueue;
use crate::storage::KeyValueStore;
use crate::types::{
    CashlessEvent, CashlessTransaction, HistorySource, NewTransaction, PaymentRequest,
    RefundRequest, SyncReport, SyncStatus, TopupRequest, TransactionHistory, TransactionResult,
    TransactionStatus, TransactionType, TransferRequest,
};

const EVENT_CAPACITY: usize = 64;

/// External services the orchestrator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn KeyValueStore>,
    pub network: ConnectivityMonitor,
    pub session: SessionManager,
}

pub struct TransactionOrchestrator {
    config: Arc<CashlessConfig>,
    ledger: Arc<dyn Ledger>,
    network: ConnectivityMonitor,
    balances: BalanceAuthority,
    queue: OfflineQueue,
    codec: Arc<TagCodec>,
    reader: TagReader,
    writer: TagWriter,
    listeners: Listeners<CashlessTransaction>,
    events: broadcast::Sender<CashlessEvent>,
    bracelet_locks: BraceletLocks,
}

impl TransactionOrchestrator {
    /// Validate `config` and wire the components together.
    pub fn new(config: CashlessConfig, deps: Collaborators) -> Result<Self, CashlessError> {
        config.validate()?;
        let config = Arc::new(config);
        let codec = Arc::new(TagCodec::new(config.tag_keys()?));
        let policy = config.tag_policy();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(
            festival_id = %config.festival_id,
            offline_payments = config.enable_offline_payments,
            offline_limit = config.offline_limit,
            "transaction orchestrator ready"
        );

        Ok(Self {
            balances: BalanceAuthority::new(
                config.clone(),
                deps.ledger.clone(),
                deps.store.clone(),
                deps.network.clone(),
            ),
            queue: OfflineQueue::new(deps.store, config.transaction_timeout()),
            reader: TagReader::new(deps.session.clone(), codec.clone()),
            writer: TagWriter::new(deps.session, codec.clone()).with_policy(policy),
            codec,
            ledger: deps.ledger,
            network: deps.network,
            listeners: Listeners::new("transaction"),
            events,
            bracelet_locks: BraceletLocks::default(),
            config,
        })
    }

    pub fn config(&self) -> &CashlessConfig {
        &self.config
    }

    pub fn balances(&self) -> &BalanceAuthority {
        &self.balances
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn network(&self) -> &ConnectivityMonitor {
        &self.network
    }

    pub fn reader(&self) -> &TagReader {
        &self.reader
    }

    pub fn writer(&self) -> &TagWriter {
        &self.writer
    }

    /// Whether the caller must collect a PIN before charging `amount`.
    pub fn requires_pin(&self, amount: MinorUnits) -> bool {
        self.config.requires_pin(amount)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LISTENERS AND EVENTS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a callback run after every committed transaction. A failing
    /// callback is logged and does not affect other listeners.
    pub fn on_transaction<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CashlessTransaction) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_transaction_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CashlessEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CashlessEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PAYMENTS
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn process_payment(&self, request: PaymentRequest) -> TransactionResult {
        let _lock = self.lock_bracelets(&[&request.bracelet_id]).await;
        let bracelet_id = request.bracelet_id.clone();
        let outcome = self.try_payment(request).await;
        self.finish(&bracelet_id, outcome)
    }

    async fn try_payment(&self, request: PaymentRequest) -> Result<CashlessTransaction, CashlessError> {
        ensure_positive(request.amount)?;
        let resolved = self
            .balances
            .read_balance(&request.bracelet_id, request.tag_account.as_ref())
            .await?;
        let balance = &resolved.balance;
        if !balance.is_active {
            return Err(CashlessError::AccountInactive(request.bracelet_id));
        }
        if balance.balance < request.amount {
            return Err(CashlessError::InsufficientBalance {
                available: balance.balance,
                requested: request.amount,
            });
        }
        if let Some(limit) = balance.daily_limit {
            let spent = balance.daily_spent.unwrap_or(0);
            if request.amount > limit.saturating_sub(spent) {
                return Err(CashlessError::DailyLimitExceeded {
                    limit,
                    spent,
                    requested: request.amount,
                });
            }
        }

        let festival_id = request
            .festival_id
            .as_deref()
            .unwrap_or(&self.config.festival_id);
        let vendor_id = request.vendor_id.as_deref().or(self.config.vendor_id.as_deref());
        let transaction = CashlessTransaction::open(NewTransaction {
            transaction_type: TransactionType::Payment,
            amount: request.amount,
            previous_balance: balance.balance,
            currency: &balance.currency,
            bracelet_id: &request.bracelet_id,
            festival_id,
            vendor_id,
        })?;
        tracing::debug!(
            transaction_id = %transaction.id,
            bracelet_id = %transaction.bracelet_id,
            amount = transaction.amount,
            source = ?resolved.source,
            stale = resolved.stale,
            "payment validated"
        );

        let mut online_error = None;
        if self.network.is_online() {
            match self.process_online_transaction(transaction.clone()).await {
                Ok(committed) => return Ok(committed),
                Err(CashlessError::Ledger(e)) => {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        error = %e,
                        "online payment failed, falling back to offline path"
                    );
                    online_error = Some(CashlessError::Ledger(e));
                }
                Err(e) => return Err(e),
            }
        }

        if !self.config.enable_offline_payments {
            return Err(online_error.unwrap_or(CashlessError::OfflineNotAllowed));
        }
        if request.amount > self.config.offline_limit {
            return Err(CashlessError::OfflineLimitExceeded {
                limit: self.config.offline_limit,
                requested: request.amount,
            });
        }
        self.process_offline_transaction(transaction).await
    }

    /// Read the presented bracelet and charge it.
    pub async fn charge_bracelet(&self, amount: MinorUnits, vendor_id: Option<String>) -> TransactionResult {
        let read = self
            .reader
            .read_cashless_bracelet(self.writer.policy().read_options())
            .await;
        let (Some(bracelet_id), Some(account)) = (read.bracelet_id, read.cashless_data) else {
            let error = CashlessError::Nfc(read.error.unwrap_or(cashless_nfc::NfcError::TagNotFound));
            tracing::warn!(error = %error, "bracelet read failed, nothing charged");
            return TransactionResult::rejected(&error);
        };

        self.process_payment(PaymentRequest {
            bracelet_id,
            amount,
            vendor_id,
            festival_id: None,
            tag_account: Some(account),
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ONLINE-ONLY OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn process_topup(&self, request: TopupRequest) -> TransactionResult {
        let _lock = self.lock_bracelets(&[&request.bracelet_id]).await;
        let outcome = self
            .credit(
                TransactionType::Topup,
                &request.bracelet_id,
                request.amount,
                request.tag_account.as_ref(),
                None,
            )
            .await;
        self.finish(&request.bracelet_id, outcome)
    }

    pub async fn process_refund(&self, request: RefundRequest) -> TransactionResult {
        let _lock = self.lock_bracelets(&[&request.bracelet_id]).await;
        let outcome = self
            .credit(
                TransactionType::Refund,
                &request.bracelet_id,
                request.amount,
                request.tag_account.as_ref(),
                request.original_transaction_id,
            )
            .await;
        self.finish(&request.bracelet_id, outcome)
    }

    async fn credit(
        &self,
        kind: TransactionType,
        bracelet_id: &str,
        amount: MinorUnits,
        tag_account: Option<&CashlessAccount>,
        original_transaction_id: Option<String>,
    ) -> Result<CashlessTransaction, CashlessError> {
        ensure_positive(amount)?;
        self.require_online()?;
        let resolved = self.balances.read_balance(bracelet_id, tag_account).await?;
        if !resolved.balance.is_active {
            return Err(CashlessError::AccountInactive(bracelet_id.to_string()));
        }

        let mut transaction = CashlessTransaction::open(NewTransaction {
            transaction_type: kind,
            amount,
            previous_balance: resolved.balance.balance,
            currency: &resolved.balance.currency,
            bracelet_id,
            festival_id: &self.config.festival_id,
            vendor_id: self.config.vendor_id.as_deref(),
        })?;
        transaction.original_transaction_id = original_transaction_id;
        self.process_online_transaction(transaction).await
    }

    pub async fn process_transfer(&self, request: TransferRequest) -> TransactionResult {
        let _locks = self
            .lock_bracelets(&[&request.from_bracelet_id, &request.to_bracelet_id])
            .await;
        let outcome = self.try_transfer(&request).await;
        self.finish(&request.from_bracelet_id, outcome)
    }

    async fn try_transfer(&self, request: &TransferRequest) -> Result<CashlessTransaction, CashlessError> {
        ensure_positive(request.amount)?;
        if request.from_bracelet_id == request.to_bracelet_id {
            return Err(CashlessError::InvalidAmount(
                "cannot transfer to the same bracelet".into(),
            ));
        }
        self.require_online()?;

        let resolved = self
            .balances
            .read_balance(&request.from_bracelet_id, request.tag_account.as_ref())
            .await?;
        if !resolved.balance.is_active {
            return Err(CashlessError::AccountInactive(request.from_bracelet_id.clone()));
        }
        if resolved.balance.balance < request.amount {
            return Err(CashlessError::InsufficientBalance {
                available: resolved.balance.balance,
                requested: request.amount,
            });
        }

        let mut transaction = CashlessTransaction::open(NewTransaction {
            transaction_type: TransactionType::Transfer,
            amount: request.amount,
            previous_balance: resolved.balance.balance,
            currency: &resolved.balance.currency,
            bracelet_id: &request.from_bracelet_id,
            festival_id: &self.config.festival_id,
            vendor_id: None,
        })?;
        transaction.counterparty_bracelet_id = Some(request.to_bracelet_id.clone());
        let committed = self.process_online_transaction(transaction).await?;

        if let Err(e) = self.balances.invalidate(&request.to_bracelet_id).await {
            tracing::warn!(bracelet_id = %request.to_bracelet_id, error = %e, "failed to invalidate recipient cache");
        }
        Ok(committed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COMMIT PATHS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Submit to the ledger and, on acceptance, adopt the ledger's id and
    /// signature before updating the bracelet and cache.
    pub async fn process_online_transaction(
        &self,
        mut transaction: CashlessTransaction,
    ) -> Result<CashlessTransaction, CashlessError> {
        let receipt = self.ledger.submit_transaction(&transaction).await?;
        if let Some(id) = receipt.id {
            transaction.id = id;
        }
        if receipt.signature.is_some() {
            transaction.signature = receipt.signature;
        }
        transaction.status = TransactionStatus::Completed;
        transaction.sync_status = SyncStatus::Synced;

        tracing::info!(
            transaction_id = %transaction.id,
            bracelet_id = %transaction.bracelet_id,
            transaction_type = %transaction.transaction_type,
            amount = transaction.amount,
            new_balance = transaction.new_balance(),
            "transaction committed online"
        );
        self.after_commit(&transaction).await;
        self.publish(CashlessEvent::TransactionCompleted(transaction.clone()));
        Ok(transaction)
    }

    /// Queue a transaction for later submission. The queue entry is written
    /// before the bracelet so a crash never leaves an unrecorded debit on it.
    pub async fn process_offline_transaction(
        &self,
        mut transaction: CashlessTransaction,
    ) -> Result<CashlessTransaction, CashlessError> {
        let offline_id = format!("off_{}", uuid::Uuid::new_v4().simple());
        transaction.id = offline_id.clone();
        transaction.offline_id = Some(offline_id);
        transaction.status = TransactionStatus::Pending;
        transaction.sync_status = SyncStatus::Pending;
        transaction.signature = Some(self.codec.sign_detached(transaction.signing_input().as_bytes())?);

        self.queue.enqueue(transaction.clone()).await?;
        tracing::info!(
            offline_id = %transaction.id,
            bracelet_id = %transaction.bracelet_id,
            amount = transaction.amount,
            new_balance = transaction.new_balance(),
            "transaction accepted offline"
        );
        self.after_commit(&transaction).await;
        self.publish(CashlessEvent::TransactionQueued(transaction.clone()));
        Ok(transaction)
    }

    /// Check the local integrity signature of a queued transaction.
    pub fn verify_offline_signature(&self, transaction: &CashlessTransaction) -> bool {
        match &transaction.signature {
            Some(signature) => self
                .codec
                .verify_detached(transaction.signing_input().as_bytes(), signature),
            None => false,
        }
    }

    async fn after_commit(&self, transaction: &CashlessTransaction) {
        if self.config.update_tag_after_transaction {
            let write = self
                .writer
                .update_bracelet_balance_checked(
                    &transaction.bracelet_id,
                    transaction.new_balance(),
                    &transaction.id,
                )
                .await;
            if !write.success {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    bracelet_id = %transaction.bracelet_id,
                    error = ?write.error,
                    "bracelet not updated after commit"
                );
            }
        }

        if let Err(e) = self.balances.update_cached_balance(transaction).await {
            tracing::warn!(transaction_id = %transaction.id, error = %e, "balance cache not updated after commit");
        }

        self.listeners.notify(transaction);
    }

    fn finish(
        &self,
        bracelet_id: &str,
        outcome: Result<CashlessTransaction, CashlessError>,
    ) -> TransactionResult {
        match outcome {
            Ok(transaction) => TransactionResult::completed(transaction),
            Err(error) => {
                tracing::info!(bracelet_id = %bracelet_id, code = %error.code(), error = %error, "transaction rejected");
                self.publish(CashlessEvent::TransactionFailed {
                    bracelet_id: bracelet_id.to_string(),
                    code: error.code(),
                    message: error.to_string(),
                });
                TransactionResult::rejected(&error)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SYNC AND HISTORY
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drain the offline queue. Does nothing while offline.
    pub async fn sync_offline_transactions(&self) -> SyncReport {
        let report = if !self.network.is_online() {
            let remaining = self.queue.len().await.unwrap_or(0);
            tracing::debug!(remaining, "offline, sync skipped");
            SyncReport {
                skipped_offline: true,
                remaining,
                ..Default::default()
            }
        } else {
            match self.queue.sync(self.ledger.as_ref()).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(error = %e, "offline queue unreadable");
                    let error = CashlessError::Storage(e);
                    SyncReport {
                        error: Some(error.to_string()),
                        error_code: Some(error.code()),
                        ..Default::default()
                    }
                }
            }
        };
        self.publish(CashlessEvent::SyncFinished(report.clone()));
        report
    }

    /// Recent transactions of a bracelet, from the ledger when reachable and
    /// from the local queue otherwise.
    pub async fn get_transaction_history(&self, bracelet_id: &str, limit: usize) -> TransactionHistory {
        if self.network.is_online() {
            match self.ledger.list_transactions(bracelet_id, limit).await {
                Ok(transactions) => {
                    return TransactionHistory {
                        success: true,
                        source: HistorySource::Ledger,
                        transactions,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(bracelet_id = %bracelet_id, error = %e, "ledger history unavailable, using local queue");
                }
            }
        }

        match self.queue.for_bracelet(bracelet_id, limit).await {
            Ok(transactions) => TransactionHistory {
                success: true,
                source: HistorySource::Local,
                transactions,
                error: None,
            },
            Err(e) => TransactionHistory {
                success: false,
                source: HistorySource::Local,
                transactions: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    /// Run a queue sync on every offline to online transition until `token`
    /// is cancelled.
    pub fn spawn_reconnect_sync(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut rx = self.network.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if online {
                            let report = orchestrator.sync_offline_transactions().await;
                            tracing::info!(synced = report.synced, remaining = report.remaining, "reconnect sync finished");
                        }
                    }
                }
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════════

    fn require_online(&self) -> Result<(), CashlessError> {
        if self.network.is_online() {
            Ok(())
        } else {
            Err(CashlessError::OfflineNotAllowed)
        }
    }

    /// Acquire the per-bracelet locks in a fixed order.
    async fn lock_bracelets(&self, ids: &[&str]) -> BraceletGuard<'_> {
        self.bracelet_locks.acquire(ids).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PER-BRACELET LOCKS
// ═══════════════════════════════════════════════════════════════════════════════

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// One async mutex per bracelet with a transaction in flight. Entries are
/// dropped again once nobody holds or waits for them.
#[derive(Default)]
struct BraceletLocks {
    locks: StdMutex<LockMap>,
}

impl BraceletLocks {
    async fn acquire(&self, ids: &[&str]) -> BraceletGuard<'_> {
        let mut ids: Vec<&str> = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mutexes: Vec<(String, Arc<Mutex<()>>)> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .map(|id| (id.to_string(), locks.entry(id.to_string()).or_default().clone()))
                .collect()
        };

        let mut held = Vec::with_capacity(mutexes.len());
        for (id, mutex) in mutexes {
            held.push((id, mutex.lock_owned().await));
        }
        BraceletGuard { owner: &self.locks, held }
    }

    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct BraceletGuard<'a> {
    owner: &'a StdMutex<LockMap>,
    held: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for BraceletGuard<'_> {
    fn drop(&mut self) {
        let ids: Vec<String> = self.held.drain(..).map(|(id, _guard)| id).collect();
        let mut locks = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            // The map holds the only reference once no task holds or awaits it.
            if locks.get(&id).map_or(false, |m| Arc::strong_count(m) == 1) {
                locks.remove(&id);
            }
        }
    }
}

fn ensure_positive(amount: MinorUnits) -> Result<(), CashlessError> {
    if amount == 0 {
        Err(CashlessError::InvalidAmount("amount must be greater than zero".into()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use cashless_nfc::SimulatedRadio;

    use super::*;
    use crate::config::TagSecurityConfig;
    use crate::error::LedgerError;
    use crate::ledger::LedgerReceipt;
    use crate::storage::MemoryStore;
    use crate::types::CashlessBalance;

    struct Unreachable;

    #[async_trait]
    impl Ledger for Unreachable {
        async fn fetch_balance(&self, _: &str) -> Result<CashlessBalance, LedgerError> {
            Err(LedgerError::Network("down".into()))
        }

        async fn submit_transaction(&self, _: &CashlessTransaction) -> Result<LedgerReceipt, LedgerError> {
            Err(LedgerError::Network("down".into()))
        }

        async fn list_transactions(&self, _: &str, _: usize) -> Result<Vec<CashlessTransaction>, LedgerError> {
            Ok(Vec::new())
        }
    }

    fn orchestrator() -> TransactionOrchestrator {
        let config = CashlessConfig {
            festival_id: "f1".into(),
            tag: TagSecurityConfig {
                encryption_key: "2a".repeat(32),
                signing_key: "17".repeat(32),
                ..Default::default()
            },
            ..Default::default()
        };
        TransactionOrchestrator::new(
            config,
            Collaborators {
                ledger: Arc::new(Unreachable),
                store: Arc::new(MemoryStore::new()),
                network: ConnectivityMonitor::new(false),
                session: SessionManager::new(Arc::new(SimulatedRadio::new())),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bracelet_locks_are_dropped_after_use() {
        let o = orchestrator();
        {
            let _guard = o.lock_bracelets(&["B", "A", "B"]).await;
            assert_eq!(o.bracelet_locks.tracked(), 2);
        }
        assert_eq!(o.bracelet_locks.tracked(), 0);

        // A rejected payment releases its lock as well.
        let result = o
            .process_payment(PaymentRequest {
                bracelet_id: "04A1".into(),
                amount: 100,
                ..Default::default()
            })
            .await;
        assert!(!result.success);
        assert_eq!(o.bracelet_locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_waiting_task_keeps_its_lock_entry() {
        let o = Arc::new(orchestrator());
        let first = o.lock_bracelets(&["A"]).await;

        let waiter = {
            let o = o.clone();
            tokio::spawn(async move {
                let _guard = o.lock_bracelets(&["A"]).await;
                o.bracelet_locks.tracked()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(o.bracelet_locks.tracked(), 1);

        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(o.bracelet_locks.tracked(), 0);
    }
}
