//! Balances, transactions, requests and results.

use std::fmt;

use cashless_codec::{CashlessAccount, ErrorCode, MinorUnits};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CashlessError;

// ═══════════════════════════════════════════════════════════════════════════════
// BALANCES
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconciled balance the orchestrator trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashlessBalance {
    pub bracelet_id: String,
    pub balance: MinorUnits,
    pub currency: String,
    pub last_updated: DateTime<Utc>,
    pub festival_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<MinorUnits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_spent: Option<MinorUnits>,
}

fn default_active() -> bool {
    true
}

impl CashlessBalance {
    /// Best-effort view built from on-tag data. Carries no daily-limit data.
    pub fn from_tag(
        bracelet_id: impl Into<String>,
        account: &CashlessAccount,
        festival_id: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            bracelet_id: bracelet_id.into(),
            balance: account.balance,
            currency: currency.into(),
            last_updated: Utc::now(),
            festival_id: festival_id.into(),
            user_id: account.linked_user_id.clone(),
            is_active: account.is_active(),
            daily_limit: None,
            daily_spent: None,
        }
    }

    /// Amount still spendable today under the daily limit, if one is set.
    pub fn remaining_daily_allowance(&self) -> Option<MinorUnits> {
        self.daily_limit
            .map(|limit| limit.saturating_sub(self.daily_spent.unwrap_or(0)))
    }
}

/// Which tier a balance was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceSource {
    Ledger,
    Cache,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBalance {
    pub balance: CashlessBalance,
    pub source: BalanceSource,
    /// Cache entry older than the configured maximum age.
    pub stale: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Payment,
    Topup,
    Refund,
    Transfer,
}

impl TransactionType {
    /// Payments and transfers take money off the bracelet.
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::Payment | TransactionType::Transfer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Payment => "payment",
            TransactionType::Topup => "topup",
            TransactionType::Refund => "refund",
            TransactionType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Failed,
}

/// A money movement on one bracelet.
///
/// The balance pair is fixed at construction so that `new_balance` always
/// equals `previous_balance` minus the amount for debits and plus the amount
/// for credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashlessTransaction {
    pub id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: MinorUnits,
    pub currency: String,
    pub bracelet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    pub festival_id: String,
    pub status: TransactionStatus,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_id: Option<String>,
    pub sync_status: SyncStatus,
    previous_balance: MinorUnits,
    new_balance: MinorUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Destination bracelet of a transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_bracelet_id: Option<String>,
    /// Transaction a refund reverses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
}

/// Fields needed to open a transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction<'a> {
    pub transaction_type: TransactionType,
    pub amount: MinorUnits,
    pub previous_balance: MinorUnits,
    pub currency: &'a str,
    pub bracelet_id: &'a str,
    pub festival_id: &'a str,
    pub vendor_id: Option<&'a str>,
}

impl CashlessTransaction {
    /// Open a transaction in `processing` state.
    pub fn open(spec: NewTransaction<'_>) -> Result<Self, CashlessError> {
        if spec.amount == 0 {
            return Err(CashlessError::InvalidAmount(
                "amount must be greater than zero".into(),
            ));
        }
        let new_balance = if spec.transaction_type.is_debit() {
            spec.previous_balance
                .checked_sub(spec.amount)
                .ok_or(CashlessError::InsufficientBalance {
                    available: spec.previous_balance,
                    requested: spec.amount,
                })?
        } else {
            spec.previous_balance
                .checked_add(spec.amount)
                .ok_or_else(|| CashlessError::InvalidAmount("balance would overflow".into()))?
        };

        Ok(Self {
            id: format!("tx_{}", uuid::Uuid::new_v4().simple()),
            transaction_type: spec.transaction_type,
            amount: spec.amount,
            currency: spec.currency.to_string(),
            bracelet_id: spec.bracelet_id.to_string(),
            vendor_id: spec.vendor_id.map(str::to_string),
            festival_id: spec.festival_id.to_string(),
            status: TransactionStatus::Processing,
            timestamp_ms: Utc::now().timestamp_millis().max(0) as u64,
            offline_id: None,
            sync_status: SyncStatus::Pending,
            previous_balance: spec.previous_balance,
            new_balance,
            signature: None,
            counterparty_bracelet_id: None,
            original_transaction_id: None,
        })
    }

    pub fn previous_balance(&self) -> MinorUnits {
        self.previous_balance
    }

    pub fn new_balance(&self) -> MinorUnits {
        self.new_balance
    }

    /// Check the balance pair of a transaction that came from outside.
    pub fn balance_invariant_holds(&self) -> bool {
        let expected = if self.transaction_type.is_debit() {
            self.previous_balance.checked_sub(self.amount)
        } else {
            self.previous_balance.checked_add(self.amount)
        };
        expected == Some(self.new_balance)
    }

    /// Bytes covered by the local integrity signature of a queued transaction.
    pub fn signing_input(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.offline_id.as_deref().unwrap_or(&self.id),
            self.transaction_type,
            self.amount,
            self.currency,
            self.bracelet_id,
            self.previous_balance,
            self.new_balance,
            self.timestamp_ms
        )
    }

    /// Key that identifies this transaction inside the offline queue.
    pub fn queue_key(&self) -> &str {
        self.offline_id.as_deref().unwrap_or(&self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct PaymentRequest {
    pub bracelet_id: String,
    pub amount: MinorUnits,
    /// Falls back to the configured vendor.
    pub vendor_id: Option<String>,
    /// Falls back to the configured festival.
    pub festival_id: Option<String>,
    /// Account just read off the tag, used when no better source exists.
    pub tag_account: Option<CashlessAccount>,
}

#[derive(Debug, Clone, Default)]
pub struct TopupRequest {
    pub bracelet_id: String,
    pub amount: MinorUnits,
    pub tag_account: Option<CashlessAccount>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub from_bracelet_id: String,
    pub to_bracelet_id: String,
    pub amount: MinorUnits,
    pub tag_account: Option<CashlessAccount>,
}

#[derive(Debug, Clone, Default)]
pub struct RefundRequest {
    pub bracelet_id: String,
    pub amount: MinorUnits,
    pub original_transaction_id: Option<String>,
    pub tag_account: Option<CashlessAccount>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESULTS AND EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a payment, topup, transfer or refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub success: bool,
    pub transaction: Option<CashlessTransaction>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
}

impl TransactionResult {
    pub fn completed(transaction: CashlessTransaction) -> Self {
        Self {
            success: true,
            transaction: Some(transaction),
            error: None,
            error_code: None,
        }
    }

    pub fn rejected(error: &CashlessError) -> Self {
        Self {
            success: false,
            transaction: None,
            error: Some(error.to_string()),
            error_code: Some(error.code()),
        }
    }

    /// Queued for later confirmation by the ledger.
    pub fn is_offline(&self) -> bool {
        self.transaction
            .as_ref()
            .map_or(false, |tx| tx.sync_status == SyncStatus::Pending)
    }
}

/// Outcome of draining the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Still pending after a transport failure.
    pub retry_later: usize,
    /// Attempted entries whose retry window had already closed.
    pub expired: usize,
    /// Entries left in the queue afterwards.
    pub remaining: usize,
    pub skipped_offline: bool,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
}

/// Where a history listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Ledger,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistory {
    pub success: bool,
    pub source: HistorySource,
    pub transactions: Vec<CashlessTransaction>,
    pub error: Option<String>,
}

/// Published on the orchestrator's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CashlessEvent {
    TransactionCompleted(CashlessTransaction),
    TransactionQueued(CashlessTransaction),
    TransactionFailed {
        bracelet_id: String,
        code: ErrorCode,
        message: String,
    },
    SyncFinished(SyncReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(kind: TransactionType, amount: MinorUnits, previous: MinorUnits) -> Result<CashlessTransaction, CashlessError> {
        CashlessTransaction::open(NewTransaction {
            transaction_type: kind,
            amount,
            previous_balance: previous,
            currency: "EUR",
            bracelet_id: "04A2",
            festival_id: "f1",
            vendor_id: Some("v1"),
        })
    }

    #[test]
    fn test_balance_invariant_per_type() {
        let payment = open(TransactionType::Payment, 3000, 5000).unwrap();
        assert_eq!(payment.new_balance(), 2000);
        let transfer = open(TransactionType::Transfer, 5000, 5000).unwrap();
        assert_eq!(transfer.new_balance(), 0);
        let topup = open(TransactionType::Topup, 2000, 5000).unwrap();
        assert_eq!(topup.new_balance(), 7000);
        let refund = open(TransactionType::Refund, 1, 0).unwrap();
        assert_eq!(refund.new_balance(), 1);
        for tx in [payment, transfer, topup, refund] {
            assert!(tx.balance_invariant_holds());
            assert_eq!(tx.status, TransactionStatus::Processing);
        }
    }

    #[test]
    fn test_open_rejects_overdraft_and_zero() {
        assert!(matches!(
            open(TransactionType::Payment, 8000, 5000),
            Err(CashlessError::InsufficientBalance { available: 5000, requested: 8000 })
        ));
        assert!(matches!(
            open(TransactionType::Topup, 0, 5000),
            Err(CashlessError::InvalidAmount(_))
        ));
        assert!(open(TransactionType::Topup, 1, MinorUnits::MAX).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let tx = open(TransactionType::Payment, 300, 500).unwrap();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "payment");
        assert_eq!(json["previousBalance"], 500);
        assert_eq!(json["newBalance"], 200);
        assert_eq!(json["syncStatus"], "pending");
        let back: CashlessTransaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_tampered_transaction_fails_invariant() {
        let tx = open(TransactionType::Payment, 300, 500).unwrap();
        let mut json = serde_json::to_value(&tx).unwrap();
        json["newBalance"] = serde_json::json!(400);
        let tampered: CashlessTransaction = serde_json::from_value(json).unwrap();
        assert!(!tampered.balance_invariant_holds());
    }

    #[test]
    fn test_remaining_daily_allowance() {
        let account = CashlessAccount::new("acc", 100);
        let mut balance = CashlessBalance::from_tag("04A2", &account, "f1", "EUR");
        assert_eq!(balance.remaining_daily_allowance(), None);
        balance.daily_limit = Some(500);
        balance.daily_spent = Some(450);
        assert_eq!(balance.remaining_daily_allowance(), Some(50));
    }
}
