//! # cashless-core: balances, transactions and the offline queue
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      TransactionOrchestrator                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   tap ──► TagReader ──► BalanceAuthority ──► validate + decide       │
//! │                          │  ledger > cache > tag      │              │
//! │                          ▼                            ▼              │
//! │                    KeyValueStore          online: Ledger (HTTP)      │
//! │                                           offline: OfflineQueue      │
//! │                                                       │              │
//! │              TagWriter ◄── cache update ◄── commit ◄──┘              │
//! │                                                                      │
//! │   ConnectivityMonitor: offline ──► online triggers a queue sync      │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Amounts are integer minor units throughout. Business rejections come back
//! as [`TransactionResult`]s carrying a stable [`ErrorCode`]; only malformed
//! configuration fails construction.
//!
//! [`ErrorCode`]: cashless_codec::ErrorCode

pub mod balance;
pub mod config;
pub mod error;
pub mod ledger;
pub mod network;
pub mod orchestrator;
pub mod queue;
pub mod storage;
pub mod types;

pub use balance::{BalanceAuthority, DailyTotals};
pub use config::{CashlessConfig, ConfigOverrides, TagSecurityConfig, ENV_PREFIX};
pub use error::{CashlessError, LedgerError, StorageError};
pub use ledger::{HttpLedger, HttpLedgerConfig, Ledger, LedgerReceipt};
pub use network::ConnectivityMonitor;
pub use orchestrator::{Collaborators, TransactionOrchestrator};
pub use queue::{OfflineQueue, QueuedTransaction, RetryJob};
pub use storage::{
    bracelet_cache_key, get_json, set_json, KeyValueStore, MemoryStore, SledStore,
    DAILY_TOTALS_KEY, OFFLINE_TRANSACTIONS_KEY,
};
pub use types::{
    BalanceSource, CashlessBalance, CashlessEvent, CashlessTransaction, HistorySource,
    NewTransaction, PaymentRequest, RefundRequest, ResolvedBalance, SyncReport, SyncStatus,
    TopupRequest, TransactionHistory, TransactionResult, TransactionStatus, TransactionType,
    TransferRequest,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
