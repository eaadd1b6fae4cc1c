//! Durable queue of transactions made without the ledger.
//!
//! The whole list lives under one storage key and is persisted after every
//! mutation. Entries leave the queue only once the ledger has accepted them.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{LedgerError, StorageError};
use crate::ledger::Ledger;
use crate::storage::{get_json, set_json, KeyValueStore, OFFLINE_TRANSACTIONS_KEY};
use crate::types::{CashlessTransaction, SyncReport, SyncStatus, TransactionStatus};

/// Retry bookkeeping attached to a queued transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    pub attempts: u32,
    pub enqueued_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RetryJob {
    pub fn new(enqueued_at_ms: u64, timeout: Duration) -> Self {
        Self {
            attempts: 0,
            enqueued_at_ms,
            expires_at_ms: enqueued_at_ms.saturating_add(timeout.as_millis() as u64),
            last_error: None,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    #[serde(flatten)]
    pub transaction: CashlessTransaction,
    #[serde(default)]
    pub retry: RetryJob,
}

pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
    /// Guards load-modify-persist cycles on the stored list.
    list_lock: Mutex<()>,
    /// Only one drain runs at a time.
    sync_lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            list_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<QueuedTransaction>, StorageError> {
        Ok(get_json(self.store.as_ref(), OFFLINE_TRANSACTIONS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn persist(&self, entries: &[QueuedTransaction]) -> Result<(), StorageError> {
        set_json(self.store.as_ref(), OFFLINE_TRANSACTIONS_KEY, entries).await
    }

    /// Append a transaction together with a fresh retry job.
    pub async fn enqueue(&self, transaction: CashlessTransaction) -> Result<QueuedTransaction, StorageError> {
        let _guard = self.list_lock.lock().await;
        let mut entries = self.load().await?;
        let key = transaction.queue_key().to_string();
        if let Some(existing) = entries.iter().find(|e| e.transaction.queue_key() == key) {
            tracing::debug!(offline_id = %key, "transaction already queued");
            return Ok(existing.clone());
        }

        let queued = QueuedTransaction {
            retry: RetryJob::new(crate::now_ms(), self.timeout),
            transaction,
        };
        entries.push(queued.clone());
        self.persist(&entries).await?;
        tracing::info!(
            offline_id = %key,
            bracelet_id = %queued.transaction.bracelet_id,
            amount = queued.transaction.amount,
            queue_len = entries.len(),
            "transaction queued for sync"
        );
        Ok(queued)
    }

    pub async fn all(&self) -> Result<Vec<QueuedTransaction>, StorageError> {
        let _guard = self.list_lock.lock().await;
        self.load().await
    }

    pub async fn pending(&self) -> Result<Vec<QueuedTransaction>, StorageError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|e| e.transaction.sync_status == SyncStatus::Pending)
            .collect())
    }

    /// Queued transactions of one bracelet, newest first.
    pub async fn for_bracelet(&self, bracelet_id: &str, limit: usize) -> Result<Vec<CashlessTransaction>, StorageError> {
        let mut matching: Vec<CashlessTransaction> = self
            .all()
            .await?
            .into_iter()
            .map(|e| e.transaction)
            .filter(|tx| tx.bracelet_id == bracelet_id)
            .collect();
        matching.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        matching.truncate(limit);
        Ok(matching)
    }

    pub async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.all().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Submit every pending entry to the ledger.
    ///
    /// Accepted entries adopt the ledger's id and are dropped from the
    /// queue. Rejected entries stay as `failed` for external remediation.
    /// Transport failures leave the entry pending with its attempt count
    /// bumped. Entries past their retry window are still submitted but
    /// counted as `expired` and logged. Submissions run without holding
    /// the list lock so that new offline payments can be queued meanwhile.
    pub async fn sync(&self, ledger: &dyn Ledger) -> Result<SyncReport, StorageError> {
        let _sync = self.sync_lock.lock().await;
        let pending = self.pending().await?;
        let mut report = SyncReport {
            attempted: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            report.remaining = self.len().await?;
            return Ok(report);
        }

        let now = crate::now_ms();
        let mut outcomes: Vec<(String, Result<CashlessTransaction, LedgerError>)> = Vec::with_capacity(pending.len());
        for entry in pending {
            let key = entry.transaction.queue_key().to_string();
            // Still submitted: the tag was already debited.
            if entry.retry.is_expired(now) {
                report.expired += 1;
                tracing::warn!(
                    offline_id = %key,
                    attempts = entry.retry.attempts,
                    overdue_ms = now - entry.retry.expires_at_ms,
                    "offline transaction past its retry window"
                );
            }
            let outcome = ledger
                .submit_transaction(&entry.transaction)
                .await
                .map(|receipt| {
                    let mut tx = entry.transaction;
                    if let Some(id) = receipt.id {
                        tx.id = id;
                    }
                    if receipt.signature.is_some() {
                        tx.signature = receipt.signature;
                    }
                    tx.status = TransactionStatus::Completed;
                    tx.sync_status = SyncStatus::Synced;
                    tx
                });
            if let Err(e) = &outcome {
                tracing::warn!(offline_id = %key, error = %e, "offline transaction sync failed");
            }
            outcomes.push((key, outcome));
        }

        let _guard = self.list_lock.lock().await;
        let mut entries = self.load().await?;
        for (key, outcome) in outcomes {
            let Some(entry) = entries.iter_mut().find(|e| e.transaction.queue_key() == key) else {
                continue;
            };
            entry.retry.attempts = entry.retry.attempts.saturating_add(1);
            match outcome {
                Ok(synced) => {
                    entry.transaction = synced;
                    entry.retry.last_error = None;
                    report.synced += 1;
                }
                Err(e) if e.is_rejection() => {
                    entry.transaction.status = TransactionStatus::Failed;
                    entry.transaction.sync_status = SyncStatus::Failed;
                    entry.retry.last_error = Some(e.to_string());
                    report.failed += 1;
                    report.error.get_or_insert_with(|| e.to_string());
                    report.error_code.get_or_insert(e.code());
                }
                Err(e) => {
                    entry.retry.last_error = Some(e.to_string());
                    report.retry_later += 1;
                    report.error.get_or_insert_with(|| e.to_string());
                    report.error_code.get_or_insert(e.code());
                }
            }
        }

        entries.retain(|e| e.transaction.sync_status != SyncStatus::Synced);
        self.persist(&entries).await?;
        report.remaining = entries.len();

        tracing::info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            retry_later = report.retry_later,
            expired = report.expired,
            remaining = report.remaining,
            "offline queue sync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerReceipt;
    use crate::storage::MemoryStore;
    use crate::types::{CashlessBalance, NewTransaction, TransactionType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLedger {
        calls: AtomicUsize,
        fail_with: std::sync::Mutex<Option<LedgerError>>,
    }

    #[async_trait]
    impl Ledger for CountingLedger {
        async fn fetch_balance(&self, _: &str) -> Result<CashlessBalance, LedgerError> {
            Err(LedgerError::Network("unused".into()))
        }

        async fn submit_transaction(&self, _: &CashlessTransaction) -> Result<LedgerReceipt, LedgerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.fail_with.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(LedgerReceipt {
                id: Some(format!("srv-{n}")),
                signature: Some("sig".into()),
            })
        }

        async fn list_transactions(&self, _: &str, _: usize) -> Result<Vec<CashlessTransaction>, LedgerError> {
            Ok(Vec::new())
        }
    }

    fn offline_tx(offline_id: &str) -> CashlessTransaction {
        let mut tx = CashlessTransaction::open(NewTransaction {
            transaction_type: TransactionType::Payment,
            amount: 100,
            previous_balance: 1_000,
            currency: "EUR",
            bracelet_id: "B1",
            festival_id: "f1",
            vendor_id: Some("v1"),
        })
        .unwrap();
        tx.id = offline_id.to_string();
        tx.offline_id = Some(offline_id.to_string());
        tx.status = TransactionStatus::Pending;
        tx
    }

    fn queue() -> OfflineQueue {
        OfflineQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_enqueue_persists_retry_job() {
        let queue = queue();
        let queued = queue.enqueue(offline_tx("off_1")).await.unwrap();
        assert_eq!(queued.retry.attempts, 0);
        assert_eq!(queued.retry.expires_at_ms - queued.retry.enqueued_at_ms, 30_000);

        queue.enqueue(offline_tx("off_1")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_drops_synced_entries() {
        let queue = queue();
        queue.enqueue(offline_tx("off_1")).await.unwrap();
        queue.enqueue(offline_tx("off_2")).await.unwrap();
        let ledger = CountingLedger::default();

        let report = queue.sync(&ledger).await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.remaining, 0);
        assert!(queue.is_empty().await.unwrap());

        let again = queue.sync(&ledger).await.unwrap();
        assert_eq!(again.attempted, 0);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_entry_pending() {
        let queue = queue();
        queue.enqueue(offline_tx("off_1")).await.unwrap();
        let ledger = CountingLedger::default();
        *ledger.fail_with.lock().unwrap() = Some(LedgerError::Network("down".into()));

        let report = queue.sync(&ledger).await.unwrap();
        assert_eq!(report.retry_later, 1);
        assert_eq!(report.error_code, Some(cashless_codec::ErrorCode::NetworkError));

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry.attempts, 1);
        assert!(pending[0].retry.last_error.as_deref().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_rejection_marks_failed_and_stops_retrying() {
        let queue = queue();
        queue.enqueue(offline_tx("off_1")).await.unwrap();
        let ledger = CountingLedger::default();
        *ledger.fail_with.lock().unwrap() = Some(LedgerError::Server {
            status: 409,
            code: Some("DUPLICATE".into()),
            message: "seen".into(),
        });

        let report = queue.sync(&ledger).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);

        let entries = queue.all().await.unwrap();
        assert_eq!(entries[0].transaction.sync_status, SyncStatus::Failed);
        assert_eq!(entries[0].transaction.status, TransactionStatus::Failed);

        queue.sync(&ledger).await.unwrap();
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_counted_and_still_submitted() {
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()), Duration::ZERO);
        queue.enqueue(offline_tx("off_1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let ledger = CountingLedger::default();
        *ledger.fail_with.lock().unwrap() = Some(LedgerError::Network("down".into()));

        let report = queue.sync(&ledger).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.retry_later, 1);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);

        *ledger.fail_with.lock().unwrap() = None;
        let report = queue.sync(&ledger).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.synced, 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_entries_are_not_expired() {
        let queue = queue();
        queue.enqueue(offline_tx("off_1")).await.unwrap();
        let report = queue.sync(&CountingLedger::default()).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let queue = queue();
        let mut older = offline_tx("off_a");
        older.timestamp_ms = 1;
        let mut newer = offline_tx("off_b");
        newer.timestamp_ms = 2;
        queue.enqueue(older).await.unwrap();
        queue.enqueue(newer).await.unwrap();

        let history = queue.for_bracelet("B1", 10).await.unwrap();
        assert_eq!(history[0].id, "off_b");
        assert_eq!(queue.for_bracelet("B1", 1).await.unwrap().len(), 1);
        assert!(queue.for_bracelet("B2", 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_wire_shape_is_flat() {
        let queued = QueuedTransaction {
            transaction: offline_tx("off_1"),
            retry: RetryJob::new(10, Duration::from_secs(1)),
        };
        let json = serde_json::to_value(&queued).unwrap();
        assert_eq!(json["offlineId"], "off_1");
        assert_eq!(json["retry"]["expiresAtMs"], 1_010);
        assert!(!queued.retry.is_expired(1_010));
        assert!(queued.retry.is_expired(1_011));
    }
}
