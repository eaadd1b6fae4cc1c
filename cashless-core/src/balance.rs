//! Tiered balance resolution.
//!
//! ```text
//!   online? ──yes──► ledger ──ok──► refresh cache ──► Ledger
//!      │               │
//!      no            error
//!      ▼               ▼
//!   cache entry? ──yes──────────────────────────────► Cache (maybe stale)
//!      │
//!      no
//!      ▼
//!   account read off the tag? ──yes─────────────────► Tag (no daily limit)
//!      │
//!      no ─────────────────────────────────────────► BalanceUnavailable
//! ```
//!
//! Tiers are never merged: the first one that answers wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use cashless_codec::{CashlessAccount, MinorUnits};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::CashlessConfig;
use crate::error::{CashlessError, StorageError};
use crate::ledger::Ledger;
use crate::network::ConnectivityMonitor;
use crate::storage::{bracelet_cache_key, get_json, set_json, KeyValueStore, DAILY_TOTALS_KEY};
use crate::types::{BalanceSource, CashlessBalance, CashlessTransaction, ResolvedBalance, TransactionType};

/// Per-bracelet payment totals for one UTC day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTotals {
    pub day: Option<NaiveDate>,
    #[serde(default)]
    pub totals: BTreeMap<String, MinorUnits>,
}

impl DailyTotals {
    /// Totals for `today`, discarding a previous day's figures.
    fn for_day(mut self, today: NaiveDate) -> Self {
        if self.day != Some(today) {
            self.day = Some(today);
            self.totals.clear();
        }
        self
    }

    pub fn spent(&self, bracelet_id: &str) -> MinorUnits {
        self.totals.get(bracelet_id).copied().unwrap_or(0)
    }
}

pub struct BalanceAuthority {
    config: Arc<CashlessConfig>,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn KeyValueStore>,
    network: ConnectivityMonitor,
    /// Serializes cache and daily-total read-modify-write cycles.
    cache_lock: Mutex<()>,
}

impl BalanceAuthority {
    pub fn new(
        config: Arc<CashlessConfig>,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn KeyValueStore>,
        network: ConnectivityMonitor,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            network,
            cache_lock: Mutex::new(()),
        }
    }

    /// Resolve the most authoritative balance available for `bracelet_id`.
    ///
    /// `tag_account` is the account just read off the bracelet, used only
    /// when neither the ledger nor the cache can answer.
    pub async fn read_balance(
        &self,
        bracelet_id: &str,
        tag_account: Option<&CashlessAccount>,
    ) -> Result<ResolvedBalance, CashlessError> {
        if self.network.is_online() {
            match self.ledger.fetch_balance(bracelet_id).await {
                Ok(balance) => {
                    let _guard = self.cache_lock.lock().await;
                    if let Err(e) = set_json(self.store.as_ref(), &bracelet_cache_key(bracelet_id), &balance).await {
                        tracing::warn!(bracelet_id = %bracelet_id, error = %e, "failed to refresh balance cache");
                    }
                    return Ok(ResolvedBalance {
                        balance,
                        source: BalanceSource::Ledger,
                        stale: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(bracelet_id = %bracelet_id, error = %e, "ledger balance unavailable, falling back to cache");
                }
            }
        }

        match self.cached_with_daily_spend(bracelet_id).await {
            Ok(Some(balance)) => {
                let stale = self.is_stale(balance.last_updated);
                if stale {
                    tracing::debug!(bracelet_id = %bracelet_id, last_updated = %balance.last_updated, "using stale cached balance");
                }
                return Ok(ResolvedBalance {
                    balance,
                    source: BalanceSource::Cache,
                    stale,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(bracelet_id = %bracelet_id, error = %e, "balance cache unreadable");
            }
        }

        match tag_account {
            Some(account) => Ok(ResolvedBalance {
                balance: CashlessBalance::from_tag(
                    bracelet_id,
                    account,
                    self.config.festival_id.clone(),
                    self.config.currency.clone(),
                ),
                source: BalanceSource::Tag,
                stale: false,
            }),
            None => Err(CashlessError::BalanceUnavailable(bracelet_id.to_string())),
        }
    }

    /// Apply a completed or queued transaction to the local cache so that an
    /// offline read reflects it.
    pub async fn update_cached_balance(
        &self,
        transaction: &CashlessTransaction,
    ) -> Result<CashlessBalance, CashlessError> {
        let _guard = self.cache_lock.lock().await;
        let now = Utc::now();
        let today = now.date_naive();
        let key = bracelet_cache_key(&transaction.bracelet_id);
        let is_payment = transaction.transaction_type == TransactionType::Payment;

        let cached: Option<CashlessBalance> = get_json(self.store.as_ref(), &key).await?;
        let balance = match cached {
            Some(mut balance) => {
                if balance.last_updated.date_naive() != today && balance.daily_spent.is_some() {
                    balance.daily_spent = Some(0);
                }
                balance.balance = if transaction.transaction_type.is_debit() {
                    balance.balance.saturating_sub(transaction.amount)
                } else {
                    balance.balance.saturating_add(transaction.amount)
                };
                if is_payment {
                    balance.daily_spent =
                        Some(balance.daily_spent.unwrap_or(0).saturating_add(transaction.amount));
                }
                balance.last_updated = now;
                balance
            }
            None => CashlessBalance {
                bracelet_id: transaction.bracelet_id.clone(),
                balance: transaction.new_balance(),
                currency: transaction.currency.clone(),
                last_updated: now,
                festival_id: transaction.festival_id.clone(),
                user_id: None,
                is_active: true,
                daily_limit: None,
                daily_spent: is_payment.then_some(transaction.amount),
            },
        };
        set_json(self.store.as_ref(), &key, &balance).await?;

        if is_payment {
            let mut totals = self.load_daily_totals(today).await?;
            let entry = totals.totals.entry(transaction.bracelet_id.clone()).or_insert(0);
            *entry = entry.saturating_add(transaction.amount);
            set_json(self.store.as_ref(), DAILY_TOTALS_KEY, &totals).await?;
        }

        tracing::debug!(
            bracelet_id = %transaction.bracelet_id,
            balance = balance.balance,
            transaction_type = %transaction.transaction_type,
            "cached balance updated"
        );
        Ok(balance)
    }

    /// The raw cache entry, if any.
    pub async fn cached_balance(&self, bracelet_id: &str) -> Result<Option<CashlessBalance>, StorageError> {
        get_json(self.store.as_ref(), &bracelet_cache_key(bracelet_id)).await
    }

    /// Drop the cache entry so the next offline read falls through to the tag.
    pub async fn invalidate(&self, bracelet_id: &str) -> Result<(), StorageError> {
        let _guard = self.cache_lock.lock().await;
        self.store.remove(&bracelet_cache_key(bracelet_id)).await
    }

    /// Payments recorded locally for `bracelet_id` today (UTC).
    pub async fn daily_spent_today(&self, bracelet_id: &str) -> Result<MinorUnits, StorageError> {
        Ok(self
            .load_daily_totals(Utc::now().date_naive())
            .await?
            .spent(bracelet_id))
    }

    async fn cached_with_daily_spend(&self, bracelet_id: &str) -> Result<Option<CashlessBalance>, StorageError> {
        let Some(mut balance) = self.cached_balance(bracelet_id).await? else {
            return Ok(None);
        };
        let today = Utc::now().date_naive();
        let cached_today = if balance.last_updated.date_naive() == today {
            balance.daily_spent.unwrap_or(0)
        } else {
            0
        };
        let local_today = self.daily_spent_today(bracelet_id).await?;
        balance.daily_spent = Some(cached_today.max(local_today));
        Ok(Some(balance))
    }

    async fn load_daily_totals(&self, today: NaiveDate) -> Result<DailyTotals, StorageError> {
        let totals: Option<DailyTotals> = get_json(self.store.as_ref(), DAILY_TOTALS_KEY).await?;
        Ok(totals.unwrap_or_default().for_day(today))
    }

    fn is_stale(&self, last_updated: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(last_updated);
        age.to_std()
            .map(|age| age > self.config.cache_max_age())
            .unwrap_or(false)
    }
}
