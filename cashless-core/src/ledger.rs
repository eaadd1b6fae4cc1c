//! Remote ledger client.
//!
//! ```text
//!   GET  /api/cashless/balance/{braceletId}          -> CashlessBalance
//!   POST /api/cashless/transaction                   -> { id, signature, .. }
//!   GET  /api/cashless/transactions?braceletId&limit -> { transactions: [..] }
//! ```
//!
//! Every request carries `Content-Type: application/json` and, when a token
//! is configured, `Authorization: Bearer <token>`. Error bodies are
//! `{ message, code }`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CashlessConfig;
use crate::error::{CashlessError, LedgerError};
use crate::types::{CashlessBalance, CashlessTransaction};

/// What the ledger returns for an accepted transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn fetch_balance(&self, bracelet_id: &str) -> Result<CashlessBalance, LedgerError>;

    async fn submit_transaction(
        &self,
        transaction: &CashlessTransaction,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn list_transactions(
        &self,
        bracelet_id: &str,
        limit: usize,
    ) -> Result<Vec<CashlessTransaction>, LedgerError>;

    /// Cheap reachability probe used by the connectivity monitor.
    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

const MAX_BACKOFF_MS: u64 = 30_000;

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct HttpLedgerConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    /// Attempts per request, including the first.
    pub max_retries: u32,
}

impl Default for HttpLedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl HttpLedgerConfig {
    pub fn from_cashless(config: &CashlessConfig) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            auth_token: config.auth_token.clone(),
            timeout: config.request_timeout(),
            ..Default::default()
        }
    }
}

pub struct HttpLedger {
    config: HttpLedgerConfig,
    base_url: Url,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct TransactionList {
    #[serde(default)]
    transactions: Vec<CashlessTransaction>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: Option<String>,
    error: Option<String>,
    code: Option<String>,
}

impl HttpLedger {
    pub fn new(config: HttpLedgerConfig) -> Result<Self, CashlessError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| CashlessError::InvalidConfig(format!("ledger url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(CashlessError::InvalidConfig(format!(
                "ledger url {} cannot carry a path",
                config.base_url
            )));
        }
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CashlessError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            config,
            base_url,
            http_client,
        })
    }

    pub fn from_config(config: &CashlessConfig) -> Result<Self, CashlessError> {
        Self::new(HttpLedgerConfig::from_cashless(config))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, LedgerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LedgerError::Network(format!("invalid ledger url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn prepare(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HTTP HELPERS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Send with backoff. Throttling is always retried; transport failures
    /// are retried only for `idempotent` requests or when the connection was
    /// never established.
    async fn send<T, F>(&self, build: F, idempotent: bool) -> Result<T, LedgerError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let backoff = backoff_delay(attempt);
            match self.prepare(build()).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json()
                        .await
                        .map_err(|e| LedgerError::InvalidResponse(e.to_string()));
                }
                Ok(response) if response.status().as_u16() == 429 => {
                    last_error = Some(LedgerError::Server {
                        status: 429,
                        code: None,
                        message: "rate limited".into(),
                    });
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(server_error(status.as_u16(), &body));
                }
                Err(e) => {
                    let retryable = idempotent || e.is_connect();
                    last_error = Some(LedgerError::Network(e.to_string()));
                    if !retryable {
                        break;
                    }
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LedgerError::Network("max retries exceeded".into())))
    }
}

/// Exponential backoff from 100ms, capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(millis.min(MAX_BACKOFF_MS))
}

fn server_error(status: u16, body: &str) -> LedgerError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => LedgerError::Server {
            status,
            code: parsed.code,
            message: parsed
                .message
                .or(parsed.error)
                .unwrap_or_else(|| format!("HTTP {status}")),
        },
        Err(_) => LedgerError::Server {
            status,
            code: None,
            message: if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.to_string()
            },
        },
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn fetch_balance(&self, bracelet_id: &str) -> Result<CashlessBalance, LedgerError> {
        let url = self.endpoint(&["api", "cashless", "balance", bracelet_id])?;
        self.send(|| self.http_client.get(url.clone()), true).await
    }

    async fn submit_transaction(
        &self,
        transaction: &CashlessTransaction,
    ) -> Result<LedgerReceipt, LedgerError> {
        let url = self.endpoint(&["api", "cashless", "transaction"])?;
        let receipt: LedgerReceipt = self
            .send(|| self.http_client.post(url.clone()).json(transaction), false)
            .await?;
        tracing::debug!(transaction_id = %transaction.id, assigned = ?receipt.id, "ledger accepted transaction");
        Ok(receipt)
    }

    async fn list_transactions(
        &self,
        bracelet_id: &str,
        limit: usize,
    ) -> Result<Vec<CashlessTransaction>, LedgerError> {
        let mut url = self.endpoint(&["api", "cashless", "transactions"])?;
        url.query_pairs_mut()
            .append_pair("braceletId", bracelet_id)
            .append_pair("limit", &limit.to_string());
        let list: TransactionList = self.send(|| self.http_client.get(url.clone()), true).await?;

        for tx in list.transactions.iter().filter(|tx| !tx.balance_invariant_holds()) {
            tracing::warn!(transaction_id = %tx.id, "ledger returned a transaction with inconsistent balances");
        }
        Ok(list.transactions)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        let url = self.endpoint(&["api", "cashless", "health"])?;
        // Any HTTP answer proves the ledger is reachable.
        self.prepare(self.http_client.get(url))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| LedgerError::Network(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(base: &str) -> HttpLedger {
        HttpLedger::new(HttpLedgerConfig {
            base_url: base.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoints_respect_base_path() {
        let plain = ledger("http://ledger.local");
        assert_eq!(
            plain.endpoint(&["api", "cashless", "balance", "04A2"]).unwrap().as_str(),
            "http://ledger.local/api/cashless/balance/04A2"
        );

        let prefixed = ledger("https://ledger.local/v2/");
        assert_eq!(
            prefixed.endpoint(&["api", "cashless", "transaction"]).unwrap().as_str(),
            "https://ledger.local/v2/api/cashless/transaction"
        );
    }

    #[test]
    fn test_bracelet_id_is_escaped() {
        let url = ledger("http://ledger.local")
            .endpoint(&["api", "cashless", "balance", "a/b"])
            .unwrap();
        assert!(url.as_str().ends_with("/balance/a%2Fb"));
    }

    #[test]
    fn test_server_error_parsing() {
        let err = server_error(422, r#"{"message":"limit","code":"DAILY_LIMIT"}"#);
        assert_eq!(
            err,
            LedgerError::Server {
                status: 422,
                code: Some("DAILY_LIMIT".into()),
                message: "limit".into()
            }
        );
        assert!(err.is_rejection());

        let err = server_error(502, "bad gateway");
        assert!(matches!(err, LedgerError::Server { status: 502, ref message, .. } if message == "bad gateway"));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(64), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(HttpLedger::new(HttpLedgerConfig {
            base_url: "mailto:ledger@example.com".into(),
            ..Default::default()
        })
        .is_err());
    }
}
