//! Terminal configuration.
//!
//! Values come from an optional TOML file layered under `CASHLESS_`-prefixed
//! environment variables; nested keys use `__` (for example
//! `CASHLESS_TAG__SIGNING_KEY`). A loaded config is never mutated: use
//! [`CashlessConfig::with_overrides`] to derive a new value.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use cashless_codec::{MinorUnits, TagKeys};
use cashless_nfc::TagPolicy;
use serde::{Deserialize, Serialize};

use crate::error::CashlessError;

pub const ENV_PREFIX: &str = "CASHLESS";

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashlessConfig {
    /// Base URL of the ledger API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Bearer token sent with every ledger request.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default)]
    pub festival_id: String,

    /// Vendor charged when a payment request names none.
    #[serde(default)]
    pub vendor_id: Option<String>,

    /// ISO 4217 code.
    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default = "default_true")]
    pub enable_offline_payments: bool,

    /// Largest single payment accepted without the ledger, in minor units.
    #[serde(default = "default_offline_limit")]
    pub offline_limit: MinorUnits,

    /// Lifetime of an offline retry job.
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,

    /// Amounts above this need a PIN collected by the caller.
    #[serde(default = "default_require_pin_above")]
    pub require_pin_above: MinorUnits,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Write the new balance back to the bracelet after each transaction.
    #[serde(default = "default_true")]
    pub update_tag_after_transaction: bool,

    /// Cached balances older than this are reported as stale.
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,

    #[serde(default)]
    pub tag: TagSecurityConfig,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_true() -> bool {
    true
}

fn default_offline_limit() -> MinorUnits {
    5_000
}

fn default_transaction_timeout_secs() -> u64 {
    30
}

fn default_require_pin_above() -> MinorUnits {
    10_000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_cache_max_age_secs() -> u64 {
    3_600
}

impl Default for CashlessConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            auth_token: None,
            festival_id: String::new(),
            vendor_id: None,
            currency: default_currency(),
            enable_offline_payments: true,
            offline_limit: default_offline_limit(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            require_pin_above: default_require_pin_above(),
            request_timeout_secs: default_request_timeout_secs(),
            update_tag_after_transaction: true,
            cache_max_age_secs: default_cache_max_age_secs(),
            tag: TagSecurityConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TAG SECURITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Festival-wide tag keys and codec policy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSecurityConfig {
    /// 32-byte AES key, hex encoded.
    #[serde(default)]
    pub encryption_key: String,
    /// HMAC key, hex encoded.
    #[serde(default)]
    pub signing_key: String,
    #[serde(default = "default_true")]
    pub encrypt_data: bool,
    #[serde(default = "default_true")]
    pub sign_data: bool,
    #[serde(default = "default_true")]
    pub validate_signatures: bool,
}

impl Default for TagSecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            signing_key: String::new(),
            encrypt_data: true,
            sign_data: true,
            validate_signatures: true,
        }
    }
}

impl std::fmt::Debug for CashlessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CashlessConfig")
            .field("api_base_url", &self.api_base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("festival_id", &self.festival_id)
            .field("vendor_id", &self.vendor_id)
            .field("currency", &self.currency)
            .field("enable_offline_payments", &self.enable_offline_payments)
            .field("offline_limit", &self.offline_limit)
            .field("transaction_timeout_secs", &self.transaction_timeout_secs)
            .field("require_pin_above", &self.require_pin_above)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("update_tag_after_transaction", &self.update_tag_after_transaction)
            .field("cache_max_age_secs", &self.cache_max_age_secs)
            .field("tag", &self.tag)
            .finish()
    }
}

impl std::fmt::Debug for TagSecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagSecurityConfig")
            .field("encryption_key", &"<redacted>")
            .field("signing_key", &"<redacted>")
            .field("encrypt_data", &self.encrypt_data)
            .field("sign_data", &self.sign_data)
            .field("validate_signatures", &self.validate_signatures)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OVERRIDES
// ═══════════════════════════════════════════════════════════════════════════════

/// Partial update applied by [`CashlessConfig::with_overrides`].
#[derive(Clone, Default)]
pub struct ConfigOverrides {
    pub api_base_url: Option<String>,
    pub auth_token: Option<Option<String>>,
    pub festival_id: Option<String>,
    pub vendor_id: Option<Option<String>>,
    pub enable_offline_payments: Option<bool>,
    pub offline_limit: Option<MinorUnits>,
    pub transaction_timeout_secs: Option<u64>,
    pub require_pin_above: Option<MinorUnits>,
    pub update_tag_after_transaction: Option<bool>,
}

impl std::fmt::Debug for ConfigOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth_token = self.auth_token.as_ref().map(|t| t.as_ref().map(|_| "<redacted>"));
        f.debug_struct("ConfigOverrides")
            .field("api_base_url", &self.api_base_url)
            .field("auth_token", &auth_token)
            .field("festival_id", &self.festival_id)
            .field("vendor_id", &self.vendor_id)
            .field("enable_offline_payments", &self.enable_offline_payments)
            .field("offline_limit", &self.offline_limit)
            .field("transaction_timeout_secs", &self.transaction_timeout_secs)
            .field("require_pin_above", &self.require_pin_above)
            .field("update_tag_after_transaction", &self.update_tag_after_transaction)
            .finish()
    }
}

impl CashlessConfig {
    /// Load from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CashlessError> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load) with an explicit environment map in place
    /// of the process environment.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, CashlessError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .source(env),
        );

        let config: CashlessConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CashlessError::InvalidConfig(e.to_string()))?;
        config.validate()?;

        tracing::debug!(
            festival_id = %config.festival_id,
            api_base_url = %config.api_base_url,
            offline = config.enable_offline_payments,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CashlessError> {
        if self.festival_id.trim().is_empty() {
            return Err(CashlessError::InvalidConfig("festival_id must be set".into()));
        }

        let url = reqwest::Url::parse(&self.api_base_url).map_err(|e| {
            CashlessError::InvalidConfig(format!("api_base_url {:?}: {e}", self.api_base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CashlessError::InvalidConfig(format!(
                "api_base_url must be http or https, got {}",
                url.scheme()
            )));
        }

        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(CashlessError::InvalidConfig(format!(
                "currency must be a three-letter ISO code, got {:?}",
                self.currency
            )));
        }

        if self.enable_offline_payments && self.offline_limit == 0 {
            return Err(CashlessError::InvalidConfig(
                "offline_limit must be positive when offline payments are enabled".into(),
            ));
        }

        self.tag_keys().map(|_| ())
    }

    pub fn tag_keys(&self) -> Result<TagKeys, CashlessError> {
        TagKeys::from_hex(&self.tag.encryption_key, &self.tag.signing_key)
            .map_err(|e| CashlessError::InvalidConfig(format!("tag keys: {e}")))
    }

    pub fn tag_policy(&self) -> TagPolicy {
        TagPolicy {
            encrypt_data: self.tag.encrypt_data,
            sign_data: self.tag.sign_data,
            validate_signatures: self.tag.validate_signatures,
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    /// Amounts strictly above the threshold need a PIN.
    pub fn requires_pin(&self, amount: MinorUnits) -> bool {
        amount > self.require_pin_above
    }

    /// A validated copy with `overrides` applied.
    pub fn with_overrides(&self, overrides: ConfigOverrides) -> Result<Self, CashlessError> {
        let mut next = self.clone();
        if let Some(v) = overrides.api_base_url {
            next.api_base_url = v;
        }
        if let Some(v) = overrides.auth_token {
            next.auth_token = v;
        }
        if let Some(v) = overrides.festival_id {
            next.festival_id = v;
        }
        if let Some(v) = overrides.vendor_id {
            next.vendor_id = v;
        }
        if let Some(v) = overrides.enable_offline_payments {
            next.enable_offline_payments = v;
        }
        if let Some(v) = overrides.offline_limit {
            next.offline_limit = v;
        }
        if let Some(v) = overrides.transaction_timeout_secs {
            next.transaction_timeout_secs = v;
        }
        if let Some(v) = overrides.require_pin_above {
            next.require_pin_above = v;
        }
        if let Some(v) = overrides.update_tag_after_transaction {
            next.update_tag_after_transaction = v;
        }
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn keyed_env(extra: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        let enc = "2a".repeat(32);
        let sig = "17".repeat(32);
        let mut pairs = vec![
            ("CASHLESS_TAG__ENCRYPTION_KEY", enc.as_str()),
            ("CASHLESS_TAG__SIGNING_KEY", sig.as_str()),
        ];
        pairs.extend_from_slice(extra);
        env(&pairs)
    }

    #[test]
    fn test_defaults_from_environment() {
        let config =
            CashlessConfig::load_with_env(None, keyed_env(&[("CASHLESS_FESTIVAL_ID", "fest-1")]))
                .unwrap();
        assert_eq!(config.festival_id, "fest-1");
        assert_eq!(config.currency, "EUR");
        assert_eq!(config.offline_limit, 5_000);
        assert_eq!(config.require_pin_above, 10_000);
        assert_eq!(config.transaction_timeout(), Duration::from_secs(30));
        assert!(config.enable_offline_payments);
        assert_eq!(config.tag_policy(), TagPolicy::default());
    }

    #[test]
    fn test_file_layered_under_environment() {
        let path = std::env::temp_dir().join(format!("cashless-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "festival_id = \"from-file\"\noffline_limit = 2500\n\n[tag]\nencrypt_data = false\n",
        )
        .unwrap();

        let config = CashlessConfig::load_with_env(
            Some(&path),
            keyed_env(&[
                ("CASHLESS_FESTIVAL_ID", "from-env"),
                ("CASHLESS_ENABLE_OFFLINE_PAYMENTS", "false"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.festival_id, "from-env");
        assert_eq!(config.offline_limit, 2_500);
        assert!(!config.enable_offline_payments);
        assert!(!config.tag.encrypt_data);
        assert!(config.tag.sign_data);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = CashlessConfig::load_with_env(None, keyed_env(&[])).unwrap_err();
        assert!(matches!(err, CashlessError::InvalidConfig(_)));

        let err = CashlessConfig::load_with_env(
            None,
            keyed_env(&[
                ("CASHLESS_FESTIVAL_ID", "f"),
                ("CASHLESS_API_BASE_URL", "ftp://ledger"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("http"));

        let err = CashlessConfig::load_with_env(
            None,
            env(&[
                ("CASHLESS_FESTIVAL_ID", "f"),
                ("CASHLESS_TAG__ENCRYPTION_KEY", "abcd"),
                ("CASHLESS_TAG__SIGNING_KEY", "abcd"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("tag keys"));
    }

    #[test]
    fn test_with_overrides_returns_new_value() {
        let base =
            CashlessConfig::load_with_env(None, keyed_env(&[("CASHLESS_FESTIVAL_ID", "f")])).unwrap();
        let next = base
            .with_overrides(ConfigOverrides {
                offline_limit: Some(100),
                vendor_id: Some(Some("bar-3".into())),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.offline_limit, 100);
        assert_eq!(next.vendor_id.as_deref(), Some("bar-3"));
        assert_eq!(base.offline_limit, 5_000);
        assert!(base.vendor_id.is_none());

        let invalid = base.with_overrides(ConfigOverrides {
            offline_limit: Some(0),
            ..Default::default()
        });
        assert!(invalid.is_err());
    }

    #[test]
    fn test_pin_threshold_is_strict() {
        let config = CashlessConfig::default();
        assert!(!config.requires_pin(10_000));
        assert!(config.requires_pin(10_001));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let mut config = CashlessConfig::default();
        config.tag.signing_key = "deadbeef".into();
        assert!(!format!("{config:?}").contains("deadbeef"));
    }

    #[test]
    fn test_debug_redacts_auth_token() {
        let mut config = CashlessConfig::default();
        config.auth_token = Some("bearer-s3cret".into());
        config.festival_id = "fest-1".into();
        let printed = format!("{config:?}");
        assert!(!printed.contains("bearer-s3cret"));
        assert!(printed.contains("auth_token: Some(\"<redacted>\")"));
        assert!(printed.contains("fest-1"));

        config.auth_token = None;
        assert!(format!("{config:?}").contains("auth_token: None"));
    }

    #[test]
    fn test_override_debug_redacts_auth_token() {
        let overrides = ConfigOverrides {
            auth_token: Some(Some("bearer-s3cret".into())),
            ..Default::default()
        };
        let printed = format!("{overrides:?}");
        assert!(!printed.contains("bearer-s3cret"));
        assert!(printed.contains("<redacted>"));
    }
}
