//! Error types for the cashless core.

use cashless_codec::{CodecError, ErrorCode, MinorUnits};
use cashless_nfc::NfcError;
use thiserror::Error;

/// Failures talking to the remote ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The request never produced an HTTP response.
    #[error("ledger unreachable: {0}")]
    Network(String),

    /// The ledger answered with a non-2xx status.
    #[error("ledger rejected request ({status}): {message}")]
    Server {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
}

impl LedgerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LedgerError::Network(_) => ErrorCode::NetworkError,
            LedgerError::Server { .. } | LedgerError::InvalidResponse(_) => ErrorCode::ServerError,
        }
    }

    /// A definitive refusal by the ledger, as opposed to a failure that may
    /// succeed when retried later.
    pub fn is_rejection(&self) -> bool {
        matches!(self, LedgerError::Server { status, .. } if (400..500).contains(status) && *status != 408 && *status != 429)
    }
}

/// Failures of the local key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored value for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("could not serialize value for {key}: {reason}")]
    Serialization { key: String, reason: String },
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Errors surfaced by balance resolution and transaction processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CashlessError {
    // ═══════════════════════════════════════════════════════════════════════════════
    // CONFIGURATION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // BUSINESS ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance {
        available: MinorUnits,
        requested: MinorUnits,
    },

    #[error("daily limit exceeded: {spent} of {limit} already spent, {requested} requested")]
    DailyLimitExceeded {
        limit: MinorUnits,
        spent: MinorUnits,
        requested: MinorUnits,
    },

    #[error("offline limit exceeded: {requested} requested, offline limit is {limit}")]
    OfflineLimitExceeded {
        limit: MinorUnits,
        requested: MinorUnits,
    },

    #[error("this operation requires a network connection")]
    OfflineNotAllowed,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("account {0} is not active")]
    AccountInactive(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // COLLABORATOR ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("no balance source available for bracelet {0}")]
    BalanceUnavailable(String),

    #[error(transparent)]
    Nfc(#[from] NfcError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CashlessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CashlessError::InvalidConfig(_) => ErrorCode::Unknown,
            CashlessError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            CashlessError::DailyLimitExceeded { .. } => ErrorCode::DailyLimitExceeded,
            CashlessError::OfflineLimitExceeded { .. } => ErrorCode::OfflineLimitExceeded,
            CashlessError::OfflineNotAllowed => ErrorCode::OfflineNotAllowed,
            CashlessError::InvalidAmount(_) => ErrorCode::InvalidAmount,
            CashlessError::AccountInactive(_) => ErrorCode::AccountInactive,
            CashlessError::BalanceUnavailable(_) => ErrorCode::ReadError,
            CashlessError::Nfc(e) => e.code(),
            CashlessError::Ledger(e) => e.code(),
            CashlessError::Storage(_) => ErrorCode::StorageError,
            CashlessError::Codec(_) => ErrorCode::InvalidTag,
        }
    }
}
