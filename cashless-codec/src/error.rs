//! Error types for tag encoding and decoding.

use thiserror::Error;

use crate::types::TagType;

/// Result type alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Failures while turning a [`TagPayload`](crate::TagPayload) back into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported tag format version {found} (max supported {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("tag body is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("tag body could not be decrypted")]
    DecryptionFailed,

    #[error("tag body is too short to contain a nonce")]
    TruncatedCiphertext,

    #[error("malformed tag body: {0}")]
    Malformed(String),

    #[error("payload declares {declared} but body declares {body}")]
    TypeMismatch { declared: TagType, body: TagType },

    #[error("tag record failed validation: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("malformed NDEF message: {0}")]
    Ndef(String),
}

/// Failures while producing a [`TagPayload`](crate::TagPayload).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("record failed validation: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("encryption failed")]
    Encryption,

    #[error("NDEF record too large: {0} bytes")]
    RecordTooLarge(usize),
}

/// Errors that can occur anywhere in the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        EncodeError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABLE ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable failure codes shared by every layer, serialized as
/// `SCREAMING_SNAKE_CASE` so UI code can switch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // capability
    NotSupported,
    NotEnabled,
    // session
    TagNotFound,
    UserCancelled,
    Timeout,
    SessionBusy,
    Unknown,
    // integrity
    AuthenticationFailed,
    InvalidTag,
    ReadError,
    WriteError,
    // business
    InsufficientBalance,
    DailyLimitExceeded,
    OfflineLimitExceeded,
    OfflineNotAllowed,
    InvalidAmount,
    AccountInactive,
    // transport and storage
    NetworkError,
    ServerError,
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::NotEnabled => "NOT_ENABLED",
            ErrorCode::TagNotFound => "TAG_NOT_FOUND",
            ErrorCode::UserCancelled => "USER_CANCELLED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::SessionBusy => "SESSION_BUSY",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::InvalidTag => "INVALID_TAG",
            ErrorCode::ReadError => "READ_ERROR",
            ErrorCode::WriteError => "WRITE_ERROR",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            ErrorCode::OfflineLimitExceeded => "OFFLINE_LIMIT_EXCEEDED",
            ErrorCode::OfflineNotAllowed => "OFFLINE_NOT_ALLOWED",
            ErrorCode::InvalidAmount => "INVALID_AMOUNT",
            ErrorCode::AccountInactive => "ACCOUNT_INACTIVE",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
        }
    }

    /// Business-rule rejections; the caller should render these, not retry.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            ErrorCode::InsufficientBalance
                | ErrorCode::DailyLimitExceeded
                | ErrorCode::OfflineLimitExceeded
                | ErrorCode::OfflineNotAllowed
                | ErrorCode::InvalidAmount
                | ErrorCode::AccountInactive
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
