//! Error types for NFC sessions, reads and writes.

use cashless_codec::ErrorCode;
use thiserror::Error;

/// Failures reported by the platform radio driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("NFC hardware is not present")]
    NotSupported,

    #[error("NFC is switched off")]
    NotEnabled,

    #[error("technology request was cancelled")]
    Cancelled,

    #[error("no tag presented before the platform timeout")]
    Timeout,

    #[error("tag left the field")]
    TagLost,

    #[error("radio I/O failed: {0}")]
    Io(String),

    #[error("radio error: {0}")]
    Other(String),
}

/// Errors surfaced by the session manager, reader and writer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NfcError {
    // ═══════════════════════════════════════════════════════════════════════════════
    // CAPABILITY ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("NFC is not supported on this device")]
    NotSupported,

    #[error("NFC is disabled; enable it in system settings")]
    NotEnabled,

    // ═══════════════════════════════════════════════════════════════════════════════
    // SESSION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("no tag found")]
    TagNotFound,

    #[error("session cancelled by user")]
    UserCancelled,

    #[error("timed out waiting for a tag")]
    Timeout,

    #[error("another NFC session is already active")]
    SessionBusy,

    #[error("unexpected NFC error: {0}")]
    Unknown(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // INTEGRITY ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("tag signature verification failed")]
    AuthenticationFailed,

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // I/O ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("failed to read tag: {0}")]
    ReadFailed(String),

    #[error("failed to write tag: {0}")]
    WriteFailed(String),
}

impl NfcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NfcError::NotSupported => ErrorCode::NotSupported,
            NfcError::NotEnabled => ErrorCode::NotEnabled,
            NfcError::TagNotFound => ErrorCode::TagNotFound,
            NfcError::UserCancelled => ErrorCode::UserCancelled,
            NfcError::Timeout => ErrorCode::Timeout,
            NfcError::SessionBusy => ErrorCode::SessionBusy,
            NfcError::Unknown(_) => ErrorCode::Unknown,
            NfcError::AuthenticationFailed => ErrorCode::AuthenticationFailed,
            NfcError::InvalidTag(_) => ErrorCode::InvalidTag,
            NfcError::ReadFailed(_) => ErrorCode::ReadError,
            NfcError::WriteFailed(_) => ErrorCode::WriteError,
        }
    }

    /// Errors that clear without user action at the OS level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NfcError::TagNotFound
                | NfcError::Timeout
                | NfcError::SessionBusy
                | NfcError::UserCancelled
                | NfcError::ReadFailed(_)
        )
    }
}

impl From<RadioError> for NfcError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::NotSupported => NfcError::NotSupported,
            RadioError::NotEnabled => NfcError::NotEnabled,
            RadioError::Cancelled => NfcError::UserCancelled,
            RadioError::Timeout => NfcError::Timeout,
            RadioError::TagLost => NfcError::TagNotFound,
            RadioError::Io(msg) | RadioError::Other(msg) => NfcError::Unknown(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_errors_map_to_session_codes() {
        assert_eq!(NfcError::from(RadioError::Cancelled).code(), ErrorCode::UserCancelled);
        assert_eq!(NfcError::from(RadioError::TagLost).code(), ErrorCode::TagNotFound);
        assert_eq!(
            NfcError::from(RadioError::Io("crc".into())),
            NfcError::Unknown("crc".into())
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(NfcError::Timeout.is_transient());
        assert!(!NfcError::NotEnabled.is_transient());
        assert!(!NfcError::AuthenticationFailed.is_transient());
    }
}
