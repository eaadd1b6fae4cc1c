//! The platform NFC capability the session manager drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::RadioError;

/// Tag technologies a session can ask the platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NfcTechnology {
    Ndef,
    NfcA,
    MifareUltralight,
    IsoDep,
}

/// A tag currently in the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagInfo {
    /// Hardware UID.
    pub id: Vec<u8>,
    pub tech_types: Vec<NfcTechnology>,
    /// Writable NDEF capacity in bytes, when the platform reports it.
    pub max_size: Option<usize>,
}

impl TagInfo {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            tech_types: vec![NfcTechnology::Ndef],
            max_size: None,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Uppercase hex UID, used as the bracelet id.
    pub fn uid_hex(&self) -> String {
        hex::encode_upper(&self.id)
    }
}

/// Low-level radio operations.
///
/// Implementations wrap a platform driver; every call is a suspension point.
/// Only one technology request may be outstanding at a time, which the
/// [`SessionManager`](crate::SessionManager) enforces above this trait.
#[async_trait]
pub trait NfcRadio: Send + Sync {
    async fn is_supported(&self) -> Result<bool, RadioError>;

    /// `None` when the platform cannot tell; callers treat that as enabled.
    async fn is_enabled(&self) -> Result<Option<bool>, RadioError>;

    async fn start(&self) -> Result<(), RadioError>;

    /// Block until a tag supporting one of `technologies` is in the field.
    async fn request_technology(
        &self,
        technologies: &[NfcTechnology],
        alert_message: Option<&str>,
    ) -> Result<(), RadioError>;

    async fn get_tag(&self) -> Result<Option<TagInfo>, RadioError>;

    async fn cancel_technology_request(&self) -> Result<(), RadioError>;

    /// Raw NDEF message bytes; empty for an unformatted tag.
    async fn read_ndef(&self) -> Result<Vec<u8>, RadioError>;

    async fn write_ndef(&self, message: &[u8]) -> Result<(), RadioError>;

    /// Tags discovered in the field, independent of any pending request.
    fn discovery_events(&self) -> broadcast::Receiver<TagInfo>;
}
