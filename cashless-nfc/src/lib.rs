//! # cashless-nfc: radio sessions and tag I/O
//!
//! Drives a platform NFC radio through the [`NfcRadio`] trait and layers the
//! tag codec on top:
//!
//! - [`SessionManager`]: exclusive session lifecycle, capability probing,
//!   tag-discovery listeners and feedback hooks.
//! - [`TagReader`]: one-shot reads, cashless bracelet reads and a cancellable
//!   continuous scan.
//! - [`TagWriter`]: guarded writes and the read-modify-write balance update.
//!
//! [`SimulatedRadio`] is a complete in-process radio for terminals without
//! hardware and for tests.

pub mod error;
pub mod feedback;
pub mod listeners;
pub mod radio;
pub mod reader;
pub mod session;
pub mod sim;
pub mod writer;

pub use error::{NfcError, RadioError};
pub use feedback::{Feedback, NoFeedback, TracingFeedback};
pub use listeners::{Listener, ListenerId, Listeners};
pub use radio::{NfcRadio, NfcTechnology, TagInfo};
pub use reader::{BraceletRead, ReadOptions, ReadResult, ScanHandle, TagReader, DEFAULT_SCAN_INTERVAL};
pub use session::{SessionGuard, SessionManager, SessionState, DEFAULT_ALERT_MESSAGE};
pub use sim::{SimulatedRadio, SimulatedTag};
pub use writer::{TagPolicy, TagWriter, WriteOptions, WriteResult};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
