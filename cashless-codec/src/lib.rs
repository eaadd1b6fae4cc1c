//! # cashless-codec: on-tag format for festival bracelets
//!
//! Pure, synchronous transformation between the logical records a terminal
//! works with and the bytes written to an NFC tag.
//!
//! ```text
//! LogicalTagRecord ──encode──▶ TagPayload ──sign──▶ TagPayload{signature}
//!        ▲                         │                        │
//!        └───────decode────────────┘◀──────to/from NDEF─────┘
//! ```
//!
//! - **Body**: canonical JSON of the record, sealed with AES-256-GCM when
//!   encryption is on, then base64.
//! - **Signature**: HMAC-SHA256 over `version|tagType|encryptedBody|timestampMs`,
//!   hex encoded. Encoding never signs and decoding never verifies; the
//!   reader and writer decide.
//! - **Framing**: one NDEF MIME record of type [`TAG_MIME_TYPE`].
//!
//! Nothing in this crate performs I/O.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod ndef;
pub mod types;
pub mod validation;

pub use codec::TagCodec;
pub use crypto::{TagKeys, ENCRYPTION_KEY_LEN, MIN_SIGNING_KEY_LEN};
pub use error::{CodecError, CodecResult, DecodeError, EncodeError, ErrorCode};
pub use ndef::{find_tag_payload, is_blank, wrap_tag_payload, NdefRecord, Tnf, TAG_MIME_TYPE};
pub use types::{
    AccountStatus, CashlessAccount, LogicalTagRecord, MinorUnits, StaffData, TagBody, TagPayload,
    TagType, TicketData, TransferData, ValidationReport, TAG_FORMAT_VERSION,
};
pub use validation::validate_record;
