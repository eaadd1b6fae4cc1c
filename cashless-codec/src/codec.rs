//! Encode, sign, verify and decode tag payloads.

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::debug;

use crate::crypto::TagKeys;
use crate::error::{CodecError, DecodeError, EncodeError};
use crate::ndef;
use crate::types::{LogicalTagRecord, TagPayload, ValidationReport, TAG_FORMAT_VERSION};
use crate::validation::{required_fields, validate_record};

/// Pure transformation between logical records and on-tag payloads.
///
/// Encoding never signs: callers decide whether to call [`TagCodec::sign`].
/// Decoding never verifies: callers that require authenticity must call
/// [`TagCodec::verify_signature`] first.
#[derive(Debug, Clone)]
pub struct TagCodec {
    keys: TagKeys,
}

impl TagCodec {
    pub fn new(keys: TagKeys) -> Self {
        Self { keys }
    }

    /// Serialize a record into an unsigned payload.
    ///
    /// With `encrypt` the canonical JSON is sealed with AES-256-GCM; without
    /// it the JSON is only base64-wrapped for transport.
    pub fn encode(
        &self,
        record: &LogicalTagRecord,
        encrypt: bool,
    ) -> Result<TagPayload, EncodeError> {
        let report = validate_record(record);
        if !report.valid {
            return Err(EncodeError::Invalid(report.errors));
        }

        let canonical = serde_json::to_vec(record)?;
        let body = if encrypt {
            self.keys.encrypt(&canonical)?
        } else {
            canonical
        };

        Ok(TagPayload {
            version: record.version,
            tag_type: record.tag_type,
            encrypted_body: STANDARD.encode(body),
            signature: String::new(),
            timestamp_ms: record.timestamp_ms,
        })
    }

    /// Populate the payload signature.
    pub fn sign(&self, mut payload: TagPayload) -> Result<TagPayload, CodecError> {
        payload.signature = self.keys.sign_hex(payload.signing_input().as_bytes())?;
        Ok(payload)
    }

    /// Recompute and compare the signature; `false` on any mismatch.
    pub fn verify_signature(&self, payload: &TagPayload) -> bool {
        if !payload.is_signed() {
            return false;
        }
        self.keys
            .verify_hex(payload.signing_input().as_bytes(), &payload.signature)
    }

    /// Recover the logical record from a payload.
    pub fn decode(
        &self,
        payload: &TagPayload,
        decrypt: bool,
    ) -> Result<LogicalTagRecord, DecodeError> {
        if payload.version > TAG_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                found: payload.version,
                supported: TAG_FORMAT_VERSION,
            });
        }

        let raw = STANDARD
            .decode(payload.encrypted_body.as_bytes())
            .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
        let plaintext = if decrypt { self.keys.decrypt(&raw)? } else { raw };

        let value: serde_json::Value = serde_json::from_slice(&plaintext)?;
        let missing = required_fields(payload.tag_type, &value);
        if !missing.is_empty() {
            return Err(DecodeError::Invalid(missing));
        }
        let record: LogicalTagRecord = serde_json::from_value(value)?;

        if record.tag_type != payload.tag_type {
            return Err(DecodeError::TypeMismatch {
                declared: payload.tag_type,
                body: record.tag_type,
            });
        }

        let report = validate_record(&record);
        if !report.valid {
            return Err(DecodeError::Invalid(report.errors));
        }

        debug!(tag_type = %record.tag_type, version = record.version, "decoded tag record");
        Ok(record)
    }

    pub fn validate(&self, record: &LogicalTagRecord) -> ValidationReport {
        validate_record(record)
    }

    /// Encode, optionally sign, and frame a record as NDEF bytes ready for
    /// the radio.
    pub fn to_ndef(
        &self,
        record: &LogicalTagRecord,
        encrypt: bool,
        sign: bool,
    ) -> Result<(TagPayload, Vec<u8>), CodecError> {
        let mut payload = self.encode(record, encrypt)?;
        if sign {
            payload = self.sign(payload)?;
        }
        let json = payload.to_json_bytes().map_err(EncodeError::from)?;
        let bytes = ndef::wrap_tag_payload(json)?;
        Ok((payload, bytes))
    }

    /// Extract the payload envelope from NDEF bytes.
    ///
    /// `Ok(None)` means the tag holds nothing of ours (blank or foreign).
    pub fn payload_from_ndef(&self, bytes: &[u8]) -> Result<Option<TagPayload>, DecodeError> {
        match ndef::find_tag_payload(bytes)? {
            None => Ok(None),
            Some(json) => Ok(Some(TagPayload::from_json_bytes(&json)?)),
        }
    }

    /// Detached HMAC over arbitrary bytes with the tag signing key.
    pub fn sign_detached(&self, message: &[u8]) -> Result<String, CodecError> {
        self.keys.sign_hex(message)
    }

    pub fn verify_detached(&self, message: &[u8], signature: &str) -> bool {
        self.keys.verify_hex(message, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CashlessAccount, TagType, TicketData};

    fn codec() -> TagCodec {
        TagCodec::new(TagKeys::new([3u8; 32], vec![5u8; 32]).unwrap())
    }

    fn record() -> LogicalTagRecord {
        LogicalTagRecord::cashless("fest-1", CashlessAccount::new("acc-1", 5000), 1_700_000_000_000)
            .with_metadata("issuer", serde_json::json!("gate-3"))
    }

    #[test]
    fn test_encode_leaves_signature_empty() {
        let payload = codec().encode(&record(), true).unwrap();
        assert!(payload.signature.is_empty());
        assert_eq!(payload.tag_type, TagType::Cashless);
        assert_eq!(payload.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = codec();
        assert_eq!(codec.encode(&record(), true).unwrap(), codec.encode(&record(), true).unwrap());
    }

    #[test]
    fn test_signed_round_trip_encrypted_and_plain() {
        let codec = codec();
        for encrypt in [true, false] {
            let payload = codec.sign(codec.encode(&record(), encrypt).unwrap()).unwrap();
            assert!(codec.verify_signature(&payload));
            assert_eq!(codec.decode(&payload, encrypt).unwrap(), record());
        }
    }

    #[test]
    fn test_unsigned_payload_never_verifies() {
        let codec = codec();
        let payload = codec.encode(&record(), true).unwrap();
        assert!(!codec.verify_signature(&payload));
    }

    #[test]
    fn test_wrong_key_fails_verification_and_decryption() {
        let payload = codec().sign(codec().encode(&record(), true).unwrap()).unwrap();
        let other = TagCodec::new(TagKeys::new([4u8; 32], vec![6u8; 32]).unwrap());
        assert!(!other.verify_signature(&payload));
        assert_eq!(other.decode(&payload, true), Err(DecodeError::DecryptionFailed));
    }

    #[test]
    fn test_decode_rejects_declared_type_mismatch() {
        let codec = codec();
        let mut payload = codec.encode(&record(), false).unwrap();
        payload.tag_type = TagType::Ticket;
        assert_eq!(
            codec.decode(&payload, false),
            Err(DecodeError::TypeMismatch {
                declared: TagType::Ticket,
                body: TagType::Cashless
            })
        );
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let codec = codec();
        let mut payload = codec.encode(&record(), false).unwrap();
        payload.version = TAG_FORMAT_VERSION + 1;
        assert!(matches!(
            codec.decode(&payload, false),
            Err(DecodeError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_decode_reports_missing_account_id() {
        let codec = codec();
        let body = serde_json::json!({
            "version": 1,
            "type": "cashless",
            "festivalId": "fest-1",
            "timestampMs": 1,
            "cashless": {"accountId": null, "balance": 10}
        });
        let payload = TagPayload {
            version: 1,
            tag_type: TagType::Cashless,
            encrypted_body: STANDARD.encode(serde_json::to_vec(&body).unwrap()),
            signature: String::new(),
            timestamp_ms: 1,
        };
        assert!(matches!(codec.decode(&payload, false), Err(DecodeError::Invalid(_))));
    }

    #[test]
    fn test_decode_rejects_garbage_body() {
        let codec = codec();
        let mut payload = codec.encode(&record(), false).unwrap();
        payload.encrypted_body = "%%%".into();
        assert!(matches!(codec.decode(&payload, false), Err(DecodeError::InvalidBase64(_))));
        payload.encrypted_body = STANDARD.encode(b"not json");
        assert!(matches!(codec.decode(&payload, false), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_encode_refuses_invalid_record() {
        let ticket = TicketData {
            ticket_id: String::new(),
            ticket_type: "vip".into(),
            holder_name: None,
            valid_from_ms: None,
            valid_until_ms: None,
            used: false,
        };
        let record = LogicalTagRecord::ticket("fest-1", ticket, 0);
        assert!(matches!(codec().encode(&record, true), Err(EncodeError::Invalid(_))));
    }

    #[test]
    fn test_ndef_round_trip() {
        let codec = codec();
        let (payload, bytes) = codec.to_ndef(&record(), true, true).unwrap();
        let parsed = codec.payload_from_ndef(&bytes).unwrap().unwrap();
        assert_eq!(parsed, payload);
        assert!(codec.verify_signature(&parsed));
        assert_eq!(codec.payload_from_ndef(&[]).unwrap(), None);
    }

    #[test]
    fn test_detached_signatures() {
        let codec = codec();
        let sig = codec.sign_detached(b"off_1|payment|300").unwrap();
        assert!(codec.verify_detached(b"off_1|payment|300", &sig));
        assert!(!codec.verify_detached(b"off_1|payment|301", &sig));
    }
}
