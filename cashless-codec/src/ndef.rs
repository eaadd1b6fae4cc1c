//! Minimal NDEF message framing.
//!
//! Only what the bracelets need: build a single MIME record carrying the
//! JSON tag payload, and walk an arbitrary message looking for that record.
//!
//! ```text
//! ┌────┬────┬────┬────┬────┬─────┐
//! │ MB │ ME │ CF │ SR │ IL │ TNF │  header byte
//! └────┴────┴────┴────┴────┴─────┘
//!  type length (1) | payload length (1 or 4) | [id length (1)]
//!  type | [id] | payload
//! ```

use crate::error::{DecodeError, EncodeError};

/// MIME type of the record that carries a [`TagPayload`](crate::TagPayload).
pub const TAG_MIME_TYPE: &str = "application/vnd.festival.tag+json";

const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_CF: u8 = 0x20;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/// Type Name Format values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tnf {
    Empty,
    WellKnown,
    Mime,
    AbsoluteUri,
    External,
    Unknown,
    Unchanged,
    Reserved,
}

impl Tnf {
    fn from_bits(bits: u8) -> Self {
        match bits & TNF_MASK {
            0x00 => Tnf::Empty,
            0x01 => Tnf::WellKnown,
            0x02 => Tnf::Mime,
            0x03 => Tnf::AbsoluteUri,
            0x04 => Tnf::External,
            0x05 => Tnf::Unknown,
            0x06 => Tnf::Unchanged,
            _ => Tnf::Reserved,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Tnf::Empty => 0x00,
            Tnf::WellKnown => 0x01,
            Tnf::Mime => 0x02,
            Tnf::AbsoluteUri => 0x03,
            Tnf::External => 0x04,
            Tnf::Unknown => 0x05,
            Tnf::Unchanged => 0x06,
            Tnf::Reserved => 0x07,
        }
    }
}

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    pub fn mime(mime_type: &str, payload: Vec<u8>) -> Self {
        Self {
            tnf: Tnf::Mime,
            record_type: mime_type.as_bytes().to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    fn is_tag_payload(&self) -> bool {
        self.tnf == Tnf::Mime && self.record_type.eq_ignore_ascii_case(TAG_MIME_TYPE.as_bytes())
    }
}

/// Serialize records into a single NDEF message.
pub fn encode_message(records: &[NdefRecord]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if record.record_type.len() > u8::MAX as usize {
            return Err(EncodeError::RecordTooLarge(record.record_type.len()));
        }
        if record.id.len() > u8::MAX as usize {
            return Err(EncodeError::RecordTooLarge(record.id.len()));
        }
        let payload_len = u32::try_from(record.payload.len())
            .map_err(|_| EncodeError::RecordTooLarge(record.payload.len()))?;

        let mut header = record.tnf.bits();
        if index == 0 {
            header |= FLAG_MB;
        }
        if index + 1 == records.len() {
            header |= FLAG_ME;
        }
        let short = payload_len <= u8::MAX as u32;
        if short {
            header |= FLAG_SR;
        }
        if !record.id.is_empty() {
            header |= FLAG_IL;
        }

        out.push(header);
        out.push(record.record_type.len() as u8);
        if short {
            out.push(payload_len as u8);
        } else {
            out.extend_from_slice(&payload_len.to_be_bytes());
        }
        if !record.id.is_empty() {
            out.push(record.id.len() as u8);
        }
        out.extend_from_slice(&record.record_type);
        out.extend_from_slice(&record.id);
        out.extend_from_slice(&record.payload);
    }
    Ok(out)
}

/// Parse every record of an NDEF message.
pub fn decode_message(bytes: &[u8]) -> Result<Vec<NdefRecord>, DecodeError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let mut records = Vec::new();

    while !cursor.is_empty() {
        let header = cursor.take_u8()?;
        if records.is_empty() && header & FLAG_MB == 0 {
            return Err(DecodeError::Ndef("first record is missing the MB flag".into()));
        }
        if header & FLAG_CF != 0 {
            return Err(DecodeError::Ndef("chunked records are not supported".into()));
        }

        let type_len = cursor.take_u8()? as usize;
        let payload_len = if header & FLAG_SR != 0 {
            cursor.take_u8()? as usize
        } else {
            let raw = cursor.take(4)?;
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
        };
        let id_len = if header & FLAG_IL != 0 {
            cursor.take_u8()? as usize
        } else {
            0
        };

        let record_type = cursor.take(type_len)?.to_vec();
        let id = cursor.take(id_len)?.to_vec();
        let payload = cursor.take(payload_len)?.to_vec();
        records.push(NdefRecord {
            tnf: Tnf::from_bits(header),
            record_type,
            id,
            payload,
        });

        if header & FLAG_ME != 0 {
            break;
        }
    }

    Ok(records)
}

/// Wrap a JSON tag payload in a one-record message.
pub fn wrap_tag_payload(payload_json: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
    encode_message(&[NdefRecord::mime(TAG_MIME_TYPE, payload_json)])
}

/// Find the tag payload record in a message read off a tag.
///
/// Returns `Ok(None)` for blank tags and for messages that only carry foreign
/// records; `Err` only when the framing itself is broken.
pub fn find_tag_payload(bytes: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(decode_message(bytes)?
        .into_iter()
        .find(NdefRecord::is_tag_payload)
        .map(|record| record.payload))
}

/// True when a message carries no record with content.
pub fn is_blank(bytes: &[u8]) -> bool {
    match decode_message(bytes) {
        Ok(records) => records.iter().all(|r| r.tnf == Tnf::Empty),
        Err(_) => bytes.iter().all(|b| *b == 0),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                DecodeError::Ndef(format!(
                    "record truncated: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.bytes.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}
