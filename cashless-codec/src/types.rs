//! Logical and physical tag data model.
//!
//! A bracelet carries a [`TagPayload`] (the physical envelope) whose body,
//! once decrypted, is a [`LogicalTagRecord`]. The record declares a
//! [`TagType`] and carries exactly one matching sub-record.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Amounts and balances are always integer minor currency units (cents).
pub type MinorUnits = u64;

/// Current on-tag format version written by this crate.
pub const TAG_FORMAT_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════════════
// TAG TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of record a tag carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    Cashless,
    Ticket,
    Staff,
    Transfer,
}

impl TagType {
    pub const ALL: [TagType; 4] = [
        TagType::Cashless,
        TagType::Ticket,
        TagType::Staff,
        TagType::Transfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagType::Cashless => "cashless",
            TagType::Ticket => "ticket",
            TagType::Staff => "staff",
            TagType::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cashless" => Some(TagType::Cashless),
            "ticket" => Some(TagType::Ticket),
            "staff" => Some(TagType::Staff),
            "transfer" => Some(TagType::Transfer),
            _ => None,
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PHYSICAL PAYLOAD
// ═══════════════════════════════════════════════════════════════════════════════

/// The envelope stored on the physical tag.
///
/// `signature` is empty until [`TagCodec::sign`](crate::TagCodec::sign) has
/// been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPayload {
    pub version: u32,
    pub tag_type: TagType,
    pub encrypted_body: String,
    #[serde(default)]
    pub signature: String,
    pub timestamp_ms: u64,
}

impl TagPayload {
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Bytes covered by the HMAC: `version|tagType|encryptedBody|timestampMs`.
    pub fn signing_input(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.version, self.tag_type, self.encrypted_body, self.timestamp_ms
        )
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SUB-RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a cashless account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
    Locked,
}

/// Cached account state written on a cashless bracelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashlessAccount {
    pub account_id: String,
    pub balance: MinorUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_user_id: Option<String>,
    #[serde(default)]
    pub status: AccountStatus,
}

impl CashlessAccount {
    pub fn new(account_id: impl Into<String>, balance: MinorUnits) -> Self {
        Self {
            account_id: account_id.into(),
            balance,
            last_transaction_id: None,
            linked_user_id: None,
            status: AccountStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Admission ticket bound to a bracelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketData {
    pub ticket_id: String,
    pub ticket_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until_ms: Option<u64>,
    #[serde(default)]
    pub used: bool,
}

/// Staff credential with the zones it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffData {
    pub staff_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub access_zones: Vec<String>,
}

/// Value transfer voucher between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferData {
    pub transfer_id: String,
    pub from_account_id: String,
    pub to_account_id: String,
    pub amount: MinorUnits,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOGICAL RECORD
// ═══════════════════════════════════════════════════════════════════════════════

/// Decoded tag contents: a shared envelope plus one populated sub-record.
///
/// The wire form keeps every variant as an optional field so that a record
/// produced elsewhere can be checked for carrying the wrong variant; use
/// [`validate_record`](crate::validate_record) before trusting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalTagRecord {
    pub version: u32,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub festival_id: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashless: Option<CashlessAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff: Option<StaffData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferData>,
}

/// Borrowed view of the populated sub-record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagBody<'a> {
    Cashless(&'a CashlessAccount),
    Ticket(&'a TicketData),
    Staff(&'a StaffData),
    Transfer(&'a TransferData),
}

impl LogicalTagRecord {
    fn empty(tag_type: TagType, festival_id: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            version: TAG_FORMAT_VERSION,
            tag_type,
            festival_id: festival_id.into(),
            timestamp_ms,
            metadata: BTreeMap::new(),
            cashless: None,
            ticket: None,
            staff: None,
            transfer: None,
        }
    }

    pub fn cashless(
        festival_id: impl Into<String>,
        account: CashlessAccount,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            cashless: Some(account),
            ..Self::empty(TagType::Cashless, festival_id, timestamp_ms)
        }
    }

    pub fn ticket(festival_id: impl Into<String>, ticket: TicketData, timestamp_ms: u64) -> Self {
        Self {
            ticket: Some(ticket),
            ..Self::empty(TagType::Ticket, festival_id, timestamp_ms)
        }
    }

    pub fn staff(festival_id: impl Into<String>, staff: StaffData, timestamp_ms: u64) -> Self {
        Self {
            staff: Some(staff),
            ..Self::empty(TagType::Staff, festival_id, timestamp_ms)
        }
    }

    pub fn transfer(
        festival_id: impl Into<String>,
        transfer: TransferData,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            transfer: Some(transfer),
            ..Self::empty(TagType::Transfer, festival_id, timestamp_ms)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The sub-record matching the declared type, if it is populated.
    pub fn body(&self) -> Option<TagBody<'_>> {
        match self.tag_type {
            TagType::Cashless => self.cashless.as_ref().map(TagBody::Cashless),
            TagType::Ticket => self.ticket.as_ref().map(TagBody::Ticket),
            TagType::Staff => self.staff.as_ref().map(TagBody::Staff),
            TagType::Transfer => self.transfer.as_ref().map(TagBody::Transfer),
        }
    }

    pub fn cashless_account(&self) -> Option<&CashlessAccount> {
        match self.body() {
            Some(TagBody::Cashless(account)) => Some(account),
            _ => None,
        }
    }

    /// Variants that carry data, in declaration order.
    pub fn populated_variants(&self) -> Vec<TagType> {
        let mut present = Vec::new();
        if self.cashless.is_some() {
            present.push(TagType::Cashless);
        }
        if self.ticket.is_some() {
            present.push(TagType::Ticket);
        }
        if self.staff.is_some() {
            present.push(TagType::Staff);
        }
        if self.transfer.is_some() {
            present.push(TagType::Transfer);
        }
        present
    }
}

/// Outcome of a structural check on a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}
