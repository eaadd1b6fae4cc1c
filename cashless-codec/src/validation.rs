//! Structural checks on logical records, independent of any cryptography.

use crate::types::{LogicalTagRecord, TagBody, TagType, ValidationReport, TAG_FORMAT_VERSION};

/// Check that the declared type is the one populated variant and that the
/// variant's required fields are present and sensible.
pub fn validate_record(record: &LogicalTagRecord) -> ValidationReport {
    let mut errors = Vec::new();

    if record.version == 0 || record.version > TAG_FORMAT_VERSION {
        errors.push(format!(
            "version {} is outside supported range 1..={}",
            record.version, TAG_FORMAT_VERSION
        ));
    }
    if record.festival_id.trim().is_empty() {
        errors.push("festivalId is required".to_string());
    }

    for other in record.populated_variants() {
        if other != record.tag_type {
            errors.push(format!(
                "{} record must not be present on a {} tag",
                other, record.tag_type
            ));
        }
    }

    match record.body() {
        None => errors.push(format!(
            "{} tag requires a {} record",
            record.tag_type, record.tag_type
        )),
        Some(TagBody::Cashless(account)) => {
            if account.account_id.trim().is_empty() {
                errors.push("cashless.accountId is required".to_string());
            }
        }
        Some(TagBody::Ticket(ticket)) => {
            if ticket.ticket_id.trim().is_empty() {
                errors.push("ticket.ticketId is required".to_string());
            }
            if ticket.ticket_type.trim().is_empty() {
                errors.push("ticket.ticketType is required".to_string());
            }
            if let (Some(from), Some(until)) = (ticket.valid_from_ms, ticket.valid_until_ms) {
                if from > until {
                    errors.push("ticket validity window ends before it starts".to_string());
                }
            }
        }
        Some(TagBody::Staff(staff)) => {
            if staff.staff_id.trim().is_empty() {
                errors.push("staff.staffId is required".to_string());
            }
            if staff.role.trim().is_empty() {
                errors.push("staff.role is required".to_string());
            }
        }
        Some(TagBody::Transfer(transfer)) => {
            if transfer.transfer_id.trim().is_empty() {
                errors.push("transfer.transferId is required".to_string());
            }
            if transfer.amount == 0 {
                errors.push("transfer.amount must be greater than zero".to_string());
            }
            if transfer.from_account_id == transfer.to_account_id {
                errors.push("transfer source and destination must differ".to_string());
            }
        }
    }

    ValidationReport::from_errors(errors)
}

/// Field-level checks on the raw JSON body, run before typed parsing so that
/// a missing account id reads as a validation failure rather than a serde
/// message.
pub(crate) fn required_fields(tag_type: TagType, body: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(section) = body.get(tag_type.as_str()).filter(|v| !v.is_null()) else {
        return errors;
    };
    match tag_type {
        TagType::Cashless => {
            if !section.get("accountId").map_or(false, |v| v.is_string()) {
                errors.push("cashless.accountId must be a non-null string".to_string());
            }
            if !section.get("balance").map_or(false, |v| v.is_u64()) {
                errors.push("cashless.balance must be a non-negative integer".to_string());
            }
        }
        TagType::Transfer => {
            if !section.get("amount").map_or(false, |v| v.is_u64()) {
                errors.push("transfer.amount must be a non-negative integer".to_string());
            }
        }
        TagType::Ticket | TagType::Staff => {}
    }
    errors
}
