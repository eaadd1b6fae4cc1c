//! Property tests for the tag codec.
//!
//! 1. Round trip: sign(encode(r)) verifies and decodes back to r
//! 2. Tamper detection: changing any signed field breaks verification
//! 3. Determinism: identical record and keys give identical payloads
//! 4. NDEF framing survives arbitrary payload sizes

use cashless_codec::{
    find_tag_payload, wrap_tag_payload, CashlessAccount, LogicalTagRecord, StaffData, TagCodec,
    TagKeys, TagPayload, TagType, TicketData, TransferData,
};
use proptest::prelude::*;

fn codec() -> TagCodec {
    TagCodec::new(TagKeys::new([0x42; 32], b"festival-signing-key-0001".to_vec()).unwrap())
}

// ── Generators ───────────────────────────────────────────────────────────────

fn id() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9-]{0,23}"
}

fn cashless_record() -> impl Strategy<Value = LogicalTagRecord> {
    (id(), id(), any::<u64>(), any::<u64>(), proptest::option::of(id())).prop_map(
        |(festival, account_id, balance, ts, last_tx)| {
            let mut account = CashlessAccount::new(account_id, balance);
            account.last_transaction_id = last_tx;
            LogicalTagRecord::cashless(festival, account, ts)
        },
    )
}

fn any_record() -> impl Strategy<Value = LogicalTagRecord> {
    prop_oneof![
        cashless_record(),
        (id(), id(), id(), any::<u64>()).prop_map(|(festival, ticket_id, kind, ts)| {
            let ticket = TicketData {
                ticket_id,
                ticket_type: kind,
                holder_name: None,
                valid_from_ms: Some(ts / 2),
                valid_until_ms: Some(ts),
                used: false,
            };
            LogicalTagRecord::ticket(festival, ticket, ts)
        }),
        (id(), id(), id(), proptest::collection::vec(id(), 0..4), any::<u64>()).prop_map(
            |(festival, staff_id, role, zones, ts)| {
                let staff = StaffData {
                    staff_id,
                    role,
                    name: None,
                    access_zones: zones,
                };
                LogicalTagRecord::staff(festival, staff, ts)
            }
        ),
        (id(), id(), id(), 1u64..=u64::MAX, any::<u64>()).prop_map(
            |(festival, transfer_id, from, amount, ts)| {
                let transfer = TransferData {
                    transfer_id,
                    to_account_id: format!("{from}-dest"),
                    from_account_id: from,
                    amount,
                };
                LogicalTagRecord::transfer(festival, transfer, ts)
            }
        ),
    ]
    .prop_flat_map(|record| {
        proptest::collection::btree_map(id(), id(), 0..3).prop_map(move |meta| {
            let mut record = record.clone();
            for (k, v) in meta {
                record = record.with_metadata(k, serde_json::Value::String(v));
            }
            record
        })
    })
}

/// Replace the character at `index` with a different base64 character.
fn mutate_body(body: &str, index: usize) -> String {
    let mut chars: Vec<char> = body.chars().collect();
    let i = index % chars.len();
    chars[i] = if chars[i] == 'A' { 'B' } else { 'A' };
    chars.into_iter().collect()
}

// ── Properties ───────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn signed_payload_round_trips(record in any_record(), encrypt in any::<bool>()) {
        let codec = codec();
        let payload = codec.sign(codec.encode(&record, encrypt).unwrap()).unwrap();
        prop_assert!(codec.verify_signature(&payload));
        prop_assert_eq!(codec.decode(&payload, encrypt).unwrap(), record);
    }

    #[test]
    fn encoding_is_deterministic(record in any_record()) {
        let codec = codec();
        let a = codec.sign(codec.encode(&record, true).unwrap()).unwrap();
        let b = codec.sign(codec.encode(&record, true).unwrap()).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn body_tampering_breaks_signature(record in cashless_record(), index in any::<usize>()) {
        let codec = codec();
        let mut payload = codec.sign(codec.encode(&record, true).unwrap()).unwrap();
        payload.encrypted_body = mutate_body(&payload.encrypted_body, index);
        prop_assert!(!codec.verify_signature(&payload));
    }

    #[test]
    fn timestamp_tampering_breaks_signature(record in cashless_record(), bit in 0u32..64) {
        let codec = codec();
        let mut payload = codec.sign(codec.encode(&record, true).unwrap()).unwrap();
        payload.timestamp_ms ^= 1u64 << bit;
        prop_assert!(!codec.verify_signature(&payload));
    }

    #[test]
    fn retyping_breaks_signature(record in cashless_record(), target in 1usize..4) {
        let codec = codec();
        let mut payload = codec.sign(codec.encode(&record, true).unwrap()).unwrap();
        payload.tag_type = TagType::ALL[target];
        prop_assert!(!codec.verify_signature(&payload));
    }

    #[test]
    fn ndef_framing_preserves_payload(body in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let framed = wrap_tag_payload(body.clone()).unwrap();
        prop_assert_eq!(find_tag_payload(&framed).unwrap(), Some(body));
    }

    #[test]
    fn foreign_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let codec = codec();
        if let Ok(Some(payload)) = codec.payload_from_ndef(&bytes) {
            let _ = codec.verify_signature(&payload);
            let _ = codec.decode(&payload, true);
        }
    }
}

#[test]
fn version_bump_is_rejected_even_when_resigned() {
    let codec = codec();
    let record = LogicalTagRecord::cashless("fest", CashlessAccount::new("acc", 10), 5);
    let mut payload: TagPayload = codec.encode(&record, true).unwrap();
    payload.version = 2;
    let payload = codec.sign(payload).unwrap();
    assert!(codec.verify_signature(&payload));
    assert!(codec.decode(&payload, true).is_err());
}
