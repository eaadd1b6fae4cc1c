//! End-to-end tap flows over the simulated radio.

use std::sync::Arc;

use cashless_codec::{CashlessAccount, ErrorCode, LogicalTagRecord, TagCodec, TagKeys};
use cashless_nfc::{
    NfcError, ReadOptions, SessionManager, SessionState, SimulatedRadio, SimulatedTag, TagPolicy,
    TagReader, TagWriter, WriteOptions,
};

struct Terminal {
    radio: Arc<SimulatedRadio>,
    session: SessionManager,
    reader: TagReader,
    writer: TagWriter,
}

async fn terminal(policy: TagPolicy) -> Terminal {
    let codec = Arc::new(TagCodec::new(
        TagKeys::from_hex(&"2a".repeat(32), &"17".repeat(32)).unwrap(),
    ));
    let radio = Arc::new(SimulatedRadio::with_tag(SimulatedTag::blank(vec![
        0x04, 0xA2, 0x2B, 0x91,
    ])));
    let session = SessionManager::new(radio.clone());
    assert_eq!(session.initialize().await, SessionState::Ready);
    Terminal {
        reader: TagReader::new(session.clone(), codec.clone()),
        writer: TagWriter::new(session.clone(), codec).with_policy(policy),
        radio,
        session,
    }
}

#[tokio::test]
async fn provision_then_charge_then_read() {
    let t = terminal(TagPolicy::default()).await;
    let record = LogicalTagRecord::cashless("summer-fest", CashlessAccount::new("acc-77", 5000), 1);

    let provisioned = t.writer.write_tag(&record, WriteOptions::default()).await;
    assert!(provisioned.success, "{:?}", provisioned.error);

    let update = t.writer.update_bracelet_balance(2000, "tx-1").await;
    assert!(update.success, "{:?}", update.error);

    let read = t.reader.read_cashless_bracelet(ReadOptions::default()).await;
    assert!(read.success);
    assert_eq!(read.bracelet_id.as_deref(), Some("04A22B91"));
    let account = read.cashless_data.unwrap();
    assert_eq!(account.balance, 2000);
    assert_eq!(account.last_transaction_id.as_deref(), Some("tx-1"));
    assert_eq!(t.session.state().await, SessionState::Ready);
}

#[tokio::test]
async fn plaintext_policy_round_trips() {
    let policy = TagPolicy {
        encrypt_data: false,
        sign_data: true,
        validate_signatures: true,
    };
    let t = terminal(policy).await;
    let record = LogicalTagRecord::cashless("fest", CashlessAccount::new("acc", 300), 1);
    assert!(t.writer.write_tag(&record, policy.write_options(false)).await.success);
    assert!(t.writer.update_bracelet_balance(100, "tx-2").await.success);

    let read = t.reader.read_tag(policy.read_options()).await;
    assert_eq!(read.data.unwrap().cashless_account().unwrap().balance, 100);
}

#[tokio::test]
async fn unsigned_tag_fails_strict_read_but_passes_lenient_read() {
    let t = terminal(TagPolicy::default()).await;
    let record = LogicalTagRecord::cashless("fest", CashlessAccount::new("acc", 1), 1);
    let unsigned = WriteOptions {
        sign_data: false,
        ..Default::default()
    };
    assert!(t.writer.write_tag(&record, unsigned).await.success);

    let strict = t.reader.read_tag(ReadOptions::default()).await;
    assert_eq!(strict.error, Some(NfcError::AuthenticationFailed));
    assert!(strict.raw_payload.is_some());

    let lenient = t
        .reader
        .read_tag(ReadOptions {
            validate_signature: false,
            decrypt_data: true,
        })
        .await;
    assert_eq!(lenient.data, Some(record));
}

#[tokio::test]
async fn second_tap_during_open_session_fails_fast() {
    let t = terminal(TagPolicy::default()).await;
    let guard = t.session.start_session(&[], None).await.unwrap();

    let read = t.reader.read_tag(ReadOptions::default()).await;
    assert_eq!(read.error_code(), Some(ErrorCode::SessionBusy));
    let write = t
        .writer
        .write_tag(
            &LogicalTagRecord::cashless("fest", CashlessAccount::new("a", 1), 1),
            WriteOptions::default(),
        )
        .await;
    assert_eq!(write.error_code(), Some(ErrorCode::SessionBusy));

    guard.release().await;
    assert!(t.reader.read_tag(ReadOptions::default()).await.success);
    assert_eq!(t.radio.write_count().await, 0);
}
