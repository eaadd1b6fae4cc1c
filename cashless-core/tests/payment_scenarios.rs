//! Payment, topup and tag-integrity scenarios over a simulated terminal.

use cashless_codec::{ErrorCode, TagCodec, TagKeys};
use cashless_core::{
    CashlessEvent, PaymentRequest, SyncStatus, TopupRequest, TransactionStatus, TransferRequest,
};
use cashless_nfc::{NfcError, ReadOptions, SimulatedTag};
use cashless_test_fixtures::{
    cashless_bracelet, ledger_balance, test_config, ScriptedLedger, Terminal, BRACELET_ID,
    BRACELET_UID,
};

fn payment(amount: u64) -> PaymentRequest {
    PaymentRequest {
        bracelet_id: BRACELET_ID.into(),
        amount,
        vendor_id: Some("v1".into()),
        festival_id: Some("f1".into()),
        tag_account: None,
    }
}

#[tokio::test]
async fn online_payment_completes_and_updates_tag() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();

    let result = t.orchestrator.process_payment(payment(3_000)).await;
    assert!(result.success, "{:?}", result.error);
    let tx = result.transaction.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.sync_status, SyncStatus::Synced);
    assert_eq!(tx.previous_balance(), 5_000);
    assert_eq!(tx.new_balance(), 2_000);
    assert_eq!(tx.id, "srv-1");
    assert_eq!(tx.signature.as_deref(), Some("ledger-sig-1"));

    assert_eq!(t.ledger.submit_calls(), 1);
    assert_eq!(t.ledger.balance_of(BRACELET_ID), Some(2_000));
    assert_eq!(t.tag_balance().await.unwrap(), 2_000);
    let account = cashless_test_fixtures::tag_account(&t.radio).await.unwrap();
    assert_eq!(account.last_transaction_id.as_deref(), Some("srv-1"));
    assert!(t.orchestrator.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn offline_payment_is_queued_and_written_to_tag() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    t.go_offline();

    let result = t.orchestrator.charge_bracelet(3_000, Some("v1".into())).await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.is_offline());
    let tx = result.transaction.unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.sync_status, SyncStatus::Pending);
    assert!(tx.id.starts_with("off_"));
    assert_eq!(tx.offline_id.as_deref(), Some(tx.id.as_str()));
    assert!(t.orchestrator.verify_offline_signature(&tx));

    let queued = t.orchestrator.queue().pending().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].transaction, tx);
    assert_eq!(t.tag_balance().await.unwrap(), 2_000);
    assert_eq!(t.ledger.submit_calls(), 0);
}

#[tokio::test]
async fn online_transport_failure_falls_back_to_offline() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    let tag = t.orchestrator.reader().read_cashless_bracelet(ReadOptions::default()).await;
    t.ledger.set_unreachable(true);

    let mut request = payment(1_000);
    request.tag_account = tag.cashless_data;
    let result = t.orchestrator.process_payment(request).await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.is_offline());
    assert_eq!(t.orchestrator.queue().len().await.unwrap(), 1);
    assert_eq!(t.tag_balance().await.unwrap(), 4_000);
}

#[tokio::test]
async fn offline_payment_above_limit_creates_nothing() {
    let t = Terminal::with_bracelet(10_000).await.unwrap();
    t.go_offline();
    let before = t.radio.current().await.unwrap().ndef;

    let result = t.orchestrator.charge_bracelet(6_000, None).await;
    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::OfflineLimitExceeded));
    assert!(result.transaction.is_none());
    assert!(t.orchestrator.queue().is_empty().await.unwrap());
    assert_eq!(t.radio.write_count().await, 0);
    assert_eq!(t.radio.current().await.unwrap().ndef, before);
}

#[tokio::test]
async fn insufficient_balance_regardless_of_connectivity() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    let online = t.orchestrator.process_payment(payment(8_000)).await;
    assert_eq!(online.error_code, Some(ErrorCode::InsufficientBalance));

    t.go_offline();
    let offline = t.orchestrator.charge_bracelet(8_000, None).await;
    assert_eq!(offline.error_code, Some(ErrorCode::InsufficientBalance));
    assert_eq!(t.ledger.submit_calls(), 0);
    assert_eq!(t.radio.write_count().await, 0);
}

#[tokio::test]
async fn topup_and_transfer_require_connectivity() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    t.go_offline();

    let topup = t
        .orchestrator
        .process_topup(TopupRequest {
            bracelet_id: BRACELET_ID.into(),
            amount: 2_000,
            tag_account: None,
        })
        .await;
    assert_eq!(topup.error_code, Some(ErrorCode::OfflineNotAllowed));

    let transfer = t
        .orchestrator
        .process_transfer(TransferRequest {
            from_bracelet_id: BRACELET_ID.into(),
            to_bracelet_id: "FFFF0001".into(),
            amount: 100,
            tag_account: None,
        })
        .await;
    assert_eq!(transfer.error_code, Some(ErrorCode::OfflineNotAllowed));
    assert_eq!(t.radio.write_count().await, 0);
}

#[tokio::test]
async fn online_topup_credits_tag_and_ledger() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    let result = t
        .orchestrator
        .process_topup(TopupRequest {
            bracelet_id: BRACELET_ID.into(),
            amount: 2_000,
            tag_account: None,
        })
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.transaction.unwrap().new_balance(), 7_000);
    assert_eq!(t.ledger.balance_of(BRACELET_ID), Some(7_000));
    assert_eq!(t.tag_balance().await.unwrap(), 7_000);
}

#[tokio::test]
async fn transfer_debits_sender_and_records_counterparty() {
    let ledger = ScriptedLedger::new()
        .with_balance(ledger_balance(BRACELET_ID, 5_000))
        .with_balance(ledger_balance("FFFF0001", 100));
    let t = Terminal::new(
        test_config(),
        ledger,
        cashless_bracelet(&BRACELET_UID, "acc-1", 5_000).unwrap(),
    )
    .await
    .unwrap();

    let result = t
        .orchestrator
        .process_transfer(TransferRequest {
            from_bracelet_id: BRACELET_ID.into(),
            to_bracelet_id: "FFFF0001".into(),
            amount: 1_500,
            tag_account: None,
        })
        .await;
    assert!(result.success, "{:?}", result.error);
    let tx = result.transaction.unwrap();
    assert_eq!(tx.new_balance(), 3_500);
    assert_eq!(tx.counterparty_bracelet_id.as_deref(), Some("FFFF0001"));
    assert_eq!(t.tag_balance().await.unwrap(), 3_500);

    let same = t
        .orchestrator
        .process_transfer(TransferRequest {
            from_bracelet_id: BRACELET_ID.into(),
            to_bracelet_id: BRACELET_ID.into(),
            amount: 1,
            tag_account: None,
        })
        .await;
    assert_eq!(same.error_code, Some(ErrorCode::InvalidAmount));
}

#[tokio::test]
async fn ledger_rejection_falls_back_to_offline() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    t.ledger.reject_next(cashless_core::LedgerError::Server {
        status: 422,
        code: Some("ACCOUNT_FROZEN".into()),
        message: "frozen".into(),
    });

    let result = t.orchestrator.process_payment(payment(1_000)).await;
    assert!(result.success, "{:?}", result.error);
    let tx = result.transaction.unwrap();
    assert_eq!(tx.sync_status, SyncStatus::Pending);
    assert!(tx.offline_id.is_some());
    assert_eq!(t.orchestrator.queue().len().await.unwrap(), 1);
    assert_eq!(t.tag_balance().await.unwrap(), 4_000);
    assert_eq!(t.ledger.balance_of(BRACELET_ID), Some(5_000));
}

#[tokio::test]
async fn daily_limit_and_inactive_accounts_are_enforced() {
    let mut limited = ledger_balance(BRACELET_ID, 5_000);
    limited.daily_limit = Some(2_000);
    limited.daily_spent = Some(1_500);
    let t = Terminal::new(
        test_config(),
        ScriptedLedger::new().with_balance(limited.clone()),
        cashless_bracelet(&BRACELET_UID, "acc-1", 5_000).unwrap(),
    )
    .await
    .unwrap();

    let over = t.orchestrator.process_payment(payment(600)).await;
    assert_eq!(over.error_code, Some(ErrorCode::DailyLimitExceeded));
    let within = t.orchestrator.process_payment(payment(500)).await;
    assert!(within.success, "{:?}", within.error);

    let mut inactive = limited;
    inactive.is_active = false;
    t.ledger.set_balance(inactive);
    let result = t.orchestrator.process_payment(payment(1)).await;
    assert_eq!(result.error_code, Some(ErrorCode::AccountInactive));

    let zero = t.orchestrator.process_payment(payment(0)).await;
    assert_eq!(zero.error_code, Some(ErrorCode::InvalidAmount));
}

#[tokio::test]
async fn offline_disabled_without_network_is_not_allowed() {
    let mut config = test_config();
    config.enable_offline_payments = false;
    let t = Terminal::new(
        config,
        ScriptedLedger::new(),
        cashless_bracelet(&BRACELET_UID, "acc-1", 5_000).unwrap(),
    )
    .await
    .unwrap();
    t.go_offline();

    let result = t.orchestrator.charge_bracelet(100, None).await;
    assert_eq!(result.error_code, Some(ErrorCode::OfflineNotAllowed));
}

#[tokio::test]
async fn corrupted_signature_is_rejected_with_raw_payload() {
    let codec = TagCodec::new(
        TagKeys::from_hex(
            cashless_test_fixtures::ENCRYPTION_KEY_HEX,
            cashless_test_fixtures::SIGNING_KEY_HEX,
        )
        .unwrap(),
    );
    let (mut payload, _) = codec
        .to_ndef(&cashless_test_fixtures::cashless_record("acc-1", 5_000), true, true)
        .unwrap();
    let first = payload.signature.remove(0);
    payload
        .signature
        .insert(0, if first == '0' { '1' } else { '0' });
    let bytes = cashless_codec::wrap_tag_payload(payload.to_json_bytes().unwrap()).unwrap();

    let t = Terminal::new(
        test_config(),
        ScriptedLedger::new(),
        SimulatedTag::with_ndef(BRACELET_UID.to_vec(), bytes),
    )
    .await
    .unwrap();

    let read = t.orchestrator.reader().read_tag(ReadOptions::default()).await;
    assert!(!read.success);
    assert_eq!(read.error, Some(NfcError::AuthenticationFailed));
    assert!(read.data.is_none());
    assert_eq!(read.raw_payload, Some(payload));

    let charge = t.orchestrator.charge_bracelet(100, None).await;
    assert_eq!(charge.error_code, Some(ErrorCode::AuthenticationFailed));
}

#[tokio::test]
async fn listeners_and_events_see_both_paths() {
    let t = Terminal::with_bracelet(5_000).await.unwrap();
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    t.orchestrator.on_transaction(move |tx| {
        sink.lock().unwrap().push(tx.sync_status);
        Ok(())
    });
    t.orchestrator
        .on_transaction(|_| Err(anyhow::anyhow!("listener exploded")));
    let mut events = t.orchestrator.subscribe();

    assert!(t.orchestrator.process_payment(payment(100)).await.success);
    t.go_offline();
    assert!(t.orchestrator.charge_bracelet(100, None).await.success);

    assert_eq!(*seen.lock().unwrap(), vec![SyncStatus::Synced, SyncStatus::Pending]);
    assert!(matches!(events.recv().await.unwrap(), CashlessEvent::TransactionCompleted(_)));
    assert!(matches!(events.recv().await.unwrap(), CashlessEvent::TransactionQueued(_)));
}

#[tokio::test]
async fn pin_threshold_is_reported() {
    let t = Terminal::with_bracelet(1).await.unwrap();
    assert!(!t.orchestrator.requires_pin(10_000));
    assert!(t.orchestrator.requires_pin(10_001));
}
