mod common;

use common::{webhook_signature, TestLedger};
use fee_payment_service::error::PaymentError;
use fee_payment_service::models::{
    FeeStatus, OrderStatus, RefundKind, RefundStatus, TransferStatus,
};
use fee_payment_service::services::notifier::NotificationKind;
use fee_payment_service::services::refunds::RefundRequestInput;
use fee_payment_service::services::WebhookAck;
use serde_json::{json, Value};

fn event(kind: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "entity": "event",
        "account_id": "acc_platform",
        "event": kind,
        "payload": payload,
        "created_at": 1_700_000_000,
    }))
    .unwrap()
}

fn captured(provider_order_id: &str, payment_id: &str, amount: i64) -> Vec<u8> {
    event(
        "payment.captured",
        json!({
            "payment": { "entity": {
                "id": payment_id,
                "amount": amount,
                "currency": "INR",
                "status": "captured",
                "order_id": provider_order_id,
                "created_at": 1_700_000_000,
            }}
        }),
    )
}

async fn deliver(ledger: &TestLedger, body: &[u8], event_id: &str) -> WebhookAck {
    let signature = webhook_signature(body);
    ledger
        .services
        .webhooks
        .ingest(body, Some(&signature), Some(event_id))
        .await
        .expect("webhook accepted")
}

#[tokio::test]
async fn unsigned_or_forged_events_are_rejected_and_not_logged() {
    let ledger = TestLedger::new().await;
    let body = captured("order_x", "pay_x", 1_000);

    let err = ledger
        .services
        .webhooks
        .ingest(&body, None, Some("evt_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidSignature));

    let forged = webhook_signature(b"something else");
    let err = ledger
        .services
        .webhooks
        .ingest(&body, Some(&forged), Some("evt_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidSignature));

    assert!(ledger.store.webhook_events().await.is_empty());
}

#[tokio::test]
async fn captured_event_applies_payment() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(25_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 25_000);

    let ack = deliver(&ledger, &captured(&provider_order_id, &payment_id, 25_000), "evt_1").await;

    assert_eq!(ack, WebhookAck::Processed);
    let payments = ledger.store.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].recorded_by, "webhook");
    assert_eq!(ledger.fee_record(record.id).await.status, FeeStatus::Paid);

    let events = ledger.store.webhook_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "payment.captured");
    assert!(events[0].processed);
    assert!(events[0].error.is_none());
}

#[tokio::test]
async fn webhook_after_verification_is_a_logged_no_op() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(100_000).await;
    let (provider_order_id, payment_id) = ledger.pay(&[&record]).await;
    let before = ledger.fee_record(record.id).await;

    let ack = deliver(&ledger, &captured(&provider_order_id, &payment_id, 100_000), "evt_2").await;

    assert_eq!(ack, WebhookAck::Processed);
    assert_eq!(ledger.store.payments().await.len(), 1);
    assert_eq!(ledger.fee_record(record.id).await, before);
    let events = ledger.store.webhook_events().await;
    assert!(events[0].processed);
}

#[tokio::test]
async fn processed_event_ids_are_skipped() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(5_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 5_000);
    let body = captured(&provider_order_id, &payment_id, 5_000);

    deliver(&ledger, &body, "evt_dup").await;
    let ack = deliver(&ledger, &body, "evt_dup").await;

    assert_eq!(ack, WebhookAck::Processed);
    assert_eq!(ledger.store.webhook_events().await.len(), 1);
    assert_eq!(ledger.store.payments().await.len(), 1);
}

#[tokio::test]
async fn unparseable_body_is_acknowledged() {
    let ledger = TestLedger::new().await;

    let ack = deliver(&ledger, b"{not json", "evt_bad").await;

    assert_eq!(ack, WebhookAck::Processed);
    let events = ledger.store.webhook_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "unparseable");
    assert!(events[0].processed);
    assert!(events[0].error.is_some());
}

#[tokio::test]
async fn conflicts_ask_for_redelivery() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(8_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 8_000);
    let body = captured(&provider_order_id, &payment_id, 8_000);

    ledger.store.inject_conflicts(1);
    let ack = deliver(&ledger, &body, "evt_retry").await;
    assert_eq!(ack, WebhookAck::Retry);
    assert!(ledger.store.payments().await.is_empty());
    assert!(!ledger.store.webhook_events().await[0].processed);

    let ack = deliver(&ledger, &body, "evt_retry").await;
    assert_eq!(ack, WebhookAck::Processed);
    assert_eq!(ledger.store.payments().await.len(), 1);
}

#[tokio::test]
async fn captured_amount_mismatch_is_recorded_not_applied() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(8_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;

    let ack = deliver(&ledger, &captured(&provider_order_id, "pay_short", 4_000), "evt_m").await;

    assert_eq!(ack, WebhookAck::Processed);
    assert!(ledger.store.payments().await.is_empty());
    let events = ledger.store.webhook_events().await;
    assert!(events[0].processed);
    assert!(events[0].error.is_some());
}

#[tokio::test]
async fn capture_event_for_uncaptured_payment_is_not_applied() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(8_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let body = event(
        "payment.captured",
        json!({
            "payment": { "entity": {
                "id": "pay_auth",
                "amount": 8_000,
                "currency": "INR",
                "status": "authorized",
                "order_id": provider_order_id,
                "created_at": 1_700_000_000,
            }}
        }),
    );

    let ack = deliver(&ledger, &body, "evt_auth").await;

    assert_eq!(ack, WebhookAck::Processed);
    assert!(ledger.store.payments().await.is_empty());
    assert_eq!(ledger.fee_record(record.id).await.paid_amount, 0);
    assert!(ledger.orders_for(&provider_order_id).await.iter().all(|o| !o.payment_applied));
    let events = ledger.store.webhook_events().await;
    assert!(events[0].processed);
    assert!(events[0].error.as_deref().unwrap_or_default().contains("not captured"));
}

#[tokio::test]
async fn failed_payment_marks_orders_failed() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(8_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;

    let body = event(
        "payment.failed",
        json!({
            "payment": { "entity": {
                "id": "pay_failed",
                "amount": 8_000,
                "status": "failed",
                "order_id": provider_order_id,
                "error_description": "Payment was declined by the bank",
            }}
        }),
    );
    deliver(&ledger, &body, "evt_f").await;

    let order = ledger.orders_for(&provider_order_id).await.remove(0);
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("Payment was declined by the bank")
    );
}

fn refund_event(kind: &str, refund_id: &str, payment_id: &str, amount: i64) -> Vec<u8> {
    event(
        kind,
        json!({
            "refund": { "entity": {
                "id": refund_id,
                "payment_id": payment_id,
                "amount": amount,
                "status": kind.trim_start_matches("refund."),
                "notes": {},
            }}
        }),
    )
}

#[tokio::test]
async fn refund_events_confirm_or_restore() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(100_000).await;
    let (provider_order_id, payment_id) = ledger.pay(&[&record]).await;
    ledger.settled(&provider_order_id).await;
    let payment = ledger.store.payments().await.remove(0);

    let first = ledger
        .services
        .refunds
        .initiate_refund(
            ledger.tenant_id,
            RefundRequestInput {
                payment_id: payment.id,
                amount: Some(30_000),
                reason: "duplicate enrolment".to_string(),
                actor: "operator".to_string(),
            },
        )
        .await
        .unwrap();
    let second = ledger
        .services
        .refunds
        .initiate_refund(
            ledger.tenant_id,
            RefundRequestInput {
                payment_id: payment.id,
                amount: Some(20_000),
                reason: "class cancelled".to_string(),
                actor: "operator".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(ledger.fee_record(record.id).await.paid_amount, 50_000);

    let first_rfnd = first.provider_refund_id.clone().unwrap();
    deliver(&ledger, &refund_event("refund.processed", &first_rfnd, &payment_id, 30_000), "evt_r1").await;

    let second_rfnd = second.provider_refund_id.clone().unwrap();
    let failed = refund_event("refund.failed", &second_rfnd, &payment_id, 20_000);
    deliver(&ledger, &failed, "evt_r2").await;
    // Redelivered under a new event id: must not restore twice.
    deliver(&ledger, &failed, "evt_r3").await;

    let refunds = ledger.store.refunds().await;
    let status_of = |id| refunds.iter().find(|r| r.id == id).unwrap().status;
    assert_eq!(status_of(first.id), RefundStatus::Confirmed);
    assert_eq!(status_of(second.id), RefundStatus::Failed);

    let record = ledger.fee_record(record.id).await;
    assert_eq!(record.paid_amount, 70_000);
    assert_eq!(record.status, FeeStatus::PartiallyPaid);
    assert_eq!(ledger.notifier.count(NotificationKind::RefundFailed), 1);

    let integrity = ledger.services.reconciliation.check_integrity().await.unwrap();
    assert!(integrity.drift.is_empty());
}

fn dispute_event(kind: &str, dispute_id: &str, payment_id: &str, amount: i64) -> Vec<u8> {
    event(
        kind,
        json!({
            "payment": { "entity": {
                "id": payment_id,
                "amount": amount,
                "status": "captured",
            }},
            "dispute": { "entity": {
                "id": dispute_id,
                "payment_id": payment_id,
                "amount": amount,
                "reason_code": "chargeback",
            }}
        }),
    )
}

#[tokio::test]
async fn lost_dispute_charges_back_once() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(60_000).await;
    let (_, payment_id) = ledger.pay(&[&record]).await;

    deliver(&ledger, &dispute_event("payment.dispute.created", "disp_1", &payment_id, 60_000), "evt_d1").await;
    assert_eq!(ledger.notifier.count(NotificationKind::DisputeCreated), 1);

    let lost = dispute_event("payment.dispute.lost", "disp_1", &payment_id, 60_000);
    deliver(&ledger, &lost, "evt_d2").await;
    deliver(&ledger, &lost, "evt_d3").await;

    let chargebacks: Vec<_> = ledger
        .store
        .refunds()
        .await
        .into_iter()
        .filter(|r| r.kind == RefundKind::Chargeback)
        .collect();
    assert_eq!(chargebacks.len(), 1);
    assert_eq!(chargebacks[0].status, RefundStatus::Confirmed);
    assert_eq!(chargebacks[0].amount, 60_000);
    assert_eq!(chargebacks[0].provider_refund_id.as_deref(), Some("disp_1"));

    let record = ledger.fee_record(record.id).await;
    assert_eq!(record.paid_amount, 0);
    assert_eq!(record.status, FeeStatus::Pending);
    assert_eq!(ledger.notifier.count(NotificationKind::DisputeLost), 1);

    let integrity = ledger.services.reconciliation.check_integrity().await.unwrap();
    assert!(!integrity.has_anomalies());
}

#[tokio::test]
async fn transfer_events_update_settlement_status() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let (provider_order_id, _) = ledger.pay(&[&record]).await;
    let order = ledger.settled(&provider_order_id).await.remove(0);
    let transfer_id = order.transfer_id.clone().expect("transfer created");

    let body = event(
        "transfer.processed",
        json!({
            "transfer": { "entity": {
                "id": transfer_id,
                "amount": order.transfer_amount.unwrap_or_default(),
                "status": "processed",
                "notes": { "order_id": order.id.to_string() },
            }}
        }),
    );
    deliver(&ledger, &body, "evt_t1").await;

    let order = ledger.orders_for(&provider_order_id).await.remove(0);
    assert_eq!(order.transfer_status, Some(TransferStatus::Processed));
}

#[tokio::test]
async fn unknown_event_kinds_are_marked_processed() {
    let ledger = TestLedger::new().await;

    let ack = deliver(&ledger, &event("invoice.paid", json!({})), "evt_u").await;

    assert_eq!(ack, WebhookAck::Processed);
    let events = ledger.store.webhook_events().await;
    assert_eq!(events[0].event_type, "invoice.paid");
    assert!(events[0].processed);
    assert!(events[0].error.is_none());
}
