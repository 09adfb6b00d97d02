mod common;

use chrono::{Duration, NaiveTime, Utc};
use common::{TestLedger, LINKED_ACCOUNT};
use fee_payment_service::models::{FeeStatus, Payment, TransferStatus};
use fee_payment_service::services::gateway::ProviderTransfer;
use fee_payment_service::services::refunds::RefundRequestInput;
use serde_json::json;
use uuid::Uuid;

async fn pause() {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
}

#[tokio::test]
async fn applied_payment_transfers_payee_share() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(100_000).await;
    let (provider_order_id, _) = ledger.pay(&[&record]).await;

    let order = ledger.settled(&provider_order_id).await.remove(0);

    assert_eq!(order.platform_fee, Some(5_000));
    assert_eq!(order.transfer_amount, Some(95_000));
    assert_eq!(order.transfer_status, Some(TransferStatus::Created));

    let transfers = ledger.gateway.transfers_created();
    assert_eq!(transfers.len(), 1);
    assert_eq!(order.transfer_id.as_deref(), Some(transfers[0].id.as_str()));
    assert_eq!(transfers[0].amount, 95_000);
    assert_eq!(transfers[0].recipient.as_deref(), Some(LINKED_ACCOUNT));
    assert_eq!(transfers[0].note("order_id"), Some(order.id.to_string().as_str()));
}

#[tokio::test]
async fn failed_transfer_does_not_block_payment() {
    let ledger = TestLedger::new().await;
    ledger.gateway.fail_transfers(true);
    let record = ledger.add_record(40_000).await;
    let (provider_order_id, _) = ledger.pay(&[&record]).await;

    let order = ledger.settled(&provider_order_id).await.remove(0);

    assert_eq!(order.transfer_status, Some(TransferStatus::Failed));
    assert!(order.transfer_id.is_none());
    assert!(order.transfer_error.is_some());
    assert_eq!(ledger.fee_record(record.id).await.status, FeeStatus::Paid);
}

#[tokio::test]
async fn retry_creates_missing_transfers() {
    let ledger = TestLedger::new().await;
    ledger.gateway.fail_transfers(true);
    let record = ledger.add_record(40_000).await;
    let (provider_order_id, _) = ledger.pay(&[&record]).await;
    ledger.settled(&provider_order_id).await;

    ledger.gateway.fail_transfers(false);
    pause().await;
    let report = ledger.services.reconciliation.retry_transfers().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.created, 1);
    assert_eq!(report.failed, 0);
    let order = ledger.orders_for(&provider_order_id).await.remove(0);
    assert_eq!(order.transfer_status, Some(TransferStatus::Created));
    assert_eq!(order.transfer_amount, Some(38_000));
    assert!(order.transfer_error.is_none());

    pause().await;
    let again = ledger.services.reconciliation.retry_transfers().await.unwrap();
    assert_eq!(again.scanned, 0);
}

#[tokio::test]
async fn retry_attaches_transfer_already_at_provider() {
    let ledger = TestLedger::new().await;
    ledger.gateway.fail_transfers(true);
    let record = ledger.add_record(20_000).await;
    let (provider_order_id, payment_id) = ledger.pay(&[&record]).await;
    let order = ledger.settled(&provider_order_id).await.remove(0);

    ledger.gateway.add_existing_transfer(
        &payment_id,
        ProviderTransfer {
            id: "trf_orphan".to_string(),
            source: Some(payment_id.clone()),
            recipient: Some(LINKED_ACCOUNT.to_string()),
            amount: 19_000,
            status: Some("processed".to_string()),
            notes: json!({ "order_id": order.id.to_string() }),
        },
    );
    pause().await;
    let report = ledger.services.reconciliation.retry_transfers().await.unwrap();

    assert_eq!(report.attached, 1);
    assert_eq!(report.created, 0);
    let order = ledger.orders_for(&provider_order_id).await.remove(0);
    assert_eq!(order.transfer_id.as_deref(), Some("trf_orphan"));
    assert_eq!(order.transfer_status, Some(TransferStatus::Processed));
}

#[tokio::test]
async fn day_reconciliation_reports_both_sides() {
    let ledger = TestLedger::new().await;
    let yesterday = Utc::now().date_naive() - Duration::days(1);
    let noon = yesterday.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()).and_utc();

    // Captured at the provider, never recorded here.
    let lost = ledger.gateway.capture_at("order_lost", 75_000, noon);

    // Recorded here, unknown to the provider.
    let record = ledger.add_record(12_000).await;
    ledger
        .store
        .insert_payment(Payment {
            id: Uuid::new_v4(),
            tenant_id: ledger.tenant_id,
            fee_record_id: record.id,
            payer_id: ledger.payer_id,
            order_id: Uuid::new_v4(),
            provider_payment_id: "pay_ghost".to_string(),
            amount: 12_000,
            receipt_number: "RCPT-2024-000099".to_string(),
            recorded_by: "verification".to_string(),
            created_at: noon,
        })
        .await;

    // Today's payment belongs to another day.
    let today_record = ledger.add_record(5_000).await;
    ledger.pay(&[&today_record]).await;

    let report = ledger.services.reconciliation.reconcile_day(yesterday).await.unwrap();

    assert!(report.has_anomalies());
    assert_eq!(report.provider_payments, 1);
    assert_eq!(report.local_payments, 1);
    assert_eq!(report.missing_locally.len(), 1);
    assert_eq!(report.missing_locally[0].payment_id, lost);
    assert_eq!(report.missing_locally[0].amount, 75_000);
    assert_eq!(report.missing_at_provider.len(), 1);
    assert_eq!(report.missing_at_provider[0].payment_id, "pay_ghost");
    assert!(report.amount_mismatches.is_empty());
}

#[tokio::test]
async fn multi_record_payment_reconciles_as_one() {
    let ledger = TestLedger::new().await;
    let first = ledger.add_record(30_000).await;
    let second = ledger.add_record(20_000).await;
    ledger.pay(&[&first, &second]).await;

    let report = ledger
        .services
        .reconciliation
        .reconcile_day(Utc::now().date_naive())
        .await
        .unwrap();

    assert_eq!(report.provider_payments, 1);
    assert_eq!(report.local_payments, 1);
    assert!(!report.has_anomalies());
}

#[tokio::test]
async fn integrity_check_finds_drift() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let (_, payment_id) = ledger.pay(&[&record]).await;
    let payment = ledger.store.payments().await.remove(0);

    assert!(!ledger.services.reconciliation.check_integrity().await.unwrap().has_anomalies());

    // A payment row written behind the ledger's back.
    ledger
        .store
        .insert_payment(Payment {
            id: Uuid::new_v4(),
            provider_payment_id: format!("{}_copy", payment_id),
            receipt_number: "RCPT-2024-999999".to_string(),
            created_at: Utc::now(),
            ..payment
        })
        .await;

    let report = ledger.services.reconciliation.check_integrity().await.unwrap();
    assert_eq!(report.drift.len(), 1);
    assert_eq!(report.drift[0].fee_record_id, record.id);
    assert_eq!(report.drift[0].paid_amount, 10_000);
    assert_eq!(report.drift[0].expected_paid, 20_000);
    assert!(report.overpaid.is_empty());
}

#[tokio::test]
async fn health_checks_flag_stale_work_and_duplicates() {
    let ledger = TestLedger::new().await;

    let abandoned = ledger.add_record(9_000).await;
    let provider_order_id = ledger.open_order(&[&abandoned]).await;
    let stale_order = ledger.orders_for(&provider_order_id).await.remove(0);
    ledger
        .store
        .update_order(stale_order.id, |o| o.created_at = Utc::now() - Duration::days(2))
        .await;

    let paid = ledger.add_record(15_000).await;
    let (paid_order, _) = ledger.pay(&[&paid]).await;
    ledger.settled(&paid_order).await;
    let payment = ledger.store.payments().await.remove(0);
    let refund = ledger
        .services
        .refunds
        .initiate_refund(
            ledger.tenant_id,
            RefundRequestInput {
                payment_id: payment.id,
                amount: Some(5_000),
                reason: "overcharged".to_string(),
                actor: "operator".to_string(),
            },
        )
        .await
        .unwrap();
    ledger
        .store
        .update_refund(refund.id, |r| r.created_at = Utc::now() - Duration::days(3))
        .await;

    ledger
        .store
        .insert_payment(Payment {
            id: Uuid::new_v4(),
            ..payment.clone()
        })
        .await;

    let report = ledger.services.reconciliation.run_health_checks().await.unwrap();

    assert!(report.has_anomalies());
    assert_eq!(report.stale_orders.len(), 1);
    assert_eq!(report.stale_orders[0].id, stale_order.id);
    assert_eq!(report.stale_refunds.len(), 1);
    assert_eq!(report.stale_refunds[0].id, refund.id);
    assert_eq!(report.duplicate_payments.len(), 1);
    assert_eq!(report.duplicate_payments[0].provider_payment_id, payment.provider_payment_id);
    assert_eq!(report.duplicate_payments[0].count, 2);
    assert!(report.missing_transfers.is_empty());
}

#[tokio::test]
async fn clean_ledger_has_no_health_findings() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(15_000).await;
    let (provider_order_id, _) = ledger.pay(&[&record]).await;
    ledger.settled(&provider_order_id).await;

    let report = ledger.services.reconciliation.run_health_checks().await.unwrap();

    assert!(!report.has_anomalies());
}
