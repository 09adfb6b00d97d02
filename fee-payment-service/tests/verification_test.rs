mod common;

use common::{proof, TestLedger};
use fee_payment_service::error::PaymentError;
use fee_payment_service::models::FeeStatus;
use uuid::Uuid;

#[tokio::test]
async fn tampered_signature_is_rejected_without_side_effects() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 10_000);

    let mut forged = proof(&provider_order_id, &payment_id);
    forged.signature = "0".repeat(64);
    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, Some(ledger.payer_id), &forged)
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::InvalidSignature));
    assert!(ledger.store.payments().await.is_empty());
    assert_eq!(ledger.fee_record(record.id).await.status, FeeStatus::Pending);
}

#[tokio::test]
async fn provider_amount_must_match_order() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 100);

    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, None, &proof(&provider_order_id, &payment_id))
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::AmountMismatch));
    assert!(ledger.store.payments().await.is_empty());
}

#[tokio::test]
async fn uncaptured_payment_is_not_applied() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 10_000);
    ledger.gateway.set_payment_status(&payment_id, "authorized");

    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, None, &proof(&provider_order_id, &payment_id))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::AmountMismatch));
}

#[tokio::test]
async fn payment_for_another_order_is_rejected() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let other = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let other_order_id = ledger.open_order(&[&other]).await;
    let payment_id = ledger.gateway.capture(&other_order_id, 10_000);

    // Properly signed for this order, but the provider says it paid another one.
    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, None, &proof(&provider_order_id, &payment_id))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::AmountMismatch));
}

#[tokio::test]
async fn other_payer_and_other_tenant_are_refused() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 10_000);
    let payment_proof = proof(&provider_order_id, &payment_id);

    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, Some(Uuid::new_v4()), &payment_proof)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Forbidden(_)));

    let err = ledger
        .services
        .verification
        .verify(Uuid::new_v4(), None, &payment_proof)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));
}

#[tokio::test]
async fn claimed_fee_record_must_belong_to_order() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 10_000);

    let mut claimed = proof(&provider_order_id, &payment_id);
    claimed.fee_record_id = Some(Uuid::new_v4());
    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, None, &claimed)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Validation(_)));
}

#[tokio::test]
async fn second_verification_reports_already_applied() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let (provider_order_id, payment_id) = ledger.pay(&[&record]).await;

    let again = ledger
        .services
        .verification
        .verify(ledger.tenant_id, Some(ledger.payer_id), &proof(&provider_order_id, &payment_id))
        .await
        .unwrap();

    assert!(again.already_applied);
    assert_eq!(again.payments.len(), 1);
    assert_eq!(again.fee_records[0].status, FeeStatus::Paid);
    assert_eq!(ledger.store.payments().await.len(), 1);
}

#[tokio::test]
async fn exhausted_conflict_retries_surface_as_conflict() {
    let ledger = TestLedger::new().await;
    let record = ledger.add_record(10_000).await;
    let provider_order_id = ledger.open_order(&[&record]).await;
    let payment_id = ledger.gateway.capture(&provider_order_id, 10_000);

    // One initial attempt plus three retries.
    ledger.store.inject_conflicts(4);
    let err = ledger
        .services
        .verification
        .verify(ledger.tenant_id, None, &proof(&provider_order_id, &payment_id))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(ledger.store.payments().await.is_empty());
}
