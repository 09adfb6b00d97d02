mod common;

use common::{checkout_signature, webhook_signature, TestApp};
use serde_json::{json, Value};

#[tokio::test]
async fn health_and_readiness_respond() {
    let app = TestApp::spawn().await;
    let client = app.client();

    let health = client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "fee-payment-service-test");

    let ready = client.get(app.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status(), 200);

    let metrics = client.get(app.url("/metrics")).send().await.unwrap();
    assert_eq!(metrics.status(), 200);
}

#[tokio::test]
async fn create_order_requires_tenant_and_user() {
    let app = TestApp::spawn().await;
    let record = app.ledger.add_record(20_000).await;
    let body = json!({ "fee_record_ids": [record.id] });

    let anonymous = app
        .client()
        .post(app.url("/orders"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);

    let tenant_only = app
        .client()
        .post(app.url("/orders"))
        .header("X-Tenant-ID", app.ledger.tenant_id.to_string())
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(tenant_only.status(), 401);

    let malformed = app
        .client()
        .post(app.url("/orders"))
        .header("X-Tenant-ID", "not-a-uuid")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
}

#[tokio::test]
async fn order_checkout_and_verify_over_http() {
    let app = TestApp::spawn().await;
    let record = app.ledger.add_record(20_000).await;

    let created = app
        .as_payer(app.client().post(app.url("/orders")))
        .json(&json!({ "fee_record_ids": [record.id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let checkout: Value = created.json().await.unwrap();
    assert_eq!(checkout["amount"], 20_000);
    assert_eq!(checkout["key_id"], common::KEY_ID);
    assert_eq!(checkout["reused"], false);
    let provider_order_id = checkout["provider_order_id"].as_str().unwrap().to_string();

    let reused = app
        .as_payer(app.client().post(app.url("/orders")))
        .json(&json!({ "fee_record_ids": [record.id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(reused.status(), 200);

    let payment_id = app.ledger.gateway.capture(&provider_order_id, 20_000);
    let verified = app
        .as_payer(app.client().post(app.url("/payments/verify")))
        .json(&json!({
            "provider_order_id": provider_order_id,
            "provider_payment_id": payment_id,
            "signature": checkout_signature(&provider_order_id, &payment_id),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(verified.status(), 200);
    let outcome: Value = verified.json().await.unwrap();
    assert_eq!(outcome["already_applied"], false);
    assert_eq!(outcome["payments"].as_array().unwrap().len(), 1);

    let fetched = app
        .as_payer(app.client().get(app.url(&format!("/fee-records/{}", record.id))))
        .send()
        .await
        .unwrap();
    assert_eq!(fetched.status(), 200);
    let fetched: Value = fetched.json().await.unwrap();
    assert_eq!(fetched["status"], "PAID");
    assert_eq!(fetched["paid_amount"], 20_000);
}

#[tokio::test]
async fn forged_verification_is_rejected() {
    let app = TestApp::spawn().await;
    let record = app.ledger.add_record(20_000).await;
    let provider_order_id = app.ledger.open_order(&[&record]).await;
    let payment_id = app.ledger.gateway.capture(&provider_order_id, 20_000);

    let response = app
        .as_payer(app.client().post(app.url("/payments/verify")))
        .json(&json!({
            "provider_order_id": provider_order_id,
            "provider_payment_id": payment_id,
            "signature": "00".repeat(32),
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert!(app.ledger.store.payments().await.is_empty());
}

#[tokio::test]
async fn unknown_fee_record_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .as_payer(app.client().get(app.url(&format!("/fee-records/{}", uuid::Uuid::new_v4()))))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn webhook_signature_is_checked_over_raw_body() {
    let app = TestApp::spawn().await;
    let body = serde_json::to_vec(&json!({ "event": "invoice.paid", "payload": {} })).unwrap();

    let forged = app
        .client()
        .post(app.url("/webhooks/razorpay"))
        .header("X-Razorpay-Signature", webhook_signature(b"{}"))
        .header("X-Razorpay-Event-Id", "evt_http_1")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), 401);

    let genuine = app
        .client()
        .post(app.url("/webhooks/razorpay"))
        .header("X-Razorpay-Signature", webhook_signature(&body))
        .header("X-Razorpay-Event-Id", "evt_http_1")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(genuine.status(), 200);
    assert_eq!(app.ledger.store.webhook_events().await.len(), 1);
}

#[tokio::test]
async fn refund_endpoint_debits_record() {
    let app = TestApp::spawn().await;
    let record = app.ledger.add_record(30_000).await;
    let (provider_order_id, _) = app.ledger.pay(&[&record]).await;
    app.ledger.settled(&provider_order_id).await;
    let payment = app.ledger.store.payments().await.remove(0);

    let invalid = app
        .as_payer(app.client().post(app.url(&format!("/payments/{}/refunds", payment.id))))
        .json(&json!({ "amount": 10_000, "reason": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 422);

    let too_much = app
        .as_payer(app.client().post(app.url(&format!("/payments/{}/refunds", payment.id))))
        .json(&json!({ "amount": 40_000, "reason": "cancelled" }))
        .send()
        .await
        .unwrap();
    assert_eq!(too_much.status(), 400);

    let created = app
        .as_payer(app.client().post(app.url(&format!("/payments/{}/refunds", payment.id))))
        .json(&json!({ "amount": 10_000, "reason": "cancelled" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let refund: Value = created.json().await.unwrap();
    assert_eq!(refund["amount"], 10_000);
    assert_eq!(refund["status"], "PENDING");
    assert_eq!(refund["created_by"], app.ledger.payer_id.to_string());

    assert_eq!(app.ledger.fee_record(record.id).await.paid_amount, 20_000);
}
