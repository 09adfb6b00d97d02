//! Razorpay webhook ingestion.
//!
//! Every event is authenticated over the raw request bytes, logged, and only
//! then dispatched. Handlers are idempotent, so a redelivered event that slips
//! past the event-id check is still harmless.

use crate::error::{PaymentError, PaymentResult};
use crate::models::{TransferStatus, WebhookEventLog};
use crate::services::ledger::LedgerApplier;
use crate::services::metrics;
use crate::services::notifier::{Notification, NotificationKind, Notifier};
use crate::services::razorpay::WebhookEvent;
use crate::services::refunds::RefundService;
use crate::store::LedgerStore;
use chrono::Utc;
use secrecy::{ExposeSecret, Secret};
use service_core::utils::signature::verify_hmac_sha256_hex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const WEBHOOK_ACTOR: &str = "webhook";

/// How the provider should treat its delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// Handled, or permanently unprocessable. Answer 200.
    Processed,
    /// Transient failure. Answer 500 so the provider redelivers.
    Retry,
}

#[derive(Clone)]
pub struct WebhookService {
    store: Arc<dyn LedgerStore>,
    applier: LedgerApplier,
    refunds: RefundService,
    notifier: Arc<dyn Notifier>,
    webhook_secret: Secret<String>,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        applier: LedgerApplier,
        refunds: RefundService,
        notifier: Arc<dyn Notifier>,
        webhook_secret: Secret<String>,
    ) -> Self {
        Self {
            store,
            applier,
            refunds,
            notifier,
            webhook_secret,
        }
    }

    #[instrument(skip(self, raw_body, signature), fields(event_id = ?event_id))]
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        event_id: Option<&str>,
    ) -> PaymentResult<WebhookAck> {
        let authentic = signature
            .map(|sig| {
                verify_hmac_sha256_hex(self.webhook_secret.expose_secret(), raw_body, sig)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !authentic {
            warn!(has_signature = signature.is_some(), "Rejected webhook with invalid signature");
            metrics::record_webhook("unknown", "rejected");
            return Err(PaymentError::InvalidSignature);
        }

        if let Some(event_id) = event_id {
            if self.store.webhook_event_processed(event_id).await? {
                info!("Duplicate webhook event, already processed");
                metrics::record_webhook("unknown", "duplicate");
                return Ok(WebhookAck::Processed);
            }
        }

        let payload: serde_json::Value = match serde_json::from_slice(raw_body) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Unparseable webhook body");
                let log = new_log(
                    event_id,
                    "unparseable",
                    serde_json::Value::String(String::from_utf8_lossy(raw_body).into_owned()),
                );
                self.store.insert_webhook_event(&log).await?;
                self.store
                    .finish_webhook_event(log.id, true, Some(&e.to_string()))
                    .await?;
                metrics::record_webhook("unparseable", "ignored");
                return Ok(WebhookAck::Processed);
            }
        };

        let event_type = payload
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let log = new_log(event_id, &event_type, payload.clone());
        self.store.insert_webhook_event(&log).await?;

        let result = match WebhookEvent::from_payload(payload) {
            Ok(event) => self.dispatch(&event).await,
            Err(e) => Err(PaymentError::validation(format!("malformed event: {}", e))),
        };

        match result {
            Ok(()) => {
                self.store.finish_webhook_event(log.id, true, None).await?;
                metrics::record_webhook(&event_type, "processed");
                Ok(WebhookAck::Processed)
            }
            Err(e) if e.is_transient() => {
                warn!(event = %event_type, error = %e, "Webhook processing failed, asking for redelivery");
                // Left unprocessed so the redelivery is not treated as a duplicate.
                if let Err(log_err) = self
                    .store
                    .finish_webhook_event(log.id, false, Some(&e.to_string()))
                    .await
                {
                    warn!(error = %log_err, "Could not record webhook failure");
                }
                metrics::record_webhook(&event_type, "retry");
                Ok(WebhookAck::Retry)
            }
            Err(e) => {
                warn!(event = %event_type, error = %e, "Webhook event could not be processed");
                self.store
                    .finish_webhook_event(log.id, true, Some(&e.to_string()))
                    .await?;
                metrics::record_webhook(&event_type, "failed");
                Ok(WebhookAck::Processed)
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> PaymentResult<()> {
        match event.event.as_str() {
            "payment.captured" | "order.paid" => self.on_payment_captured(event).await,
            "payment.failed" => self.on_payment_failed(event).await,
            "refund.created" | "refund.processed" => {
                let refund = event
                    .refund()
                    .ok_or_else(|| PaymentError::validation("refund entity missing"))?;
                self.refunds.confirm_refund(refund).await.map(|_| ())
            }
            "refund.failed" => {
                let refund = event
                    .refund()
                    .ok_or_else(|| PaymentError::validation("refund entity missing"))?;
                self.refunds.fail_refund(refund).await.map(|_| ())
            }
            "payment.dispute.created" => {
                self.notify_dispute(event, NotificationKind::DisputeCreated)
                    .await
            }
            "payment.dispute.closed" | "payment.dispute.won" => {
                self.notify_dispute(event, NotificationKind::DisputeClosed)
                    .await
            }
            "payment.dispute.lost" => {
                let dispute = event
                    .dispute()
                    .ok_or_else(|| PaymentError::validation("dispute entity missing"))?;
                let payment_id = disputed_payment_id(event)
                    .ok_or_else(|| PaymentError::validation("dispute has no payment"))?;
                self.refunds
                    .record_chargeback(dispute, &payment_id)
                    .await
                    .map(|_| ())
            }
            "transfer.processed" | "transfer.settled" | "transfer.failed" => {
                self.on_transfer(event).await
            }
            other => {
                debug!(event = %other, "Ignoring unhandled webhook event");
                Ok(())
            }
        }
    }

    async fn on_payment_captured(&self, event: &WebhookEvent) -> PaymentResult<()> {
        let payment = event
            .payment()
            .ok_or_else(|| PaymentError::validation("payment entity missing"))?;
        let Some(provider_order_id) = payment
            .order_id
            .clone()
            .or_else(|| event.order().map(|o| o.id.clone()))
        else {
            warn!(provider_payment_id = %payment.id, "Captured payment without an order");
            return Ok(());
        };

        let orders = self
            .store
            .orders_by_provider_order(&provider_order_id)
            .await?;
        if orders.is_empty() {
            warn!(provider_order_id = %provider_order_id, "Captured payment for unknown order");
            return Ok(());
        }
        if !payment.is_captured() {
            warn!(
                provider_payment_id = %payment.id,
                status = %payment.status,
                "Capture event for a payment that is not captured"
            );
            return Err(PaymentError::validation(format!(
                "payment {} is {}, not captured",
                payment.id, payment.status
            )));
        }
        if orders[0].total_amount != payment.amount {
            warn!(
                provider_order_id = %provider_order_id,
                provider_amount = payment.amount,
                expected_amount = orders[0].total_amount,
                "Captured amount does not match order"
            );
            return Err(PaymentError::AmountMismatch);
        }

        for order in orders.iter().filter(|o| !o.payment_applied) {
            match self
                .applier
                .apply(order.id, &payment.id, None, WEBHOOK_ACTOR)
                .await
            {
                Ok(_) | Err(PaymentError::AlreadySettled) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn on_payment_failed(&self, event: &WebhookEvent) -> PaymentResult<()> {
        let payment = event
            .payment()
            .ok_or_else(|| PaymentError::validation("payment entity missing"))?;
        let Some(provider_order_id) = payment.order_id.as_deref() else {
            return Ok(());
        };
        let reason = payment
            .error_description
            .as_deref()
            .unwrap_or("payment failed");
        let failed = self
            .store
            .fail_open_orders(provider_order_id, reason)
            .await?;
        info!(provider_order_id = %provider_order_id, failed, "Orders marked failed");
        Ok(())
    }

    async fn on_transfer(&self, event: &WebhookEvent) -> PaymentResult<()> {
        let transfer = event
            .transfer()
            .ok_or_else(|| PaymentError::validation("transfer entity missing"))?;
        let Some(order) = self.store.order_by_transfer_id(&transfer.id).await? else {
            warn!(transfer_id = %transfer.id, "Transfer event for unknown transfer");
            return Ok(());
        };

        let suffix = event.event.trim_start_matches("transfer.");
        let status = TransferStatus::from_provider(suffix);
        let error = (status == TransferStatus::Failed).then_some("transfer failed at provider");
        self.store
            .set_transfer_status(order.id, status, error)
            .await?;
        metrics::record_transfer(suffix);
        info!(order_id = %order.id, transfer_id = %transfer.id, status = ?status, "Transfer status updated");
        Ok(())
    }

    async fn notify_dispute(&self, event: &WebhookEvent, kind: NotificationKind) -> PaymentResult<()> {
        let Some(payment_id) = disputed_payment_id(event) else {
            return Err(PaymentError::validation("dispute has no payment"));
        };
        let dispute = event.dispute();
        let payments = self.store.payments_by_provider_payment(&payment_id).await?;
        if payments.is_empty() {
            warn!(provider_payment_id = %payment_id, "Dispute for unknown payment");
            return Ok(());
        }

        for payment in payments {
            let record = self
                .store
                .get_fee_record(payment.tenant_id, payment.fee_record_id)
                .await?;
            let mut notification = Notification::new(
                kind,
                payment.tenant_id,
                format!("Dispute update for receipt {}", payment.receipt_number),
            );
            notification.fee_record_id = Some(payment.fee_record_id);
            notification.payee_id = record.as_ref().map(|r| r.payee_id);
            notification.member_id = record.as_ref().map(|r| r.member_id);
            notification.amount = dispute.map(|d| d.amount);
            notification.reference = dispute.map(|d| d.id.clone());
            self.notifier.notify(notification).await;
        }
        Ok(())
    }
}

fn disputed_payment_id(event: &WebhookEvent) -> Option<String> {
    event
        .dispute()
        .map(|d| d.payment_id.clone())
        .filter(|id| !id.is_empty())
        .or_else(|| event.payment().map(|p| p.id.clone()))
}

fn new_log(event_id: Option<&str>, event_type: &str, payload: serde_json::Value) -> WebhookEventLog {
    WebhookEventLog {
        id: Uuid::new_v4(),
        provider_event_id: event_id.map(str::to_string),
        event_type: event_type.to_string(),
        payload,
        processed: false,
        error: None,
        received_at: Utc::now(),
        processed_at: None,
    }
}
