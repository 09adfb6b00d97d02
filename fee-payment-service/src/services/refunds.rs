//! Refunds and chargebacks.
//!
//! A refund is written locally (PENDING, fee record debited) before the
//! provider is asked to move money, so a crash after the API call still
//! leaves a row the provider's webhook can confirm. If the provider rejects
//! the refund, the local rows are deleted and the debit restored.

use crate::error::{PaymentError, PaymentResult};
use crate::models::{Payment, Refund, RefundKind, RefundStatus, RefundTracking};
use crate::services::fees::{format_minor, refresh_status};
use crate::services::gateway::{PaymentGateway, ProviderDispute, ProviderRefund, RefundRequest};
use crate::services::metrics;
use crate::services::notifier::{Notification, NotificationKind, Notifier};
use crate::services::settlement::SettlementService;
use crate::store::{LedgerStore, LedgerTx};
use chrono::Utc;
use serde_json::json;
use service_core::retry::{retry_async, RetryConfig};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RefundRequestInput {
    pub payment_id: Uuid,
    pub amount: Option<i64>,
    pub reason: String,
    pub actor: String,
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    settlement: SettlementService,
    notifier: Arc<dyn Notifier>,
    retry: RetryConfig,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: SettlementService,
        notifier: Arc<dyn Notifier>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            settlement,
            notifier,
            retry,
        }
    }

    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, payment_id = %input.payment_id))]
    pub async fn initiate_refund(
        &self,
        tenant_id: Uuid,
        input: RefundRequestInput,
    ) -> PaymentResult<Refund> {
        let (mut refund, payment) = retry_async(
            &self.retry,
            "record_pending_refund",
            PaymentError::is_conflict,
            || self.record_pending(tenant_id, &input),
        )
        .await?;
        info!(refund_id = %refund.id, amount = refund.amount, "Refund recorded as pending");

        if let Some(order) = self.store.get_order(payment.order_id).await? {
            self.settlement
                .reverse_for_refund(&order, refund.amount)
                .await;
        }

        let request = RefundRequest {
            amount: refund.amount,
            notes: json!({
                "refund_id": refund.id.to_string(),
                "fee_record_id": refund.fee_record_id.to_string(),
            }),
        };
        match self
            .gateway
            .create_refund(&payment.provider_payment_id, &request)
            .await
        {
            Ok(provider_refund) => {
                self.store
                    .attach_provider_refund(refund.id, &provider_refund.id)
                    .await?;
                refund.provider_refund_id = Some(provider_refund.id);
                metrics::record_refund("initiated");
                Ok(refund)
            }
            Err(e) if e.is_transient() => {
                // The provider may have accepted it; the webhook or the
                // stale-refund check settles the outcome.
                warn!(
                    refund_id = %refund.id,
                    error = %e,
                    "Refund outcome unknown, leaving it pending"
                );
                metrics::record_refund("unknown");
                Ok(refund)
            }
            Err(e) => {
                warn!(refund_id = %refund.id, error = %e, "Provider rejected refund, compensating");
                retry_async(
                    &self.retry,
                    "compensate_refund",
                    PaymentError::is_conflict,
                    || self.compensate(tenant_id, refund.id),
                )
                .await?;
                metrics::record_refund("compensated");

                let mut notification = Notification::new(
                    NotificationKind::RefundFailed,
                    tenant_id,
                    format!("Refund of {} could not be processed", format_minor(refund.amount)),
                );
                notification.fee_record_id = Some(refund.fee_record_id);
                notification.amount = Some(refund.amount);
                self.notifier.notify(notification).await;

                Err(e.into())
            }
        }
    }

    async fn record_pending(
        &self,
        tenant_id: Uuid,
        input: &RefundRequestInput,
    ) -> PaymentResult<(Refund, Payment)> {
        let mut tx = self.store.begin().await?;

        let payment = tx
            .get_payment(tenant_id, input.payment_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("payment {} not found", input.payment_id)))?;

        let mut record = tx
            .lock_fee_record(tenant_id, payment.fee_record_id)
            .await?
            .ok_or_else(|| {
                PaymentError::not_found(format!("fee record {} not found", payment.fee_record_id))
            })?;

        let refundable = payment.amount - tx.refunded_for_payment(payment.id).await?;
        if refundable <= 0 {
            return Err(PaymentError::validation("payment is already fully refunded"));
        }
        let amount = input.amount.unwrap_or(refundable);
        if amount <= 0 {
            return Err(PaymentError::validation("refund amount must be greater than zero"));
        }
        if amount > refundable {
            return Err(PaymentError::validation(format!(
                "refund exceeds refundable amount of {}",
                format_minor(refundable)
            )));
        }
        let (paid_total, refunded_total) = tx.fee_record_totals(record.id).await?;
        if refunded_total + amount > paid_total {
            return Err(PaymentError::validation(
                "refunds would exceed payments received for this fee",
            ));
        }

        let now = Utc::now();
        let refund = Refund {
            id: Uuid::new_v4(),
            tenant_id,
            payment_id: payment.id,
            fee_record_id: record.id,
            amount,
            reason: input.reason.clone(),
            kind: RefundKind::Refund,
            status: RefundStatus::Pending,
            provider_refund_id: None,
            created_by: input.actor.clone(),
            created_at: now,
            updated_at: now,
        };
        let tracking = RefundTracking {
            refund_id: refund.id,
            provider_payment_id: payment.provider_payment_id.clone(),
            provider_refund_id: None,
            status: RefundStatus::Pending,
            updated_at: now,
        };
        tx.insert_refund(&refund, Some(&tracking)).await?;

        record.paid_amount -= amount;
        refresh_status(&mut record, now.date_naive());
        tx.update_fee_record_balance(&record).await?;

        tx.commit().await?;
        Ok((refund, payment))
    }

    /// Undo a refund the provider never accepted.
    async fn compensate(&self, tenant_id: Uuid, refund_id: Uuid) -> PaymentResult<()> {
        let mut tx = self.store.begin().await?;
        let Some(refund) = tx.lock_refund(refund_id).await? else {
            return Ok(());
        };
        credit_back(tx.as_mut(), tenant_id, refund.fee_record_id, refund.amount).await?;
        tx.delete_refund(refund.id).await?;
        tx.commit().await?;
        info!(refund_id = %refund_id, "Refund compensated");
        Ok(())
    }

    /// Find the local refund a provider refund event refers to.
    async fn find_refund(&self, provider_refund: &ProviderRefund) -> PaymentResult<Option<Refund>> {
        if let Some(refund) = self
            .store
            .refund_by_provider_refund(&provider_refund.id)
            .await?
        {
            return Ok(Some(refund));
        }
        let noted = provider_refund
            .notes
            .get("refund_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        match noted {
            Some(id) => self.store.get_refund(id).await,
            None => Ok(None),
        }
    }

    /// Provider accepted the refund. Returns false when the refund is unknown here.
    #[instrument(skip(self, provider_refund), fields(provider_refund_id = %provider_refund.id))]
    pub async fn confirm_refund(&self, provider_refund: &ProviderRefund) -> PaymentResult<bool> {
        let Some(refund) = self.find_refund(provider_refund).await? else {
            warn!("Refund event for unknown refund");
            return Ok(false);
        };

        let mut tx = self.store.begin().await?;
        let Some(locked) = tx.lock_refund(refund.id).await? else {
            return Ok(false);
        };
        if locked.status != RefundStatus::Pending {
            return Ok(true);
        }
        tx.set_refund_status(locked.id, RefundStatus::Confirmed, Some(&provider_refund.id))
            .await?;
        tx.commit().await?;

        metrics::record_refund("confirmed");
        info!(refund_id = %locked.id, "Refund confirmed");
        Ok(true)
    }

    /// Provider could not return the money: restore the debit and mark FAILED.
    #[instrument(skip(self, provider_refund), fields(provider_refund_id = %provider_refund.id))]
    pub async fn fail_refund(&self, provider_refund: &ProviderRefund) -> PaymentResult<bool> {
        let Some(refund) = self.find_refund(provider_refund).await? else {
            warn!("Refund failure for unknown refund");
            return Ok(false);
        };

        let mut tx = self.store.begin().await?;
        let Some(locked) = tx.lock_refund(refund.id).await? else {
            return Ok(false);
        };
        if locked.status == RefundStatus::Failed {
            return Ok(true);
        }
        let record =
            credit_back(tx.as_mut(), locked.tenant_id, locked.fee_record_id, locked.amount).await?;
        tx.set_refund_status(locked.id, RefundStatus::Failed, Some(&provider_refund.id))
            .await?;
        tx.commit().await?;

        metrics::record_refund("failed");
        warn!(refund_id = %locked.id, amount = locked.amount, "Refund failed at provider, debit restored");

        let mut notification = Notification::new(
            NotificationKind::RefundFailed,
            locked.tenant_id,
            format!("Refund of {} failed", format_minor(locked.amount)),
        );
        notification.payee_id = Some(record.payee_id);
        notification.member_id = Some(record.member_id);
        notification.fee_record_id = Some(record.id);
        notification.amount = Some(locked.amount);
        notification.reference = Some(provider_refund.id.clone());
        self.notifier.notify(notification).await;
        Ok(true)
    }

    /// A lost dispute takes the disputed amount back: record it as CONFIRMED
    /// chargebacks against the payment's records, oldest payment first.
    #[instrument(skip(self, dispute), fields(dispute_id = %dispute.id))]
    pub async fn record_chargeback(
        &self,
        dispute: &ProviderDispute,
        provider_payment_id: &str,
    ) -> PaymentResult<Vec<Refund>> {
        let mut payments = self
            .store
            .payments_by_provider_payment(provider_payment_id)
            .await?;
        if payments.is_empty() {
            warn!(provider_payment_id = %provider_payment_id, "Dispute for unknown payment");
            return Ok(Vec::new());
        }
        payments.sort_by_key(|p| (p.created_at, p.id));

        let mut tx = self.store.begin().await?;
        if !tx.refunds_by_provider_refund(&dispute.id).await?.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut remaining = dispute.amount;
        let mut chargebacks = Vec::new();
        for payment in &payments {
            if remaining <= 0 {
                break;
            }
            let refundable = payment.amount - tx.refunded_for_payment(payment.id).await?;
            let share = remaining.min(refundable);
            if share <= 0 {
                continue;
            }

            let chargeback = Refund {
                id: Uuid::new_v4(),
                tenant_id: payment.tenant_id,
                payment_id: payment.id,
                fee_record_id: payment.fee_record_id,
                amount: share,
                reason: format!(
                    "dispute lost{}",
                    dispute
                        .reason_code
                        .as_deref()
                        .map(|c| format!(": {}", c))
                        .unwrap_or_default()
                ),
                kind: RefundKind::Chargeback,
                status: RefundStatus::Confirmed,
                provider_refund_id: Some(dispute.id.clone()),
                created_by: "webhook".to_string(),
                created_at: now,
                updated_at: now,
            };
            tx.insert_refund(&chargeback, None).await?;

            let mut record = tx
                .lock_fee_record(payment.tenant_id, payment.fee_record_id)
                .await?
                .ok_or_else(|| {
                    PaymentError::not_found(format!("fee record {} not found", payment.fee_record_id))
                })?;
            record.paid_amount -= share;
            refresh_status(&mut record, now.date_naive());
            tx.update_fee_record_balance(&record).await?;

            remaining -= share;
            chargebacks.push(chargeback);
        }
        tx.commit().await?;

        metrics::record_refund("chargeback");
        for chargeback in &chargebacks {
            let mut notification = Notification::new(
                NotificationKind::DisputeLost,
                chargeback.tenant_id,
                format!("Dispute lost, {} charged back", format_minor(chargeback.amount)),
            );
            notification.fee_record_id = Some(chargeback.fee_record_id);
            notification.amount = Some(chargeback.amount);
            notification.reference = Some(dispute.id.clone());
            self.notifier.notify(notification).await;
        }
        Ok(chargebacks)
    }
}

/// Add `amount` back onto a locked fee record and recompute its status.
async fn credit_back(
    tx: &mut dyn LedgerTx,
    tenant_id: Uuid,
    fee_record_id: Uuid,
    amount: i64,
) -> PaymentResult<crate::models::FeeRecord> {
    let mut record = tx
        .lock_fee_record(tenant_id, fee_record_id)
        .await?
        .ok_or_else(|| PaymentError::not_found(format!("fee record {} not found", fee_record_id)))?;
    record.paid_amount += amount;
    refresh_status(&mut record, Utc::now().date_naive());
    tx.update_fee_record_balance(&record).await?;
    Ok(record)
}
