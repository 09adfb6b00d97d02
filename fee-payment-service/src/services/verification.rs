//! Client-side payment confirmation.
//!
//! The checkout client posts back the provider's payment proof. The proof is
//! authenticated, cross-checked against the provider's own record of the
//! payment, and then applied through the ledger with bounded retries on
//! serialization conflicts.

use crate::error::{PaymentError, PaymentResult};
use crate::models::{FeeRecord, Payment};
use crate::services::gateway::PaymentGateway;
use crate::services::ledger::{ApplyOutcome, LedgerApplier};
use crate::store::LedgerStore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::retry::{retry_async, RetryConfig};
use service_core::utils::signature::verify_hmac_sha256_hex;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const VERIFICATION_ACTOR: &str = "verification";

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentProof {
    pub provider_order_id: String,
    pub provider_payment_id: String,
    pub signature: String,
    pub fee_record_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub already_applied: bool,
    pub fee_records: Vec<FeeRecord>,
    pub payments: Vec<Payment>,
}

#[derive(Clone)]
pub struct VerificationService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    applier: LedgerApplier,
    key_secret: Secret<String>,
    retry: RetryConfig,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        applier: LedgerApplier,
        key_secret: Secret<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            applier,
            key_secret,
            retry,
        }
    }

    #[instrument(
        skip(self, proof),
        fields(
            tenant_id = %tenant_id,
            provider_order_id = %proof.provider_order_id,
            provider_payment_id = %proof.provider_payment_id
        )
    )]
    pub async fn verify(
        &self,
        tenant_id: Uuid,
        payer_id: Option<Uuid>,
        proof: &PaymentProof,
    ) -> PaymentResult<VerifyOutcome> {
        self.check_signature(proof)?;

        let orders: Vec<_> = self
            .store
            .orders_by_provider_order(&proof.provider_order_id)
            .await?
            .into_iter()
            .filter(|o| o.tenant_id == tenant_id)
            .collect();
        if orders.is_empty() {
            return Err(PaymentError::not_found("order not found"));
        }
        if let Some(claimed) = proof.fee_record_id {
            if !orders.iter().any(|o| o.fee_record_id == claimed) {
                return Err(PaymentError::validation(
                    "fee record does not belong to this order",
                ));
            }
        }
        if let Some(payer_id) = payer_id {
            if orders.iter().any(|o| o.payer_id != payer_id) {
                return Err(PaymentError::Forbidden(
                    "order belongs to another payer".to_string(),
                ));
            }
        }

        let record_ids: Vec<Uuid> = orders.iter().map(|o| o.fee_record_id).collect();

        if orders.iter().all(|o| o.payment_applied) {
            info!("Payment already applied");
            return Ok(VerifyOutcome {
                already_applied: true,
                fee_records: self.store.get_fee_records(tenant_id, &record_ids).await?,
                payments: self.recorded_payments(tenant_id, &proof.provider_payment_id).await?,
            });
        }

        let payment = self
            .gateway
            .fetch_payment(&proof.provider_payment_id)
            .await?;
        let expected_total = orders[0].total_amount;
        if payment.order_id.as_deref() != Some(proof.provider_order_id.as_str())
            || !payment.is_captured()
            || payment.amount != expected_total
        {
            warn!(
                provider_status = %payment.status,
                provider_amount = payment.amount,
                provider_order = ?payment.order_id,
                expected_amount = expected_total,
                "Suspicious payment proof: provider record does not match order"
            );
            return Err(PaymentError::AmountMismatch);
        }

        let mut payments = Vec::new();
        for order in orders.iter().filter(|o| !o.payment_applied) {
            let outcome = retry_async(
                &self.retry,
                "ledger_apply",
                PaymentError::is_conflict,
                || {
                    self.applier.apply(
                        order.id,
                        &proof.provider_payment_id,
                        Some(&proof.signature),
                        VERIFICATION_ACTOR,
                    )
                },
            )
            .await?;
            if let ApplyOutcome::Applied { payment, .. } = outcome {
                payments.push(payment);
            }
        }

        Ok(VerifyOutcome {
            already_applied: payments.is_empty(),
            fee_records: self.store.get_fee_records(tenant_id, &record_ids).await?,
            payments,
        })
    }

    fn check_signature(&self, proof: &PaymentProof) -> PaymentResult<()> {
        let payload = format!("{}|{}", proof.provider_order_id, proof.provider_payment_id);
        let valid = verify_hmac_sha256_hex(
            self.key_secret.expose_secret(),
            payload.as_bytes(),
            &proof.signature,
        )
        .unwrap_or(false);

        if !valid {
            warn!(
                provider_order_id = %proof.provider_order_id,
                provider_payment_id = %proof.provider_payment_id,
                "Payment signature mismatch, possible tampering"
            );
            return Err(PaymentError::InvalidSignature);
        }
        Ok(())
    }

    async fn recorded_payments(
        &self,
        tenant_id: Uuid,
        provider_payment_id: &str,
    ) -> PaymentResult<Vec<Payment>> {
        Ok(self
            .store
            .payments_by_provider_payment(provider_payment_id)
            .await?
            .into_iter()
            .filter(|p| p.tenant_id == tenant_id)
            .collect())
    }
}
