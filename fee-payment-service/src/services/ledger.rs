//! Ledger application: the single routine that credits a fee record for a
//! captured payment.
//!
//! Both the verification path and the webhook path funnel through `apply`.
//! Exactly-once application rests on three layers: the applied flag checked
//! before and again under the order's row lock, a serializable transaction,
//! and the unique `(fee_record_id, provider_payment_id)` constraint on
//! payments. The applier never retries; callers decide what to do with a
//! `SerializationConflict`.

use crate::error::{PaymentError, PaymentResult};
use crate::models::{FeeRecord, FeeStatus, Order, Payment};
use crate::services::fees::{
    next_cycle_record, next_due_date, receipt_number, receipt_period, refresh_status,
};
use crate::services::metrics;
use crate::services::notifier::{Notification, NotificationKind, Notifier};
use crate::services::settlement::SettlementService;
use crate::store::{LedgerStore, LedgerTx};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        payment: Payment,
        fee_record: FeeRecord,
        next_record: Option<FeeRecord>,
    },
    AlreadyApplied {
        order: Order,
    },
}

impl ApplyOutcome {
    pub fn payment(&self) -> Option<&Payment> {
        match self {
            Self::Applied { payment, .. } => Some(payment),
            Self::AlreadyApplied { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct LedgerApplier {
    store: Arc<dyn LedgerStore>,
    settlement: SettlementService,
    notifier: Arc<dyn Notifier>,
}

impl LedgerApplier {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settlement: SettlementService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            settlement,
            notifier,
        }
    }

    /// Credit the order's fee record with its allocation of a captured payment.
    #[instrument(skip(self, signature), fields(order_id = %order_id, actor = %actor))]
    pub async fn apply(
        &self,
        order_id: Uuid,
        provider_payment_id: &str,
        signature: Option<&str>,
        actor: &str,
    ) -> PaymentResult<ApplyOutcome> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("order {} not found", order_id)))?;
        if order.payment_applied {
            debug!("Order already applied");
            metrics::record_apply("already_applied", actor);
            return Ok(ApplyOutcome::AlreadyApplied { order });
        }

        let result = self
            .apply_in_transaction(order_id, provider_payment_id, signature, actor)
            .await;

        match &result {
            Ok(ApplyOutcome::Applied {
                payment,
                fee_record,
                next_record,
            }) => {
                metrics::record_apply("applied", actor);
                metrics::record_amount(&order.currency, payment.amount);
                info!(
                    fee_record_id = %fee_record.id,
                    payment_id = %payment.id,
                    receipt_number = %payment.receipt_number,
                    amount = payment.amount,
                    status = %fee_record.status,
                    next_record_id = ?next_record.as_ref().map(|r| r.id),
                    "Payment applied to ledger"
                );
                self.spawn_follow_up(order_id, payment.clone(), fee_record.clone());
            }
            Ok(ApplyOutcome::AlreadyApplied { .. }) => {
                metrics::record_apply("already_applied", actor);
            }
            Err(e) if e.is_conflict() => {
                metrics::record_apply("conflict", actor);
                debug!("Serialization conflict while applying payment");
            }
            Err(PaymentError::AlreadySettled) => {
                metrics::record_apply("duplicate_payment", actor);
            }
            Err(e) => {
                metrics::record_apply("error", actor);
                warn!(error = %e, "Ledger application failed");
            }
        }

        result
    }

    async fn apply_in_transaction(
        &self,
        order_id: Uuid,
        provider_payment_id: &str,
        signature: Option<&str>,
        actor: &str,
    ) -> PaymentResult<ApplyOutcome> {
        let mut tx = self.store.begin().await?;

        let order = tx
            .lock_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("order {} not found", order_id)))?;
        if order.payment_applied {
            return Ok(ApplyOutcome::AlreadyApplied { order });
        }

        let mut record = tx
            .lock_fee_record(order.tenant_id, order.fee_record_id)
            .await?
            .ok_or_else(|| {
                PaymentError::not_found(format!("fee record {} not found", order.fee_record_id))
            })?;

        let now = Utc::now();
        let period = receipt_period(now);
        let sequence = tx
            .next_receipt_value(order.tenant_id, record.member_id, &period)
            .await?;
        let receipt = receipt_number(&period, sequence);

        let payment = Payment {
            id: Uuid::new_v4(),
            tenant_id: order.tenant_id,
            fee_record_id: record.id,
            payer_id: record.member_id,
            order_id: order.id,
            provider_payment_id: provider_payment_id.to_string(),
            amount: order.amount,
            receipt_number: receipt.clone(),
            recorded_by: actor.to_string(),
            created_at: now,
        };
        tx.insert_payment(&payment).await?;

        let previous_status = record.status;
        record.paid_amount += order.amount;
        refresh_status(&mut record, now.date_naive());
        record.last_receipt_number = Some(receipt);
        record.last_paid_at = Some(now);
        record.updated_at = now;
        tx.update_fee_record_balance(&record).await?;

        tx.mark_order_applied(order.id, provider_payment_id, signature)
            .await?;

        let next_record = if previous_status != FeeStatus::Paid && record.status == FeeStatus::Paid
        {
            generate_next_cycle(tx.as_mut(), &record, now).await?
        } else {
            None
        };

        tx.commit().await?;

        Ok(ApplyOutcome::Applied {
            payment,
            fee_record: record,
            next_record,
        })
    }

    /// Settlement and confirmation run after commit and never change the outcome.
    fn spawn_follow_up(&self, order_id: Uuid, payment: Payment, record: FeeRecord) {
        let settlement = self.settlement.clone();
        let notifier = self.notifier.clone();
        let span = tracing::info_span!("payment_follow_up", order_id = %order_id);

        tokio::spawn(
            async move {
                match settlement.settle_order(order_id).await {
                    Ok(outcome) => debug!(?outcome, "Settlement finished"),
                    Err(e) => warn!(error = %e, "Settlement attempt failed"),
                }

                let mut notification = Notification::new(
                    NotificationKind::PaymentConfirmed,
                    payment.tenant_id,
                    format!("Payment received, receipt {}", payment.receipt_number),
                );
                notification.payee_id = Some(record.payee_id);
                notification.member_id = Some(record.member_id);
                notification.fee_record_id = Some(record.id);
                notification.amount = Some(payment.amount);
                notification.reference = Some(payment.receipt_number.clone());
                notifier.notify(notification).await;
            }
            .instrument(span),
        );
    }
}

/// Create the next billing-cycle record of a recurring assignment, once per due date.
async fn generate_next_cycle(
    tx: &mut dyn LedgerTx,
    record: &FeeRecord,
    now: DateTime<Utc>,
) -> PaymentResult<Option<FeeRecord>> {
    let Some(assignment_id) = record.assignment_id else {
        return Ok(None);
    };
    let Some(assignment) = tx.get_assignment(record.tenant_id, assignment_id).await? else {
        return Ok(None);
    };
    if !assignment.generates_next_cycle() {
        return Ok(None);
    }
    let Some(due_date) = next_due_date(record.due_date, assignment.cycle) else {
        return Ok(None);
    };
    if tx
        .fee_record_exists_for_due_date(assignment_id, due_date)
        .await?
    {
        return Ok(None);
    }

    let next = next_cycle_record(&assignment, due_date, now);
    tx.insert_fee_record(&next).await?;
    info!(
        assignment_id = %assignment_id,
        fee_record_id = %next.id,
        due_date = %due_date,
        "Next billing cycle record created"
    );
    Ok(Some(next))
}
