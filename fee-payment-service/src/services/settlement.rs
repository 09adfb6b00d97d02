//! Marketplace split settlement.
//!
//! Each applied order sends the payee its share of the payment minus the
//! platform commission snapshotted on the order. Settlement failures are
//! recorded on the order and never affect the payment itself; the transfer
//! retry job picks them up later.

use crate::error::{PaymentError, PaymentResult};
use crate::models::{Order, Payee, TransferStatus};
use crate::services::fees::round_half_up;
use crate::services::gateway::{PaymentGateway, TransferRequest};
use crate::services::metrics;
use crate::store::{LedgerStore, TransferUpdate};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub platform_fee: i64,
    pub transfer_amount: i64,
}

/// Platform keeps `round_half_up(amount × rate)`; the payee gets the rest.
pub fn split_amount(amount: i64, commission_rate: Decimal) -> Split {
    let platform_fee = round_half_up(Decimal::from(amount) * commission_rate);
    Split {
        platform_fee,
        transfer_amount: amount - platform_fee,
    }
}

/// Share of a transfer to claw back when `refund_amount` of `order_amount` is refunded.
pub fn proportional_reversal(refund_amount: i64, transfer_amount: i64, order_amount: i64) -> i64 {
    if order_amount <= 0 {
        return 0;
    }
    round_half_up(
        Decimal::from(refund_amount) * Decimal::from(transfer_amount) / Decimal::from(order_amount),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Transferred { transfer_id: String, amount: i64 },
    Failed { error: String },
    Skipped(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferRetryReport {
    pub scanned: usize,
    pub attached: usize,
    pub created: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SettlementService {
    pub fn new(store: Arc<dyn LedgerStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Transfer the payee's share of an applied order, once.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn settle_order(&self, order_id: Uuid) -> PaymentResult<SettleOutcome> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("order {} not found", order_id)))?;

        if !order.payment_applied {
            return Ok(SettleOutcome::Skipped("order not applied"));
        }
        if order.transfer_id.is_some() {
            return Ok(SettleOutcome::Skipped("transfer already exists"));
        }
        let Some(payee) = self.ready_payee(&order).await? else {
            return Ok(SettleOutcome::Skipped("payee not settlement ready"));
        };

        self.create_transfer(&order, &payee).await
    }

    async fn ready_payee(&self, order: &Order) -> PaymentResult<Option<Payee>> {
        let payee = self.store.get_payee(order.tenant_id, order.payee_id).await?;
        Ok(payee.filter(|p| p.is_settlement_ready()))
    }

    async fn create_transfer(&self, order: &Order, payee: &Payee) -> PaymentResult<SettleOutcome> {
        let split = split_amount(order.amount, order.commission_rate);
        if split.transfer_amount <= 0 {
            return Ok(SettleOutcome::Skipped("nothing to transfer"));
        }
        let (Some(payment_id), Some(account)) = (
            order.provider_payment_id.as_deref(),
            payee.linked_account_id.as_deref(),
        ) else {
            return Ok(SettleOutcome::Skipped("missing payment or linked account"));
        };

        let request = TransferRequest {
            account: account.to_string(),
            amount: split.transfer_amount,
            currency: order.currency.clone(),
            notes: json!({
                "order_id": order.id.to_string(),
                "fee_record_id": order.fee_record_id.to_string(),
            }),
            on_hold: false,
        };

        match self.gateway.create_transfer(payment_id, &request).await {
            Ok(transfer) => {
                let status = transfer
                    .status
                    .as_deref()
                    .map(TransferStatus::from_provider)
                    .unwrap_or(TransferStatus::Created);
                self.store
                    .update_transfer(
                        order.id,
                        &TransferUpdate {
                            transfer_id: Some(transfer.id.clone()),
                            status,
                            platform_fee: split.platform_fee,
                            transfer_amount: split.transfer_amount,
                            error: None,
                        },
                    )
                    .await?;
                metrics::record_transfer("created");
                info!(
                    order_id = %order.id,
                    transfer_id = %transfer.id,
                    transfer_amount = split.transfer_amount,
                    platform_fee = split.platform_fee,
                    "Settlement transfer created"
                );
                Ok(SettleOutcome::Transferred {
                    transfer_id: transfer.id,
                    amount: split.transfer_amount,
                })
            }
            Err(e) => {
                let error = e.to_string();
                self.store
                    .update_transfer(
                        order.id,
                        &TransferUpdate {
                            transfer_id: None,
                            status: TransferStatus::Failed,
                            platform_fee: split.platform_fee,
                            transfer_amount: split.transfer_amount,
                            error: Some(error.clone()),
                        },
                    )
                    .await?;
                metrics::record_transfer("failed");
                warn!(order_id = %order.id, error = %error, "Settlement transfer failed");
                Ok(SettleOutcome::Failed { error })
            }
        }
    }

    /// Claw back the payee's share of a refund. Returns the amount reversed.
    /// Failures are logged and reported as `None`; the refund proceeds regardless.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn reverse_for_refund(&self, order: &Order, refund_amount: i64) -> Option<i64> {
        let transfer_id = order.transfer_id.as_deref()?;
        let transfer_amount = order.transfer_amount?;
        if order.transfer_status == Some(TransferStatus::Failed) {
            return None;
        }

        let unreversed = transfer_amount - order.reversed_amount;
        let amount = proportional_reversal(refund_amount, transfer_amount, order.amount).min(unreversed);
        if amount <= 0 {
            return None;
        }

        match self.gateway.reverse_transfer(transfer_id, amount).await {
            Ok(reversal) => {
                if let Err(e) = self.store.add_reversed_amount(order.id, amount).await {
                    warn!(error = %e, "Transfer reversed but reversed amount not recorded");
                }
                metrics::record_transfer("reversed");
                info!(
                    transfer_id = %transfer_id,
                    reversal_id = %reversal.id,
                    amount = amount,
                    "Settlement transfer reversed"
                );
                Some(amount)
            }
            Err(e) => {
                metrics::record_transfer("reversal_failed");
                warn!(transfer_id = %transfer_id, error = %e, "Transfer reversal failed");
                None
            }
        }
    }

    /// Find applied orders whose transfer is missing or failed and either attach
    /// an existing provider transfer or create a new one.
    #[instrument(skip(self))]
    pub async fn retry_transfers(&self, grace: Duration) -> PaymentResult<TransferRetryReport> {
        let orders = self
            .store
            .orders_missing_transfer(Utc::now() - grace)
            .await?;
        let mut report = TransferRetryReport {
            scanned: orders.len(),
            ..Default::default()
        };

        for order in orders {
            match self.retry_one(&order).await {
                Ok(RetryResult::Attached) => report.attached += 1,
                Ok(RetryResult::Created) => report.created += 1,
                Ok(RetryResult::Failed) => report.failed += 1,
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Transfer retry failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            attached = report.attached,
            created = report.created,
            failed = report.failed,
            "Transfer retry finished"
        );
        Ok(report)
    }

    async fn retry_one(&self, order: &Order) -> PaymentResult<RetryResult> {
        let Some(payee) = self.ready_payee(order).await? else {
            return Ok(RetryResult::Failed);
        };
        let Some(payment_id) = order.provider_payment_id.as_deref() else {
            return Ok(RetryResult::Failed);
        };

        let order_ref = order.id.to_string();
        let existing = self.gateway.list_payment_transfers(payment_id).await?;
        if let Some(transfer) = existing.into_iter().find(|t| {
            t.note("order_id") == Some(order_ref.as_str())
                && t.status.as_deref() != Some("failed")
                && t.status.as_deref() != Some("reversed")
        }) {
            let split = split_amount(order.amount, order.commission_rate);
            let status = transfer
                .status
                .as_deref()
                .map(TransferStatus::from_provider)
                .unwrap_or(TransferStatus::Created);
            self.store
                .update_transfer(
                    order.id,
                    &TransferUpdate {
                        transfer_id: Some(transfer.id.clone()),
                        status,
                        platform_fee: split.platform_fee,
                        transfer_amount: transfer.amount,
                        error: None,
                    },
                )
                .await?;
            metrics::record_transfer("attached");
            info!(order_id = %order.id, transfer_id = %transfer.id, "Attached orphaned transfer");
            return Ok(RetryResult::Attached);
        }

        match self.create_transfer(order, &payee).await? {
            SettleOutcome::Transferred { .. } => Ok(RetryResult::Created),
            _ => Ok(RetryResult::Failed),
        }
    }
}

enum RetryResult {
    Attached,
    Created,
    Failed,
}
