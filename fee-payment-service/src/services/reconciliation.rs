//! Offline consistency jobs.
//!
//! All jobs produce reports; none of them corrects the ledger. The only
//! mutation is the transfer retry, which attaches or creates settlement
//! transfers.

use crate::config::PolicyConfig;
use crate::error::PaymentResult;
use crate::models::{OrderStatus, RefundStatus};
use crate::services::fees::AMOUNT_TOLERANCE;
use crate::services::gateway::PaymentGateway;
use crate::services::settlement::{SettlementService, TransferRetryReport};
use crate::store::{DuplicatePayment, LedgerStore};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingPayment {
    pub payment_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmountDifference {
    pub payment_id: String,
    pub provider_amount: i64,
    pub local_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub date: NaiveDate,
    pub provider_payments: usize,
    pub local_payments: usize,
    pub missing_locally: Vec<MissingPayment>,
    pub missing_at_provider: Vec<MissingPayment>,
    pub amount_mismatches: Vec<AmountDifference>,
}

impl DayReport {
    pub fn has_anomalies(&self) -> bool {
        !self.missing_locally.is_empty()
            || !self.missing_at_provider.is_empty()
            || !self.amount_mismatches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerDrift {
    pub fee_record_id: Uuid,
    pub tenant_id: Uuid,
    pub paid_amount: i64,
    pub expected_paid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overpayment {
    pub fee_record_id: Uuid,
    pub tenant_id: Uuid,
    pub paid_amount: i64,
    pub final_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub records_checked: usize,
    pub drift: Vec<LedgerDrift>,
    pub overpaid: Vec<Overpayment>,
}

impl IntegrityReport {
    pub fn has_anomalies(&self) -> bool {
        !self.drift.is_empty() || !self.overpaid.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub stale_orders: Vec<StaleItem>,
    pub stale_refunds: Vec<StaleItem>,
    pub duplicate_payments: Vec<DuplicatePayment>,
    pub missing_transfers: Vec<StaleItem>,
}

impl HealthReport {
    pub fn has_anomalies(&self) -> bool {
        !self.stale_orders.is_empty()
            || !self.stale_refunds.is_empty()
            || !self.duplicate_payments.is_empty()
            || !self.missing_transfers.is_empty()
    }
}

/// Yesterday in UTC, the default day to reconcile.
pub fn default_recon_date(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::days(1)).date_naive()
}

/// Compare per-payment totals from both sides.
pub fn compare_day(
    date: NaiveDate,
    provider: &BTreeMap<String, i64>,
    local: &BTreeMap<String, i64>,
) -> DayReport {
    let missing_locally = provider
        .iter()
        .filter(|(id, _)| !local.contains_key(*id))
        .map(|(id, amount)| MissingPayment {
            payment_id: id.clone(),
            amount: *amount,
        })
        .collect();
    let missing_at_provider = local
        .iter()
        .filter(|(id, _)| !provider.contains_key(*id))
        .map(|(id, amount)| MissingPayment {
            payment_id: id.clone(),
            amount: *amount,
        })
        .collect();
    let amount_mismatches = provider
        .iter()
        .filter_map(|(id, provider_amount)| {
            let local_amount = *local.get(id)?;
            ((provider_amount - local_amount).abs() > AMOUNT_TOLERANCE).then(|| AmountDifference {
                payment_id: id.clone(),
                provider_amount: *provider_amount,
                local_amount,
            })
        })
        .collect();

    DayReport {
        date,
        provider_payments: provider.len(),
        local_payments: local.len(),
        missing_locally,
        missing_at_provider,
        amount_mismatches,
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    settlement: SettlementService,
    policy: PolicyConfig,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: SettlementService,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            settlement,
            policy,
        }
    }

    /// Provider captured payments of `date` against locally recorded payments of the same day.
    #[instrument(skip(self))]
    pub async fn reconcile_day(&self, date: NaiveDate) -> PaymentResult<DayReport> {
        let from = date.and_time(chrono::NaiveTime::MIN).and_utc();
        let to = from + Duration::days(1);

        let mut provider: BTreeMap<String, i64> = BTreeMap::new();
        for payment in self.gateway.list_captured_payments(from, to).await? {
            *provider.entry(payment.id).or_default() += payment.amount;
        }

        // A multi-record order produces several local rows for one provider payment.
        let mut local: BTreeMap<String, i64> = BTreeMap::new();
        for payment in self.store.payments_created_between(from, to).await? {
            *local.entry(payment.provider_payment_id).or_default() += payment.amount;
        }

        let report = compare_day(date, &provider, &local);
        if report.has_anomalies() {
            warn!(
                date = %date,
                missing_locally = report.missing_locally.len(),
                missing_at_provider = report.missing_at_provider.len(),
                amount_mismatches = report.amount_mismatches.len(),
                "Day reconciliation found discrepancies"
            );
        } else {
            info!(date = %date, payments = report.provider_payments, "Day reconciliation clean");
        }
        Ok(report)
    }

    /// Every record's paid amount must equal its payments minus its non-failed refunds.
    #[instrument(skip(self))]
    pub async fn check_integrity(&self) -> PaymentResult<IntegrityReport> {
        let totals = self.store.ledger_totals().await?;
        let mut report = IntegrityReport {
            records_checked: totals.len(),
            drift: Vec::new(),
            overpaid: Vec::new(),
        };

        for t in totals {
            let expected_paid = t.payments_total - t.refunds_total;
            if (t.paid_amount - expected_paid).abs() > AMOUNT_TOLERANCE {
                report.drift.push(LedgerDrift {
                    fee_record_id: t.fee_record_id,
                    tenant_id: t.tenant_id,
                    paid_amount: t.paid_amount,
                    expected_paid,
                });
            }
            if t.paid_amount > t.final_amount + AMOUNT_TOLERANCE {
                report.overpaid.push(Overpayment {
                    fee_record_id: t.fee_record_id,
                    tenant_id: t.tenant_id,
                    paid_amount: t.paid_amount,
                    final_amount: t.final_amount,
                });
            }
        }

        if report.has_anomalies() {
            warn!(
                drift = report.drift.len(),
                overpaid = report.overpaid.len(),
                "Ledger integrity violations found"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn run_health_checks(&self) -> PaymentResult<HealthReport> {
        let now = Utc::now();

        let stale_orders = self
            .store
            .stale_open_orders(now - self.policy.stale_order_after)
            .await?
            .into_iter()
            .filter(|o| o.status == OrderStatus::Created)
            .map(|o| StaleItem {
                id: o.id,
                tenant_id: o.tenant_id,
                amount: o.amount,
                created_at: o.created_at,
            })
            .collect();

        let stale_refunds = self
            .store
            .stale_pending_refunds(now - self.policy.stale_refund_after)
            .await?
            .into_iter()
            .filter(|r| r.status == RefundStatus::Pending)
            .map(|r| StaleItem {
                id: r.id,
                tenant_id: r.tenant_id,
                amount: r.amount,
                created_at: r.created_at,
            })
            .collect();

        let duplicate_payments = self.store.duplicate_payments().await?;

        let missing_transfers = self
            .store
            .orders_missing_transfer(now - self.policy.transfer_retry_grace)
            .await?
            .into_iter()
            .map(|o| StaleItem {
                id: o.id,
                tenant_id: o.tenant_id,
                amount: o.amount,
                created_at: o.created_at,
            })
            .collect();

        let report = HealthReport {
            stale_orders,
            stale_refunds,
            duplicate_payments,
            missing_transfers,
        };
        info!(
            stale_orders = report.stale_orders.len(),
            stale_refunds = report.stale_refunds.len(),
            duplicate_payments = report.duplicate_payments.len(),
            missing_transfers = report.missing_transfers.len(),
            "Health checks finished"
        );
        Ok(report)
    }

    pub async fn retry_transfers(&self) -> PaymentResult<TransferRetryReport> {
        self.settlement
            .retry_transfers(self.policy.transfer_retry_grace)
            .await
    }
}
