//! Order creation: turns one or more fee records into a single payable
//! provider order, reusing a recent identical one when possible.

use crate::config::PolicyConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::models::{FeeRecord, Order, OrderStatus, Payee};
use crate::services::fees::{format_minor, AMOUNT_TOLERANCE};
use crate::services::gateway::{OrderRequest, PaymentGateway};
use crate::store::LedgerStore;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub fee_record_id: Uuid,
    pub amount: i64,
}

/// What a checkout client needs to open the provider's payment sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutPayload {
    pub order_ids: Vec<Uuid>,
    pub provider_order_id: String,
    pub amount: i64,
    pub currency: String,
    pub key_id: String,
    pub allocations: Vec<Allocation>,
    pub reused: bool,
}

/// Spread `amount` over records oldest due date first.
///
/// Each record takes at most its balance; anything left over lands on the last
/// record that received a share. Records with no share are omitted.
pub fn allocate(records: &[FeeRecord], amount: i64) -> Vec<Allocation> {
    let mut sorted: Vec<&FeeRecord> = records.iter().collect();
    sorted.sort_by_key(|r| (r.due_date, r.id));

    let mut remaining = amount;
    let mut allocations: Vec<Allocation> = Vec::new();
    for record in sorted {
        if remaining <= 0 {
            break;
        }
        let share = remaining.min(record.balance());
        if share > 0 {
            allocations.push(Allocation {
                fee_record_id: record.id,
                amount: share,
            });
            remaining -= share;
        }
    }
    if remaining > 0 {
        if let Some(last) = allocations.last_mut() {
            last.amount += remaining;
        }
    }
    allocations
}

/// Check a requested amount against the outstanding balance and installment rules.
pub fn validate_amount(records: &[FeeRecord], requested: Option<i64>) -> PaymentResult<i64> {
    let total: i64 = records.iter().map(FeeRecord::balance).sum();
    let amount = requested.unwrap_or(total);

    if amount <= 0 {
        return Err(PaymentError::validation("amount must be greater than zero"));
    }
    if amount > total {
        return Err(PaymentError::validation(format!(
            "amount exceeds outstanding balance of {}",
            format_minor(total)
        )));
    }

    let partial = total - amount > AMOUNT_TOLERANCE;
    if partial {
        if !records.iter().all(|r| r.allow_installments) {
            return Err(PaymentError::validation(
                "partial payments are not allowed for these fees",
            ));
        }
        if let [record] = records {
            if !record.installment_amounts.is_empty()
                && !record
                    .installment_amounts
                    .iter()
                    .any(|allowed| (allowed - amount).abs() <= AMOUNT_TOLERANCE)
            {
                let allowed: Vec<String> = record
                    .installment_amounts
                    .iter()
                    .map(|a| format_minor(*a))
                    .collect();
                return Err(PaymentError::validation(format!(
                    "amount must be one of the installment amounts: {}",
                    allowed.join(", ")
                )));
            }
        }
    }

    Ok(amount)
}

/// Serializes checkouts per `(tenant, payer)` within this process.
type CheckoutLocks = Arc<DashMap<(Uuid, Uuid), Arc<Mutex<()>>>>;

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: PolicyConfig,
    checkout_locks: CheckoutLocks,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            policy,
            checkout_locks: Arc::new(DashMap::new()),
        }
    }

    #[instrument(skip(self, record_ids), fields(tenant_id = %tenant_id, payer_id = %payer_id))]
    pub async fn create_order(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        record_ids: &[Uuid],
        requested_amount: Option<i64>,
    ) -> PaymentResult<CheckoutPayload> {
        let ids: Vec<Uuid> = record_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Err(PaymentError::validation("at least one fee record is required"));
        }

        let records = self.store.get_fee_records(tenant_id, &ids).await?;
        if let Some(missing) = ids.iter().find(|id| !records.iter().any(|r| r.id == **id)) {
            return Err(PaymentError::not_found(format!(
                "fee record {} not found",
                missing
            )));
        }

        for record in &records {
            self.authorize_payer(tenant_id, payer_id, record).await?;
        }
        let payee = self.settlement_ready_payee(tenant_id, &records).await?;

        let payable: Vec<FeeRecord> = records
            .into_iter()
            .filter(|r| !r.is_waived() && r.balance() > 0)
            .collect();
        if payable.is_empty() {
            return Err(PaymentError::validation("nothing payable"));
        }

        let amount = validate_amount(&payable, requested_amount)?;
        let allocations = allocate(&payable, amount);

        // Held across the reuse check and the insert so identical concurrent
        // checkouts share one provider order.
        let lock = self
            .checkout_locks
            .entry((tenant_id, payer_id))
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(payload) = self
            .find_reusable(tenant_id, payer_id, &allocations, amount)
            .await?
        {
            info!(provider_order_id = %payload.provider_order_id, "Reusing open order");
            return Ok(payload);
        }

        self.open_order(tenant_id, payer_id, &payee, allocations, amount)
            .await
    }

    async fn authorize_payer(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        record: &FeeRecord,
    ) -> PaymentResult<()> {
        if record.member_id == payer_id
            || self
                .store
                .is_guardian(tenant_id, record.member_id, payer_id)
                .await?
        {
            Ok(())
        } else {
            Err(PaymentError::Forbidden(
                "not allowed to pay fees for this member".to_string(),
            ))
        }
    }

    async fn settlement_ready_payee(
        &self,
        tenant_id: Uuid,
        records: &[FeeRecord],
    ) -> PaymentResult<Payee> {
        let payee_ids: BTreeSet<Uuid> = records.iter().map(|r| r.payee_id).collect();
        let payee_id = match payee_ids.into_iter().collect::<Vec<_>>().as_slice() {
            [single] => *single,
            _ => {
                return Err(PaymentError::validation(
                    "fee records must belong to the same payee",
                ))
            }
        };
        let payee = self
            .store
            .get_payee(tenant_id, payee_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(format!("payee {} not found", payee_id)))?;
        if !payee.is_settlement_ready() {
            return Err(PaymentError::Forbidden(
                "payee is not ready to accept payments".to_string(),
            ));
        }
        Ok(payee)
    }

    /// An open order for the same records and total, created within the reuse window.
    async fn find_reusable(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        allocations: &[Allocation],
        amount: i64,
    ) -> PaymentResult<Option<CheckoutPayload>> {
        let wanted: BTreeSet<Uuid> = allocations.iter().map(|a| a.fee_record_id).collect();
        let wanted_ids: Vec<Uuid> = wanted.iter().copied().collect();
        let open = self
            .store
            .open_orders_for_payer(tenant_id, payer_id, &wanted_ids)
            .await?;

        let mut groups: BTreeMap<String, Vec<Order>> = BTreeMap::new();
        for order in open {
            groups
                .entry(order.provider_order_id.clone())
                .or_default()
                .push(order);
        }

        let cutoff = Utc::now() - self.policy.order_reuse_window;
        let reusable = groups
            .into_values()
            .filter(|rows| {
                let ids: BTreeSet<Uuid> = rows.iter().map(|o| o.fee_record_id).collect();
                ids == wanted && rows.iter().all(|o| o.total_amount == amount)
            })
            .filter_map(|rows| {
                let newest = rows.iter().map(|o| o.created_at).max()?;
                (newest >= cutoff).then_some((newest, rows))
            })
            .max_by_key(|(newest, _)| *newest)
            .map(|(_, rows)| rows);

        Ok(reusable.map(|rows| self.payload(&rows, true)))
    }

    async fn open_order(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        payee: &Payee,
        allocations: Vec<Allocation>,
        amount: i64,
    ) -> PaymentResult<CheckoutPayload> {
        let order_ids: Vec<Uuid> = allocations.iter().map(|_| Uuid::new_v4()).collect();
        let record_list = allocations
            .iter()
            .map(|a| a.fee_record_id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let request = OrderRequest {
            amount,
            currency: self.policy.currency.clone(),
            receipt: order_ids.first().map(Uuid::to_string).unwrap_or_default(),
            notes: json!({
                "tenant_id": tenant_id.to_string(),
                "payer_id": payer_id.to_string(),
                "fee_record_ids": record_list,
            }),
        };
        let provider_order = self.gateway.create_order(&request).await?;

        let now = Utc::now();
        let rows: Vec<Order> = allocations
            .iter()
            .zip(order_ids)
            .map(|(allocation, id)| Order {
                id,
                tenant_id,
                payer_id,
                fee_record_id: allocation.fee_record_id,
                payee_id: payee.id,
                amount: allocation.amount,
                total_amount: amount,
                currency: self.policy.currency.clone(),
                provider_order_id: provider_order.id.clone(),
                status: OrderStatus::Created,
                payment_applied: false,
                provider_payment_id: None,
                provider_signature: None,
                commission_rate: payee.commission_rate,
                platform_fee: None,
                transfer_amount: None,
                transfer_id: None,
                transfer_status: None,
                transfer_error: None,
                reversed_amount: 0,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.store.insert_orders(&rows).await?;

        info!(
            provider_order_id = %provider_order.id,
            amount = amount,
            records = rows.len(),
            "Order created"
        );
        Ok(self.payload(&rows, false))
    }

    fn payload(&self, rows: &[Order], reused: bool) -> CheckoutPayload {
        CheckoutPayload {
            order_ids: rows.iter().map(|o| o.id).collect(),
            provider_order_id: rows
                .first()
                .map(|o| o.provider_order_id.clone())
                .unwrap_or_default(),
            amount: rows.first().map(|o| o.total_amount).unwrap_or_default(),
            currency: rows
                .first()
                .map(|o| o.currency.clone())
                .unwrap_or_else(|| self.policy.currency.clone()),
            key_id: self.gateway.key_id().to_string(),
            allocations: rows
                .iter()
                .map(|o| Allocation {
                    fee_record_id: o.fee_record_id,
                    amount: o.amount,
                })
                .collect(),
            reused,
        }
    }

    /// Mark a client-abandoned order FAILED. Applied orders are left alone.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id))]
    pub async fn abandon_order(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        provider_order_id: &str,
        reason: &str,
    ) -> PaymentResult<u64> {
        let orders = self.store.orders_by_provider_order(provider_order_id).await?;
        let orders: Vec<Order> = orders
            .into_iter()
            .filter(|o| o.tenant_id == tenant_id)
            .collect();
        if orders.is_empty() {
            return Err(PaymentError::not_found("order not found"));
        }
        if orders.iter().any(|o| o.payer_id != payer_id) {
            return Err(PaymentError::Forbidden(
                "order belongs to another payer".to_string(),
            ));
        }

        let changed = self
            .store
            .fail_open_orders(provider_order_id, reason)
            .await?;
        info!(provider_order_id = %provider_order_id, changed = changed, "Order abandoned");
        Ok(changed)
    }
}
