//! In-memory ledger store for tests and local development.
//!
//! A transaction holds the store's mutex for its whole lifetime and works on a
//! staged copy of the state, so transactions are fully serialized and a
//! dropped transaction leaves no trace. Callers must not use the store's
//! non-transactional methods while holding a transaction from the same store.

use super::{DuplicatePayment, LedgerStore, LedgerTotals, LedgerTx, TransferUpdate};
use crate::error::{PaymentError, PaymentResult};
use crate::models::{
    FeeRecord, Order, OrderStatus, Payee, Payment, RecurringAssignment, Refund, RefundStatus,
    RefundTracking, TransferStatus, WebhookEventLog,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct State {
    fee_records: HashMap<Uuid, FeeRecord>,
    assignments: HashMap<Uuid, RecurringAssignment>,
    payees: HashMap<Uuid, Payee>,
    guardians: HashSet<(Uuid, Uuid, Uuid)>,
    orders: HashMap<Uuid, Order>,
    payments: Vec<Payment>,
    refunds: Vec<Refund>,
    trackings: HashMap<Uuid, RefundTracking>,
    receipt_sequences: HashMap<(Uuid, Uuid, String), i64>,
    webhook_events: Vec<WebhookEventLog>,
}

impl State {
    fn refunded_for_payment(&self, payment_id: Uuid) -> i64 {
        self.refunds
            .iter()
            .filter(|r| r.payment_id == payment_id && r.counts_against_ledger())
            .map(|r| r.amount)
            .sum()
    }

    fn fee_record_totals(&self, fee_record_id: Uuid) -> (i64, i64) {
        let paid = self
            .payments
            .iter()
            .filter(|p| p.fee_record_id == fee_record_id)
            .map(|p| p.amount)
            .sum();
        let refunded = self
            .refunds
            .iter()
            .filter(|r| r.fee_record_id == fee_record_id && r.counts_against_ledger())
            .map(|r| r.amount)
            .sum();
        (paid, refunded)
    }

    fn order_mut(&mut self, order_id: Uuid) -> PaymentResult<&mut Order> {
        self.orders
            .get_mut(&order_id)
            .ok_or_else(|| PaymentError::not_found(format!("order {} not found", order_id)))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    pending_conflicts: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a serialization conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn insert_fee_record(&self, record: FeeRecord) {
        self.state
            .lock()
            .await
            .fee_records
            .insert(record.id, record);
    }

    pub async fn insert_assignment(&self, assignment: RecurringAssignment) {
        self.state
            .lock()
            .await
            .assignments
            .insert(assignment.id, assignment);
    }

    pub async fn insert_payee(&self, payee: Payee) {
        self.state.lock().await.payees.insert(payee.id, payee);
    }

    pub async fn link_guardian(&self, tenant_id: Uuid, member_id: Uuid, guardian_id: Uuid) {
        self.state
            .lock()
            .await
            .guardians
            .insert((tenant_id, member_id, guardian_id));
    }

    pub async fn insert_payment(&self, payment: Payment) {
        self.state.lock().await.payments.push(payment);
    }

    /// Edit an order in place, e.g. to age it.
    pub async fn update_order<F: FnOnce(&mut Order)>(&self, order_id: Uuid, f: F) {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            f(order);
        }
    }

    pub async fn update_refund<F: FnOnce(&mut Refund)>(&self, refund_id: Uuid, f: F) {
        if let Some(refund) = self
            .state
            .lock()
            .await
            .refunds
            .iter_mut()
            .find(|r| r.id == refund_id)
        {
            f(refund);
        }
    }

    pub async fn fee_records(&self) -> Vec<FeeRecord> {
        self.state.lock().await.fee_records.values().cloned().collect()
    }

    pub async fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.state.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.state.lock().await.payments.clone()
    }

    pub async fn refunds(&self) -> Vec<Refund> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn webhook_events(&self) -> Vec<WebhookEventLog> {
        self.state.lock().await.webhook_events.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> PaymentResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            pending_conflicts: self.pending_conflicts.clone(),
        }))
    }

    async fn health_check(&self) -> PaymentResult<()> {
        Ok(())
    }

    async fn get_fee_record(&self, tenant_id: Uuid, id: Uuid) -> PaymentResult<Option<FeeRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .fee_records
            .get(&id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_fee_records(
        &self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> PaymentResult<Vec<FeeRecord>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.fee_records.get(id))
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn get_payee(&self, tenant_id: Uuid, payee_id: Uuid) -> PaymentResult<Option<Payee>> {
        let state = self.state.lock().await;
        Ok(state
            .payees
            .get(&payee_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn is_guardian(
        &self,
        tenant_id: Uuid,
        member_id: Uuid,
        guardian_id: Uuid,
    ) -> PaymentResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .guardians
            .contains(&(tenant_id, member_id, guardian_id)))
    }

    async fn get_order(&self, order_id: Uuid) -> PaymentResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn orders_by_provider_order(
        &self,
        provider_order_id: &str,
    ) -> PaymentResult<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.provider_order_id == provider_order_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        Ok(orders)
    }

    async fn open_orders_for_payer(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        fee_record_ids: &[Uuid],
    ) -> PaymentResult<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| {
                o.tenant_id == tenant_id
                    && o.payer_id == payer_id
                    && o.status == OrderStatus::Created
                    && !o.payment_applied
                    && fee_record_ids.contains(&o.fee_record_id)
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        Ok(orders)
    }

    async fn insert_orders(&self, orders: &[Order]) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        for order in orders {
            state.orders.insert(order.id, order.clone());
        }
        Ok(())
    }

    async fn fail_open_orders(&self, provider_order_id: &str, reason: &str) -> PaymentResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut changed = 0;
        for order in state.orders.values_mut().filter(|o| {
            o.provider_order_id == provider_order_id
                && o.status == OrderStatus::Created
                && !o.payment_applied
        }) {
            order.status = OrderStatus::Failed;
            order.failure_reason = Some(reason.to_string());
            order.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn order_by_transfer_id(&self, transfer_id: &str) -> PaymentResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.transfer_id.as_deref() == Some(transfer_id))
            .cloned())
    }

    async fn update_transfer(&self, order_id: Uuid, update: &TransferUpdate) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        let order = state.order_mut(order_id)?;
        order.transfer_id = update.transfer_id.clone();
        order.transfer_status = Some(update.status);
        order.platform_fee = Some(update.platform_fee);
        order.transfer_amount = Some(update.transfer_amount);
        order.transfer_error = update.error.clone();
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn set_transfer_status(
        &self,
        order_id: Uuid,
        status: TransferStatus,
        error: Option<&str>,
    ) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        let order = state.order_mut(order_id)?;
        order.transfer_status = Some(status);
        if let Some(error) = error {
            order.transfer_error = Some(error.to_string());
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn add_reversed_amount(&self, order_id: Uuid, amount: i64) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        let order = state.order_mut(order_id)?;
        order.reversed_amount += amount;
        if order.transfer_amount.is_some_and(|t| order.reversed_amount >= t) {
            order.transfer_status = Some(TransferStatus::Reversed);
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn orders_missing_transfer(
        &self,
        updated_before: DateTime<Utc>,
    ) -> PaymentResult<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.needs_transfer() && o.updated_at < updated_before)
            .filter(|o| {
                state
                    .payees
                    .get(&o.payee_id)
                    .is_some_and(|p| p.is_settlement_ready())
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        Ok(orders)
    }

    async fn stale_open_orders(&self, created_before: DateTime<Utc>) -> PaymentResult<Vec<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Created && !o.payment_applied && o.created_at < created_before
            })
            .cloned()
            .collect())
    }

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .find(|p| p.id == payment_id && p.tenant_id == tenant_id)
            .cloned())
    }

    async fn payments_by_provider_payment(
        &self,
        provider_payment_id: &str,
    ) -> PaymentResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.provider_payment_id == provider_payment_id)
            .cloned()
            .collect())
    }

    async fn payments_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PaymentResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.created_at >= from && p.created_at < to)
            .cloned()
            .collect())
    }

    async fn get_refund(&self, refund_id: Uuid) -> PaymentResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state.refunds.iter().find(|r| r.id == refund_id).cloned())
    }

    async fn refund_by_provider_refund(
        &self,
        provider_refund_id: &str,
    ) -> PaymentResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .find(|r| r.provider_refund_id.as_deref() == Some(provider_refund_id))
            .cloned())
    }

    async fn get_refund_tracking(&self, refund_id: Uuid) -> PaymentResult<Option<RefundTracking>> {
        Ok(self.state.lock().await.trackings.get(&refund_id).cloned())
    }

    async fn attach_provider_refund(
        &self,
        refund_id: Uuid,
        provider_refund_id: &str,
    ) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(refund) = state.refunds.iter_mut().find(|r| r.id == refund_id) {
            refund.provider_refund_id = Some(provider_refund_id.to_string());
            refund.updated_at = now;
        }
        if let Some(tracking) = state.trackings.get_mut(&refund_id) {
            tracking.provider_refund_id = Some(provider_refund_id.to_string());
            tracking.updated_at = now;
        }
        Ok(())
    }

    async fn stale_pending_refunds(
        &self,
        created_before: DateTime<Utc>,
    ) -> PaymentResult<Vec<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Pending && r.created_at < created_before)
            .cloned()
            .collect())
    }

    async fn ledger_totals(&self) -> PaymentResult<Vec<LedgerTotals>> {
        let state = self.state.lock().await;
        Ok(state
            .fee_records
            .values()
            .map(|record| {
                let (payments_total, refunds_total) = state.fee_record_totals(record.id);
                LedgerTotals {
                    fee_record_id: record.id,
                    tenant_id: record.tenant_id,
                    final_amount: record.final_amount,
                    paid_amount: record.paid_amount,
                    payments_total,
                    refunds_total,
                }
            })
            .collect())
    }

    async fn duplicate_payments(&self) -> PaymentResult<Vec<DuplicatePayment>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<(Uuid, String), i64> = HashMap::new();
        for payment in &state.payments {
            *counts
                .entry((payment.fee_record_id, payment.provider_payment_id.clone()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|((fee_record_id, provider_payment_id), count)| DuplicatePayment {
                fee_record_id,
                provider_payment_id,
                count,
            })
            .collect())
    }

    async fn insert_webhook_event(&self, event: &WebhookEventLog) -> PaymentResult<()> {
        self.state.lock().await.webhook_events.push(event.clone());
        Ok(())
    }

    async fn webhook_event_processed(&self, provider_event_id: &str) -> PaymentResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .webhook_events
            .iter()
            .any(|e| e.processed && e.provider_event_id.as_deref() == Some(provider_event_id)))
    }

    async fn finish_webhook_event(
        &self,
        id: Uuid,
        processed: bool,
        error: Option<&str>,
    ) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.webhook_events.iter_mut().find(|e| e.id == id) {
            event.processed = processed;
            event.error = error.map(String::from);
            event.processed_at = processed.then(Utc::now);
        }
        Ok(())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
    pending_conflicts: Arc<AtomicU32>,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_order(&mut self, order_id: Uuid) -> PaymentResult<Option<Order>> {
        Ok(self.staged.orders.get(&order_id).cloned())
    }

    async fn lock_fee_record(
        &mut self,
        tenant_id: Uuid,
        fee_record_id: Uuid,
    ) -> PaymentResult<Option<FeeRecord>> {
        Ok(self
            .staged
            .fee_records
            .get(&fee_record_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_payment(
        &mut self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentResult<Option<Payment>> {
        Ok(self
            .staged
            .payments
            .iter()
            .find(|p| p.id == payment_id && p.tenant_id == tenant_id)
            .cloned())
    }

    async fn next_receipt_value(
        &mut self,
        tenant_id: Uuid,
        payer_id: Uuid,
        period: &str,
    ) -> PaymentResult<i64> {
        let value = self
            .staged
            .receipt_sequences
            .entry((tenant_id, payer_id, period.to_string()))
            .or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> PaymentResult<()> {
        let duplicate = self.staged.payments.iter().any(|p| {
            p.fee_record_id == payment.fee_record_id
                && p.provider_payment_id == payment.provider_payment_id
        });
        if duplicate {
            return Err(PaymentError::AlreadySettled);
        }
        self.staged.payments.push(payment.clone());
        Ok(())
    }

    async fn update_fee_record_balance(&mut self, record: &FeeRecord) -> PaymentResult<()> {
        let stored = self
            .staged
            .fee_records
            .get_mut(&record.id)
            .ok_or_else(|| PaymentError::not_found(format!("fee record {} not found", record.id)))?;
        stored.paid_amount = record.paid_amount;
        stored.status = record.status;
        stored.last_receipt_number = record.last_receipt_number.clone();
        stored.last_paid_at = record.last_paid_at;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_order_applied(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<()> {
        let order = self.staged.order_mut(order_id)?;
        order.status = OrderStatus::Paid;
        order.payment_applied = true;
        order.provider_payment_id = Some(provider_payment_id.to_string());
        if let Some(signature) = signature {
            order.provider_signature = Some(signature.to_string());
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_assignment(
        &mut self,
        tenant_id: Uuid,
        assignment_id: Uuid,
    ) -> PaymentResult<Option<RecurringAssignment>> {
        Ok(self
            .staged
            .assignments
            .get(&assignment_id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn fee_record_exists_for_due_date(
        &mut self,
        assignment_id: Uuid,
        due_date: NaiveDate,
    ) -> PaymentResult<bool> {
        Ok(self
            .staged
            .fee_records
            .values()
            .any(|r| r.assignment_id == Some(assignment_id) && r.due_date == due_date))
    }

    async fn insert_fee_record(&mut self, record: &FeeRecord) -> PaymentResult<()> {
        self.staged.fee_records.insert(record.id, record.clone());
        Ok(())
    }

    async fn lock_refund(&mut self, refund_id: Uuid) -> PaymentResult<Option<Refund>> {
        Ok(self.staged.refunds.iter().find(|r| r.id == refund_id).cloned())
    }

    async fn refunds_by_provider_refund(
        &mut self,
        provider_refund_id: &str,
    ) -> PaymentResult<Vec<Refund>> {
        Ok(self
            .staged
            .refunds
            .iter()
            .filter(|r| r.provider_refund_id.as_deref() == Some(provider_refund_id))
            .cloned()
            .collect())
    }

    async fn insert_refund(
        &mut self,
        refund: &Refund,
        tracking: Option<&RefundTracking>,
    ) -> PaymentResult<()> {
        self.staged.refunds.push(refund.clone());
        if let Some(tracking) = tracking {
            self.staged
                .trackings
                .insert(tracking.refund_id, tracking.clone());
        }
        Ok(())
    }

    async fn delete_refund(&mut self, refund_id: Uuid) -> PaymentResult<()> {
        self.staged.trackings.remove(&refund_id);
        self.staged.refunds.retain(|r| r.id != refund_id);
        Ok(())
    }

    async fn set_refund_status(
        &mut self,
        refund_id: Uuid,
        status: RefundStatus,
        provider_refund_id: Option<&str>,
    ) -> PaymentResult<()> {
        let now = Utc::now();
        if let Some(refund) = self.staged.refunds.iter_mut().find(|r| r.id == refund_id) {
            refund.status = status;
            if let Some(id) = provider_refund_id {
                refund.provider_refund_id = Some(id.to_string());
            }
            refund.updated_at = now;
        }
        if let Some(tracking) = self.staged.trackings.get_mut(&refund_id) {
            tracking.status = status;
            if let Some(id) = provider_refund_id {
                tracking.provider_refund_id = Some(id.to_string());
            }
            tracking.updated_at = now;
        }
        Ok(())
    }

    async fn refunded_for_payment(&mut self, payment_id: Uuid) -> PaymentResult<i64> {
        Ok(self.staged.refunded_for_payment(payment_id))
    }

    async fn fee_record_totals(&mut self, fee_record_id: Uuid) -> PaymentResult<(i64, i64)> {
        Ok(self.staged.fee_record_totals(fee_record_id))
    }

    async fn commit(self: Box<Self>) -> PaymentResult<()> {
        let conflicted = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(PaymentError::SerializationConflict);
        }
        let MemoryTx {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}
