//! Ledger storage.
//!
//! `LedgerStore` covers single-statement reads and writes; anything that must
//! move money atomically goes through a `LedgerTx` obtained from `begin`,
//! which runs at serializable isolation and locks rows it returns from the
//! `lock_*` methods until commit or drop.

pub mod memory;
pub mod postgres;

use crate::error::PaymentResult;
use crate::models::{
    FeeRecord, Order, Payee, Payment, RecurringAssignment, Refund, RefundStatus, RefundTracking,
    TransferStatus, WebhookEventLog,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Settlement fields written back onto an order.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUpdate {
    pub transfer_id: Option<String>,
    pub status: TransferStatus,
    pub platform_fee: i64,
    pub transfer_amount: i64,
    pub error: Option<String>,
}

/// Per-record totals used by the integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTotals {
    pub fee_record_id: Uuid,
    pub tenant_id: Uuid,
    pub final_amount: i64,
    pub paid_amount: i64,
    pub payments_total: i64,
    /// Pending and confirmed refunds, chargebacks included.
    pub refunds_total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicatePayment {
    pub fee_record_id: Uuid,
    pub provider_payment_id: String,
    pub count: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> PaymentResult<Box<dyn LedgerTx>>;

    async fn health_check(&self) -> PaymentResult<()>;

    // Fee records and reference data

    async fn get_fee_record(&self, tenant_id: Uuid, id: Uuid) -> PaymentResult<Option<FeeRecord>>;

    async fn get_fee_records(&self, tenant_id: Uuid, ids: &[Uuid])
        -> PaymentResult<Vec<FeeRecord>>;

    async fn get_payee(&self, tenant_id: Uuid, payee_id: Uuid) -> PaymentResult<Option<Payee>>;

    async fn is_guardian(
        &self,
        tenant_id: Uuid,
        member_id: Uuid,
        guardian_id: Uuid,
    ) -> PaymentResult<bool>;

    // Orders

    async fn get_order(&self, order_id: Uuid) -> PaymentResult<Option<Order>>;

    /// All rows of one provider order, oldest first.
    async fn orders_by_provider_order(&self, provider_order_id: &str)
        -> PaymentResult<Vec<Order>>;

    /// CREATED, unapplied orders a payer opened against any of `fee_record_ids`.
    async fn open_orders_for_payer(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        fee_record_ids: &[Uuid],
    ) -> PaymentResult<Vec<Order>>;

    async fn insert_orders(&self, orders: &[Order]) -> PaymentResult<()>;

    /// Mark CREATED, unapplied rows of a provider order FAILED. Returns rows changed.
    async fn fail_open_orders(&self, provider_order_id: &str, reason: &str) -> PaymentResult<u64>;

    async fn order_by_transfer_id(&self, transfer_id: &str) -> PaymentResult<Option<Order>>;

    async fn update_transfer(&self, order_id: Uuid, update: &TransferUpdate) -> PaymentResult<()>;

    async fn set_transfer_status(
        &self,
        order_id: Uuid,
        status: TransferStatus,
        error: Option<&str>,
    ) -> PaymentResult<()>;

    async fn add_reversed_amount(&self, order_id: Uuid, amount: i64) -> PaymentResult<()>;

    /// Applied orders of activated, linked payees whose transfer is missing or
    /// failed and that were last touched before `updated_before`.
    async fn orders_missing_transfer(
        &self,
        updated_before: DateTime<Utc>,
    ) -> PaymentResult<Vec<Order>>;

    async fn stale_open_orders(&self, created_before: DateTime<Utc>) -> PaymentResult<Vec<Order>>;

    // Payments and refunds

    async fn get_payment(&self, tenant_id: Uuid, payment_id: Uuid)
        -> PaymentResult<Option<Payment>>;

    async fn payments_by_provider_payment(
        &self,
        provider_payment_id: &str,
    ) -> PaymentResult<Vec<Payment>>;

    async fn payments_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PaymentResult<Vec<Payment>>;

    async fn get_refund(&self, refund_id: Uuid) -> PaymentResult<Option<Refund>>;

    async fn refund_by_provider_refund(&self, provider_refund_id: &str)
        -> PaymentResult<Option<Refund>>;

    async fn get_refund_tracking(&self, refund_id: Uuid) -> PaymentResult<Option<RefundTracking>>;

    /// Record the provider's refund id on both the refund and its tracking row.
    async fn attach_provider_refund(
        &self,
        refund_id: Uuid,
        provider_refund_id: &str,
    ) -> PaymentResult<()>;

    async fn stale_pending_refunds(&self, created_before: DateTime<Utc>)
        -> PaymentResult<Vec<Refund>>;

    // Reconciliation

    async fn ledger_totals(&self) -> PaymentResult<Vec<LedgerTotals>>;

    async fn duplicate_payments(&self) -> PaymentResult<Vec<DuplicatePayment>>;

    // Webhook log

    async fn insert_webhook_event(&self, event: &WebhookEventLog) -> PaymentResult<()>;

    /// Whether an event with this provider id was already processed.
    async fn webhook_event_processed(&self, provider_event_id: &str) -> PaymentResult<bool>;

    async fn finish_webhook_event(
        &self,
        id: Uuid,
        processed: bool,
        error: Option<&str>,
    ) -> PaymentResult<()>;
}

/// A serializable unit of work. Dropping without `commit` rolls back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_order(&mut self, order_id: Uuid) -> PaymentResult<Option<Order>>;

    async fn lock_fee_record(
        &mut self,
        tenant_id: Uuid,
        fee_record_id: Uuid,
    ) -> PaymentResult<Option<FeeRecord>>;

    async fn get_payment(&mut self, tenant_id: Uuid, payment_id: Uuid)
        -> PaymentResult<Option<Payment>>;

    /// Increment and return the receipt counter for `(tenant, payer, period)`.
    async fn next_receipt_value(
        &mut self,
        tenant_id: Uuid,
        payer_id: Uuid,
        period: &str,
    ) -> PaymentResult<i64>;

    /// Fails with `AlreadySettled` if the record already holds this provider payment.
    async fn insert_payment(&mut self, payment: &Payment) -> PaymentResult<()>;

    /// Persist paid amount, status, receipt and paid-at of a locked record.
    async fn update_fee_record_balance(&mut self, record: &FeeRecord) -> PaymentResult<()>;

    async fn mark_order_applied(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<()>;

    async fn get_assignment(
        &mut self,
        tenant_id: Uuid,
        assignment_id: Uuid,
    ) -> PaymentResult<Option<RecurringAssignment>>;

    async fn fee_record_exists_for_due_date(
        &mut self,
        assignment_id: Uuid,
        due_date: NaiveDate,
    ) -> PaymentResult<bool>;

    async fn insert_fee_record(&mut self, record: &FeeRecord) -> PaymentResult<()>;

    async fn lock_refund(&mut self, refund_id: Uuid) -> PaymentResult<Option<Refund>>;

    /// Refunds (any status) recorded under a provider refund or dispute id.
    async fn refunds_by_provider_refund(
        &mut self,
        provider_refund_id: &str,
    ) -> PaymentResult<Vec<Refund>>;

    async fn insert_refund(
        &mut self,
        refund: &Refund,
        tracking: Option<&RefundTracking>,
    ) -> PaymentResult<()>;

    /// Remove a refund and its tracking row.
    async fn delete_refund(&mut self, refund_id: Uuid) -> PaymentResult<()>;

    async fn set_refund_status(
        &mut self,
        refund_id: Uuid,
        status: RefundStatus,
        provider_refund_id: Option<&str>,
    ) -> PaymentResult<()>;

    /// Non-failed refunds against one payment.
    async fn refunded_for_payment(&mut self, payment_id: Uuid) -> PaymentResult<i64>;

    /// `(Σ payments, Σ non-failed refunds)` of one fee record.
    async fn fee_record_totals(&mut self, fee_record_id: Uuid) -> PaymentResult<(i64, i64)>;

    async fn commit(self: Box<Self>) -> PaymentResult<()>;
}
