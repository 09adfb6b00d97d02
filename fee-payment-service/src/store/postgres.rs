//! PostgreSQL ledger store.

use super::{DuplicatePayment, LedgerStore, LedgerTotals, LedgerTx, TransferUpdate};
use crate::error::{PaymentError, PaymentResult};
use crate::models::{
    FeeRecord, Order, Payee, Payment, RecurringAssignment, Refund, RefundStatus, RefundTracking,
    TransferStatus, WebhookEventLog,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fee-payment-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> PaymentResult<Self> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> PaymentResult<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PaymentError::Database(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> PaymentResult<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx { tx }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> PaymentResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_fee_record(&self, tenant_id: Uuid, id: Uuid) -> PaymentResult<Option<FeeRecord>> {
        let record = sqlx::query_as::<_, FeeRecord>(
            "SELECT * FROM fee_records WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_fee_records(
        &self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> PaymentResult<Vec<FeeRecord>> {
        let records = sqlx::query_as::<_, FeeRecord>(
            "SELECT * FROM fee_records WHERE tenant_id = $1 AND id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_payee(&self, tenant_id: Uuid, payee_id: Uuid) -> PaymentResult<Option<Payee>> {
        let payee = sqlx::query_as::<_, Payee>(
            r#"
            SELECT id, tenant_id, name, linked_account_id, settlement_status, commission_rate
            FROM payees
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(payee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payee)
    }

    async fn is_guardian(
        &self,
        tenant_id: Uuid,
        member_id: Uuid,
        guardian_id: Uuid,
    ) -> PaymentResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM member_guardians
                WHERE tenant_id = $1 AND member_id = $2 AND guardian_id = $3
            )
            "#,
        )
        .bind(tenant_id)
        .bind(member_id)
        .bind(guardian_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn get_order(&self, order_id: Uuid) -> PaymentResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn orders_by_provider_order(
        &self,
        provider_order_id: &str,
    ) -> PaymentResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE provider_order_id = $1 ORDER BY created_at, id",
        )
        .bind(provider_order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn open_orders_for_payer(
        &self,
        tenant_id: Uuid,
        payer_id: Uuid,
        fee_record_ids: &[Uuid],
    ) -> PaymentResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE tenant_id = $1
              AND payer_id = $2
              AND status = 'CREATED'
              AND NOT payment_applied
              AND fee_record_id = ANY($3)
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .bind(payer_id)
        .bind(fee_record_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    #[instrument(skip(self, orders), fields(count = orders.len()))]
    async fn insert_orders(&self, orders: &[Order]) -> PaymentResult<()> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["insert_orders"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        for order in orders {
            sqlx::query(
                r#"
                INSERT INTO orders (
                    id, tenant_id, payer_id, fee_record_id, payee_id, amount, total_amount,
                    currency, provider_order_id, status, payment_applied, commission_rate,
                    reversed_amount, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(order.id)
            .bind(order.tenant_id)
            .bind(order.payer_id)
            .bind(order.fee_record_id)
            .bind(order.payee_id)
            .bind(order.amount)
            .bind(order.total_amount)
            .bind(&order.currency)
            .bind(&order.provider_order_id)
            .bind(order.status)
            .bind(order.payment_applied)
            .bind(order.commission_rate)
            .bind(order.reversed_amount)
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fail_open_orders(&self, provider_order_id: &str, reason: &str) -> PaymentResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'FAILED', failure_reason = $2, updated_at = NOW()
            WHERE provider_order_id = $1 AND status = 'CREATED' AND NOT payment_applied
            "#,
        )
        .bind(provider_order_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn order_by_transfer_id(&self, transfer_id: &str) -> PaymentResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE transfer_id = $1")
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    #[instrument(skip(self, update), fields(order_id = %order_id))]
    async fn update_transfer(&self, order_id: Uuid, update: &TransferUpdate) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET transfer_id = $2, transfer_status = $3, platform_fee = $4,
                transfer_amount = $5, transfer_error = $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(&update.transfer_id)
        .bind(update.status)
        .bind(update.platform_fee)
        .bind(update.transfer_amount)
        .bind(&update.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_transfer_status(
        &self,
        order_id: Uuid,
        status: TransferStatus,
        error: Option<&str>,
    ) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET transfer_status = $2, transfer_error = COALESCE($3, transfer_error), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_reversed_amount(&self, order_id: Uuid, amount: i64) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET reversed_amount = reversed_amount + $2,
                transfer_status = CASE
                    WHEN transfer_amount IS NOT NULL AND reversed_amount + $2 >= transfer_amount
                    THEN 'REVERSED'
                    ELSE transfer_status
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn orders_missing_transfer(
        &self,
        updated_before: DateTime<Utc>,
    ) -> PaymentResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT o.* FROM orders o
            JOIN payees p ON p.id = o.payee_id
            WHERE o.payment_applied
              AND (o.transfer_id IS NULL OR o.transfer_status = 'FAILED')
              AND p.settlement_status = 'ACTIVATED'
              AND COALESCE(p.linked_account_id, '') <> ''
              AND o.updated_at < $1
            ORDER BY o.updated_at
            "#,
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn stale_open_orders(&self, created_before: DateTime<Utc>) -> PaymentResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE status = 'CREATED' AND NOT payment_applied AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn payments_by_provider_payment(
        &self,
        provider_payment_id: &str,
    ) -> PaymentResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE provider_payment_id = $1 ORDER BY created_at",
        )
        .bind(provider_payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    #[instrument(skip(self))]
    async fn payments_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PaymentResult<Vec<Payment>> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["payments_created_between"])
            .start_timer();
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn get_refund(&self, refund_id: Uuid) -> PaymentResult<Option<Refund>> {
        let refund = sqlx::query_as::<_, Refund>("SELECT * FROM refunds WHERE id = $1")
            .bind(refund_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(refund)
    }

    async fn refund_by_provider_refund(
        &self,
        provider_refund_id: &str,
    ) -> PaymentResult<Option<Refund>> {
        let refund =
            sqlx::query_as::<_, Refund>("SELECT * FROM refunds WHERE provider_refund_id = $1")
                .bind(provider_refund_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(refund)
    }

    async fn get_refund_tracking(&self, refund_id: Uuid) -> PaymentResult<Option<RefundTracking>> {
        let tracking = sqlx::query_as::<_, RefundTracking>(
            "SELECT * FROM refund_trackings WHERE refund_id = $1",
        )
        .bind(refund_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tracking)
    }

    async fn attach_provider_refund(
        &self,
        refund_id: Uuid,
        provider_refund_id: &str,
    ) -> PaymentResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE refunds SET provider_refund_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(refund_id)
            .bind(provider_refund_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE refund_trackings SET provider_refund_id = $2, updated_at = NOW() WHERE refund_id = $1",
        )
        .bind(refund_id)
        .bind(provider_refund_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stale_pending_refunds(
        &self,
        created_before: DateTime<Utc>,
    ) -> PaymentResult<Vec<Refund>> {
        let refunds = sqlx::query_as::<_, Refund>(
            "SELECT * FROM refunds WHERE status = 'PENDING' AND created_at < $1 ORDER BY created_at",
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }

    #[instrument(skip(self))]
    async fn ledger_totals(&self) -> PaymentResult<Vec<LedgerTotals>> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["ledger_totals"])
            .start_timer();
        let rows = sqlx::query_as::<_, (Uuid, Uuid, i64, i64, i64, i64)>(
            r#"
            SELECT f.id, f.tenant_id, f.final_amount, f.paid_amount,
                   COALESCE((SELECT SUM(p.amount) FROM payments p
                             WHERE p.fee_record_id = f.id), 0)::BIGINT,
                   COALESCE((SELECT SUM(r.amount) FROM refunds r
                             WHERE r.fee_record_id = f.id AND r.status <> 'FAILED'), 0)::BIGINT
            FROM fee_records f
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(fee_record_id, tenant_id, final_amount, paid_amount, payments_total, refunds_total)| {
                    LedgerTotals {
                        fee_record_id,
                        tenant_id,
                        final_amount,
                        paid_amount,
                        payments_total,
                        refunds_total,
                    }
                },
            )
            .collect())
    }

    async fn duplicate_payments(&self) -> PaymentResult<Vec<DuplicatePayment>> {
        let rows = sqlx::query_as::<_, (Uuid, String, i64)>(
            r#"
            SELECT fee_record_id, provider_payment_id, COUNT(*)
            FROM payments
            GROUP BY fee_record_id, provider_payment_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(fee_record_id, provider_payment_id, count)| DuplicatePayment {
                fee_record_id,
                provider_payment_id,
                count,
            })
            .collect())
    }

    async fn insert_webhook_event(&self, event: &WebhookEventLog) -> PaymentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (id, provider_event_id, event_type, payload, processed, error, received_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.processed)
        .bind(&event.error)
        .bind(event.received_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn webhook_event_processed(&self, provider_event_id: &str) -> PaymentResult<bool> {
        let processed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM webhook_events WHERE provider_event_id = $1 AND processed)",
        )
        .bind(provider_event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(processed)
    }

    async fn finish_webhook_event(
        &self,
        id: Uuid,
        processed: bool,
        error: Option<&str>,
    ) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = $2, error = $3,
                processed_at = CASE WHEN $2 THEN NOW() ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Serializable transaction on one pooled connection.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    #[instrument(skip(self))]
    async fn lock_order(&mut self, order_id: Uuid) -> PaymentResult<Option<Order>> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["lock_order"])
            .start_timer();
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn lock_fee_record(
        &mut self,
        tenant_id: Uuid,
        fee_record_id: Uuid,
    ) -> PaymentResult<Option<FeeRecord>> {
        let record = sqlx::query_as::<_, FeeRecord>(
            "SELECT * FROM fee_records WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(fee_record_id)
        .bind(tenant_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(record)
    }

    async fn get_payment(
        &mut self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn next_receipt_value(
        &mut self,
        tenant_id: Uuid,
        payer_id: Uuid,
        period: &str,
    ) -> PaymentResult<i64> {
        let value = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO receipt_sequences (tenant_id, payer_id, period, last_value)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (tenant_id, payer_id, period)
            DO UPDATE SET last_value = receipt_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(tenant_id)
        .bind(payer_id)
        .bind(period)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(value)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> PaymentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, tenant_id, fee_record_id, payer_id, order_id, provider_payment_id,
                amount, receipt_number, recorded_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(payment.id)
        .bind(payment.tenant_id)
        .bind(payment.fee_record_id)
        .bind(payment.payer_id)
        .bind(payment.order_id)
        .bind(&payment.provider_payment_id)
        .bind(payment.amount)
        .bind(&payment.receipt_number)
        .bind(&payment.recorded_by)
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                PaymentError::AlreadySettled
            }
            other => PaymentError::from(other),
        })?;
        Ok(())
    }

    async fn update_fee_record_balance(&mut self, record: &FeeRecord) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE fee_records
            SET paid_amount = $2, status = $3, last_receipt_number = $4,
                last_paid_at = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.paid_amount)
        .bind(record.status)
        .bind(&record.last_receipt_number)
        .bind(record.last_paid_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_order_applied(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = 'PAID', payment_applied = TRUE, provider_payment_id = $2,
                provider_signature = COALESCE($3, provider_signature), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(provider_payment_id)
        .bind(signature)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_assignment(
        &mut self,
        tenant_id: Uuid,
        assignment_id: Uuid,
    ) -> PaymentResult<Option<RecurringAssignment>> {
        let assignment = sqlx::query_as::<_, RecurringAssignment>(
            "SELECT * FROM recurring_assignments WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(assignment_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(assignment)
    }

    async fn fee_record_exists_for_due_date(
        &mut self,
        assignment_id: Uuid,
        due_date: NaiveDate,
    ) -> PaymentResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM fee_records WHERE assignment_id = $1 AND due_date = $2)",
        )
        .bind(assignment_id)
        .bind(due_date)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_fee_record(&mut self, record: &FeeRecord) -> PaymentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fee_records (
                id, tenant_id, member_id, payee_id, assignment_id, base_amount, discount_amount,
                scholarship_amount, tax_rate, tax_amount, final_amount, paid_amount, status,
                due_date, allow_installments, installment_amounts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (assignment_id, due_date) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(record.member_id)
        .bind(record.payee_id)
        .bind(record.assignment_id)
        .bind(record.base_amount)
        .bind(record.discount_amount)
        .bind(record.scholarship_amount)
        .bind(record.tax_rate)
        .bind(record.tax_amount)
        .bind(record.final_amount)
        .bind(record.paid_amount)
        .bind(record.status)
        .bind(record.due_date)
        .bind(record.allow_installments)
        .bind(&record.installment_amounts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_refund(&mut self, refund_id: Uuid) -> PaymentResult<Option<Refund>> {
        let refund = sqlx::query_as::<_, Refund>("SELECT * FROM refunds WHERE id = $1 FOR UPDATE")
            .bind(refund_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(refund)
    }

    async fn refunds_by_provider_refund(
        &mut self,
        provider_refund_id: &str,
    ) -> PaymentResult<Vec<Refund>> {
        let refunds =
            sqlx::query_as::<_, Refund>("SELECT * FROM refunds WHERE provider_refund_id = $1")
                .bind(provider_refund_id)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(refunds)
    }

    async fn insert_refund(
        &mut self,
        refund: &Refund,
        tracking: Option<&RefundTracking>,
    ) -> PaymentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refunds (
                id, tenant_id, payment_id, fee_record_id, amount, reason, kind, status,
                provider_refund_id, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(refund.id)
        .bind(refund.tenant_id)
        .bind(refund.payment_id)
        .bind(refund.fee_record_id)
        .bind(refund.amount)
        .bind(&refund.reason)
        .bind(refund.kind)
        .bind(refund.status)
        .bind(&refund.provider_refund_id)
        .bind(&refund.created_by)
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if let Some(tracking) = tracking {
            sqlx::query(
                r#"
                INSERT INTO refund_trackings
                    (refund_id, provider_payment_id, provider_refund_id, status, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(tracking.refund_id)
            .bind(&tracking.provider_payment_id)
            .bind(&tracking.provider_refund_id)
            .bind(tracking.status)
            .bind(tracking.updated_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn delete_refund(&mut self, refund_id: Uuid) -> PaymentResult<()> {
        sqlx::query("DELETE FROM refund_trackings WHERE refund_id = $1")
            .bind(refund_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM refunds WHERE id = $1")
            .bind(refund_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn set_refund_status(
        &mut self,
        refund_id: Uuid,
        status: RefundStatus,
        provider_refund_id: Option<&str>,
    ) -> PaymentResult<()> {
        sqlx::query(
            r#"
            UPDATE refunds
            SET status = $2, provider_refund_id = COALESCE($3, provider_refund_id), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(refund_id)
        .bind(status)
        .bind(provider_refund_id)
        .execute(&mut *self.tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE refund_trackings
            SET status = $2, provider_refund_id = COALESCE($3, provider_refund_id), updated_at = NOW()
            WHERE refund_id = $1
            "#,
        )
        .bind(refund_id)
        .bind(status)
        .bind(provider_refund_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn refunded_for_payment(&mut self, payment_id: Uuid) -> PaymentResult<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refunds
            WHERE payment_id = $1 AND status <> 'FAILED'
            "#,
        )
        .bind(payment_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(total)
    }

    async fn fee_record_totals(&mut self, fee_record_id: Uuid) -> PaymentResult<(i64, i64)> {
        let totals = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COALESCE((SELECT SUM(amount) FROM payments WHERE fee_record_id = $1), 0)::BIGINT,
                COALESCE((SELECT SUM(amount) FROM refunds
                          WHERE fee_record_id = $1 AND status <> 'FAILED'), 0)::BIGINT
            "#,
        )
        .bind(fee_record_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(totals)
    }

    async fn commit(self: Box<Self>) -> PaymentResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
