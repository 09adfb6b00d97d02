#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use fee_payment_service::config::{
    DatabaseConfig, NotificationConfig, PaymentConfig, PolicyConfig, RazorpayConfig,
};
use fee_payment_service::models::{
    BillingCycle, FeeRecord, FeeStatus, Order, Payee, RecurringAssignment, SettlementStatus,
};
use fee_payment_service::services::fees::tax_snapshot;
use fee_payment_service::services::gateway::{
    GatewayError, OrderRequest, PaymentGateway, ProviderOrder, ProviderPayment, ProviderRefund,
    ProviderReversal, ProviderTransfer, RefundRequest, TransferRequest,
};
use fee_payment_service::services::notifier::{Notification, NotificationKind, Notifier};
use fee_payment_service::services::verification::PaymentProof;
use fee_payment_service::services::Services;
use fee_payment_service::startup::Application;
use fee_payment_service::store::MemoryStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::Secret;
use service_core::retry::RetryConfig;
use service_core::utils::signature::hmac_sha256_hex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const KEY_ID: &str = "rzp_test_key";
pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";
pub const LINKED_ACCOUNT: &str = "acc_payee_1";

// Scripted gateway

#[derive(Default)]
struct GatewayState {
    next_id: u64,
    orders: Vec<OrderRequest>,
    payments: HashMap<String, ProviderPayment>,
    refunds: Vec<(String, RefundRequest)>,
    transfers: HashMap<String, Vec<ProviderTransfer>>,
    reversals: Vec<(String, i64)>,
    fail_refunds: bool,
    refunds_time_out: bool,
    fail_transfers: bool,
    fail_reversals: bool,
}

/// In-process stand-in for the provider: remembers what it was asked and
/// answers from scripted state.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

fn rejected(description: &str) -> GatewayError {
    GatewayError::Api {
        status: 400,
        code: "BAD_REQUEST_ERROR".to_string(),
        description: description.to_string(),
    }
}

impl FakeGateway {
    fn next_id(state: &mut GatewayState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}_{:04}", prefix, state.next_id)
    }

    /// Register a captured payment for `provider_order_id` and return its id.
    pub fn capture(&self, provider_order_id: &str, amount: i64) -> String {
        self.capture_at(provider_order_id, amount, Utc::now())
    }

    pub fn capture_at(&self, provider_order_id: &str, amount: i64, at: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state, "pay");
        state.payments.insert(
            id.clone(),
            ProviderPayment {
                id: id.clone(),
                amount,
                currency: "INR".to_string(),
                status: "captured".to_string(),
                order_id: Some(provider_order_id.to_string()),
                created_at: at.timestamp(),
                error_description: None,
            },
        );
        id
    }

    pub fn set_payment_status(&self, payment_id: &str, status: &str) {
        if let Some(payment) = self.state.lock().unwrap().payments.get_mut(payment_id) {
            payment.status = status.to_string();
        }
    }

    pub fn add_existing_transfer(&self, payment_id: &str, transfer: ProviderTransfer) {
        self.state
            .lock()
            .unwrap()
            .transfers
            .entry(payment_id.to_string())
            .or_default()
            .push(transfer);
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.state.lock().unwrap().fail_refunds = fail;
    }

    /// Accept refunds but answer as if the connection dropped.
    pub fn refunds_time_out(&self, time_out: bool) {
        self.state.lock().unwrap().refunds_time_out = time_out;
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.state.lock().unwrap().fail_transfers = fail;
    }

    pub fn fail_reversals(&self, fail: bool) {
        self.state.lock().unwrap().fail_reversals = fail;
    }

    pub fn orders_created(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    pub fn refund_requests(&self) -> Vec<(String, RefundRequest)> {
        self.state.lock().unwrap().refunds.clone()
    }

    pub fn transfers_created(&self) -> Vec<ProviderTransfer> {
        self.state
            .lock()
            .unwrap()
            .transfers
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn reversals(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().reversals.clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn key_id(&self) -> &str {
        KEY_ID
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state, "order");
        state.orders.push(request.clone());
        Ok(ProviderOrder {
            id,
            amount: request.amount,
            currency: request.currency.clone(),
            status: "created".to_string(),
            receipt: Some(request.receipt.clone()),
        })
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, GatewayError> {
        self.state
            .lock()
            .unwrap()
            .payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| rejected("The id provided does not exist"))
    }

    async fn create_refund(
        &self,
        payment_id: &str,
        request: &RefundRequest,
    ) -> Result<ProviderRefund, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_refunds {
            return Err(rejected("The refund amount provided is greater than amount captured"));
        }
        let id = Self::next_id(&mut state, "rfnd");
        state.refunds.push((payment_id.to_string(), request.clone()));
        if state.refunds_time_out {
            return Err(GatewayError::Transport("operation timed out".to_string()));
        }
        Ok(ProviderRefund {
            id,
            payment_id: payment_id.to_string(),
            amount: request.amount,
            status: "pending".to_string(),
            notes: request.notes.clone(),
        })
    }

    async fn create_transfer(
        &self,
        payment_id: &str,
        request: &TransferRequest,
    ) -> Result<ProviderTransfer, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_transfers {
            return Err(GatewayError::Api {
                status: 503,
                code: "SERVER_ERROR".to_string(),
                description: "transfer service unavailable".to_string(),
            });
        }
        let transfer = ProviderTransfer {
            id: Self::next_id(&mut state, "trf"),
            source: Some(payment_id.to_string()),
            recipient: Some(request.account.clone()),
            amount: request.amount,
            status: Some("created".to_string()),
            notes: request.notes.clone(),
        };
        state
            .transfers
            .entry(payment_id.to_string())
            .or_default()
            .push(transfer.clone());
        Ok(transfer)
    }

    async fn reverse_transfer(
        &self,
        transfer_id: &str,
        amount: i64,
    ) -> Result<ProviderReversal, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reversals {
            return Err(rejected("reversal not allowed"));
        }
        state.reversals.push((transfer_id.to_string(), amount));
        Ok(ProviderReversal {
            id: Self::next_id(&mut state, "rvrsl"),
            transfer_id: transfer_id.to_string(),
            amount,
        })
    }

    async fn list_payment_transfers(
        &self,
        payment_id: &str,
    ) -> Result<Vec<ProviderTransfer>, GatewayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transfers
            .get(payment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_captured_payments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProviderPayment>, GatewayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .payments
            .values()
            .filter(|p| p.is_captured())
            .filter(|p| {
                p.created_at_utc()
                    .is_some_and(|at| at >= from && at < to)
            })
            .cloned()
            .collect())
    }
}

// Notifications

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

// Fixtures

pub fn test_policy() -> PolicyConfig {
    PolicyConfig {
        verify_retry: RetryConfig::immediate(3),
        transfer_retry_grace: Duration::zero(),
        ..PolicyConfig::default()
    }
}

pub fn test_config() -> PaymentConfig {
    PaymentConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        service_name: "fee-payment-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new("postgres://unused".to_string()),
            max_connections: 1,
            min_connections: 1,
        },
        razorpay: RazorpayConfig {
            key_id: KEY_ID.to_string(),
            key_secret: Secret::new(KEY_SECRET.to_string()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            api_base_url: "http://127.0.0.1:1".to_string(),
        },
        policy: test_policy(),
        notification: NotificationConfig::default(),
    }
}

pub fn checkout_signature(provider_order_id: &str, provider_payment_id: &str) -> String {
    hmac_sha256_hex(
        KEY_SECRET,
        format!("{}|{}", provider_order_id, provider_payment_id).as_bytes(),
    )
    .unwrap()
}

pub fn webhook_signature(body: &[u8]) -> String {
    hmac_sha256_hex(WEBHOOK_SECRET, body).unwrap()
}

pub fn proof(provider_order_id: &str, provider_payment_id: &str) -> PaymentProof {
    PaymentProof {
        provider_order_id: provider_order_id.to_string(),
        provider_payment_id: provider_payment_id.to_string(),
        signature: checkout_signature(provider_order_id, provider_payment_id),
        fee_record_id: None,
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// A tenant with one settlement-ready payee and one payer, wired to the
/// in-memory store and the scripted gateway.
pub struct TestLedger {
    pub store: MemoryStore,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub services: Services,
    pub tenant_id: Uuid,
    pub payer_id: Uuid,
    pub payee: Payee,
}

impl TestLedger {
    pub async fn new() -> Self {
        Self::with_policy(test_policy()).await
    }

    pub async fn with_policy(policy: PolicyConfig) -> Self {
        let store = MemoryStore::new();
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let tenant_id = Uuid::new_v4();
        let payee = Payee {
            id: Uuid::new_v4(),
            tenant_id,
            name: "Riverside Swim Club".to_string(),
            linked_account_id: Some(LINKED_ACCOUNT.to_string()),
            settlement_status: SettlementStatus::Activated,
            commission_rate: dec!(0.05),
        };
        store.insert_payee(payee.clone()).await;

        let config = test_config();
        let services = Services::new(
            Arc::new(store.clone()),
            gateway.clone(),
            notifier.clone(),
            &config.razorpay,
            policy,
        );

        Self {
            store,
            gateway,
            notifier,
            services,
            tenant_id,
            payer_id: Uuid::new_v4(),
            payee,
        }
    }

    pub fn record(&self, final_amount: i64, due_date: NaiveDate) -> FeeRecord {
        let now = Utc::now();
        FeeRecord {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            member_id: self.payer_id,
            payee_id: self.payee.id,
            assignment_id: None,
            base_amount: final_amount,
            discount_amount: 0,
            scholarship_amount: 0,
            tax_rate: Decimal::ZERO,
            tax_amount: 0,
            final_amount,
            paid_amount: 0,
            status: FeeStatus::Pending,
            due_date,
            allow_installments: true,
            installment_amounts: Vec::new(),
            last_receipt_number: None,
            last_paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A pending record due in a week.
    pub async fn add_record(&self, final_amount: i64) -> FeeRecord {
        let record = self.record(final_amount, today() + Duration::days(7));
        self.store.insert_fee_record(record.clone()).await;
        record
    }

    /// A monthly assignment and its first record.
    pub async fn add_recurring(&self, base: i64, tax_rate: Decimal) -> (RecurringAssignment, FeeRecord) {
        let assignment = RecurringAssignment {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            member_id: self.payer_id,
            payee_id: self.payee.id,
            cycle: BillingCycle::Monthly,
            base_amount: base,
            discount_amount: 0,
            scholarship_amount: 0,
            tax_rate,
            allow_installments: true,
            installment_amounts: Vec::new(),
            active: true,
            paused: false,
        };
        let snapshot = tax_snapshot(base, 0, 0, tax_rate);
        let mut record = self.record(snapshot.final_amount, NaiveDate::from_ymd_opt(2030, 1, 31).unwrap());
        record.assignment_id = Some(assignment.id);
        record.tax_rate = tax_rate;
        record.tax_amount = snapshot.tax_amount;
        record.base_amount = base;
        self.store.insert_assignment(assignment.clone()).await;
        self.store.insert_fee_record(record.clone()).await;
        (assignment, record)
    }

    pub async fn fee_record(&self, id: Uuid) -> FeeRecord {
        self.store
            .fee_records()
            .await
            .into_iter()
            .find(|r| r.id == id)
            .expect("fee record exists")
    }

    pub async fn orders_for(&self, provider_order_id: &str) -> Vec<Order> {
        self.store
            .orders()
            .await
            .into_iter()
            .filter(|o| o.provider_order_id == provider_order_id)
            .collect()
    }

    /// Open an order for the full balance of `records`.
    pub async fn open_order(&self, records: &[&FeeRecord]) -> String {
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        self.services
            .orders
            .create_order(self.tenant_id, self.payer_id, &ids, None)
            .await
            .expect("order created")
            .provider_order_id
    }

    /// Open an order, capture it at the provider and verify it.
    pub async fn pay(&self, records: &[&FeeRecord]) -> (String, String) {
        let provider_order_id = self.open_order(records).await;
        let total: i64 = self
            .orders_for(&provider_order_id)
            .await
            .iter()
            .map(|o| o.amount)
            .sum();
        let payment_id = self.gateway.capture(&provider_order_id, total);
        self.services
            .verification
            .verify(
                self.tenant_id,
                Some(self.payer_id),
                &proof(&provider_order_id, &payment_id),
            )
            .await
            .expect("payment verified");
        (provider_order_id, payment_id)
    }

    /// Wait for the spawned settlement of an order to record its transfer.
    pub async fn settled(&self, provider_order_id: &str) -> Vec<Order> {
        for _ in 0..100 {
            let orders = self.orders_for(provider_order_id).await;
            if orders.iter().all(|o| o.transfer_status.is_some()) {
                return orders;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("settlement of {} did not finish", provider_order_id);
    }
}

// HTTP

pub struct TestApp {
    pub address: String,
    pub ledger: TestLedger,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let ledger = TestLedger::new().await;
        let app = Application::build_with(&test_config(), ledger.services.clone())
            .await
            .expect("Failed to build test application");
        let address = format!("http://127.0.0.1:{}", app.port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Self { address, ledger }
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub fn as_payer(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("X-Tenant-ID", self.ledger.tenant_id.to_string())
            .header("X-User-ID", self.ledger.payer_id.to_string())
    }
}
