pub mod fees;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod notifier;
pub mod orders;
pub mod razorpay;
pub mod reconciliation;
pub mod refunds;
pub mod settlement;
pub mod verification;
pub mod webhooks;

pub use gateway::{GatewayError, PaymentGateway};
pub use ledger::{ApplyOutcome, LedgerApplier};
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{HttpNotifier, Notifier};
pub use orders::OrderService;
pub use razorpay::RazorpayClient;
pub use reconciliation::ReconciliationService;
pub use refunds::RefundService;
pub use settlement::SettlementService;
pub use verification::VerificationService;
pub use webhooks::{WebhookAck, WebhookService};

use crate::config::{PolicyConfig, RazorpayConfig};
use crate::store::LedgerStore;
use std::sync::Arc;

/// Every service of the payment engine, wired to one store and one gateway.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn LedgerStore>,
    pub orders: OrderService,
    pub applier: LedgerApplier,
    pub verification: VerificationService,
    pub webhooks: WebhookService,
    pub refunds: RefundService,
    pub settlement: SettlementService,
    pub reconciliation: ReconciliationService,
}

impl Services {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        razorpay: &RazorpayConfig,
        policy: PolicyConfig,
    ) -> Self {
        let settlement = SettlementService::new(store.clone(), gateway.clone());
        let applier = LedgerApplier::new(store.clone(), settlement.clone(), notifier.clone());
        let refunds = RefundService::new(
            store.clone(),
            gateway.clone(),
            settlement.clone(),
            notifier.clone(),
            policy.verify_retry.clone(),
        );

        Self {
            orders: OrderService::new(store.clone(), gateway.clone(), policy.clone()),
            verification: VerificationService::new(
                store.clone(),
                gateway.clone(),
                applier.clone(),
                razorpay.key_secret.clone(),
                policy.verify_retry.clone(),
            ),
            webhooks: WebhookService::new(
                store.clone(),
                applier.clone(),
                refunds.clone(),
                notifier,
                razorpay.webhook_secret.clone(),
            ),
            reconciliation: ReconciliationService::new(
                store.clone(),
                gateway,
                settlement.clone(),
                policy,
            ),
            refunds,
            settlement,
            applier,
            store,
        }
    }
}
