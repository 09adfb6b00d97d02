//! Domain models for fee-payment-service.

mod fee_record;
mod order;
mod payment;
mod webhook;

pub use fee_record::{BillingCycle, FeeRecord, FeeStatus, Payee, RecurringAssignment, SettlementStatus};
pub use order::{Order, OrderStatus, TransferStatus};
pub use payment::{Payment, Refund, RefundKind, RefundStatus, RefundTracking};
pub use webhook::WebhookEventLog;
