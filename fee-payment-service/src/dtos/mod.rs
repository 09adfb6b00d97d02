//! Request and response bodies of the HTTP API.

use crate::models::{FeeRecord, Payment, Refund};
use crate::services::orders::CheckoutPayload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 50, message = "between 1 and 50 fee records"))]
    pub fee_record_ids: Vec<Uuid>,
    /// Minor units. Defaults to the full outstanding balance.
    #[validate(range(min = 1))]
    pub amount: Option<i64>,
}

pub type CreateOrderResponse = CheckoutPayload;

#[derive(Debug, Deserialize, Validate)]
pub struct AbandonOrderRequest {
    #[validate(length(min = 1, max = 64))]
    pub provider_order_id: String,
    #[validate(length(max = 255))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AbandonOrderResponse {
    pub provider_order_id: String,
    pub orders_failed: u64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyPaymentRequest {
    #[validate(length(min = 1, max = 64))]
    pub provider_order_id: String,
    #[validate(length(min = 1, max = 64))]
    pub provider_payment_id: String,
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
    pub fee_record_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub already_applied: bool,
    pub fee_records: Vec<FeeRecord>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRefundRequest {
    #[validate(range(min = 1))]
    pub amount: Option<i64>,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

pub type RefundResponse = Refund;
