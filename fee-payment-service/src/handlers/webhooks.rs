//! Razorpay webhook endpoint.
//!
//! The body is taken as raw bytes: the signature covers the exact payload,
//! so nothing may parse or re-serialize it first.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use service_core::error::AppError;

use crate::error::PaymentError;
use crate::services::WebhookAck;
use crate::startup::AppState;

pub const SIGNATURE_HEADER: &str = "X-Razorpay-Signature";
pub const EVENT_ID_HEADER: &str = "X-Razorpay-Event-Id";

pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let event_id = headers.get(EVENT_ID_HEADER).and_then(|v| v.to_str().ok());

    match state.services.webhooks.ingest(&body, signature, event_id).await {
        Ok(WebhookAck::Processed) => Ok(StatusCode::OK),
        Ok(WebhookAck::Retry) => Ok(StatusCode::INTERNAL_SERVER_ERROR),
        Err(PaymentError::InvalidSignature) => Err(AppError::Unauthorized(anyhow::anyhow!(
            "invalid webhook signature"
        ))),
        Err(e) => Err(e.into()),
    }
}
