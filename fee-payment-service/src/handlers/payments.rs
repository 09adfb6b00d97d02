//! Payer and operator endpoints: orders, verification, refunds, fee records.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    AbandonOrderRequest, AbandonOrderResponse, CreateOrderRequest, CreateOrderResponse,
    CreateRefundRequest, RefundResponse, VerifyPaymentRequest, VerifyPaymentResponse,
};
use crate::middleware::TenantContext;
use crate::models::FeeRecord;
use crate::services::refunds::RefundRequestInput;
use crate::services::verification::PaymentProof;
use crate::startup::AppState;

/// Open (or reuse) a provider order for the caller's fee records.
pub async fn create_order(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    payload.validate()?;
    let payer_id = tenant.require_user()?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        payer_id = %payer_id,
        records = payload.fee_record_ids.len(),
        amount = ?payload.amount,
        "Creating payment order"
    );

    let checkout = state
        .services
        .orders
        .create_order(tenant.tenant_id, payer_id, &payload.fee_record_ids, payload.amount)
        .await?;

    let status = if checkout.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(checkout)))
}

pub async fn abandon_order(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<AbandonOrderRequest>,
) -> Result<Json<AbandonOrderResponse>, AppError> {
    payload.validate()?;
    let payer_id = tenant.require_user()?;

    let orders_failed = state
        .services
        .orders
        .abandon_order(
            tenant.tenant_id,
            payer_id,
            &payload.provider_order_id,
            payload.reason.as_deref().unwrap_or("abandoned by payer"),
        )
        .await?;

    Ok(Json(AbandonOrderResponse {
        provider_order_id: payload.provider_order_id,
        orders_failed,
    }))
}

/// Confirm a checkout from the client's payment proof.
pub async fn verify_payment(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    payload.validate()?;

    let proof = PaymentProof {
        provider_order_id: payload.provider_order_id,
        provider_payment_id: payload.provider_payment_id,
        signature: payload.signature,
        fee_record_id: payload.fee_record_id,
    };
    let outcome = state
        .services
        .verification
        .verify(tenant.tenant_id, tenant.user_id, &proof)
        .await?;

    Ok(Json(VerifyPaymentResponse {
        already_applied: outcome.already_applied,
        fee_records: outcome.fee_records,
        payments: outcome.payments,
    }))
}

pub async fn create_refund(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<CreateRefundRequest>,
) -> Result<(StatusCode, Json<RefundResponse>), AppError> {
    payload.validate()?;
    let actor = tenant
        .user_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "operator".to_string());

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        payment_id = %payment_id,
        amount = ?payload.amount,
        actor = %actor,
        "Initiating refund"
    );

    let refund = state
        .services
        .refunds
        .initiate_refund(
            tenant.tenant_id,
            RefundRequestInput {
                payment_id,
                amount: payload.amount,
                reason: payload.reason,
                actor,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(refund)))
}

pub async fn get_fee_record(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<FeeRecord>, AppError> {
    let record = state
        .services
        .store
        .get_fee_record(tenant.tenant_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Fee record not found")))?;
    Ok(Json(record))
}
