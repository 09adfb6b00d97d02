//! Payable intents handed to the payment gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Paid,
    Failed,
}

/// Marketplace transfer state of an order's settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Created,
    Processed,
    Settled,
    Reversed,
    Failed,
}

impl TransferStatus {
    /// Map a provider transfer status or webhook event suffix.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "created" => Self::Created,
            "processed" => Self::Processed,
            "settled" => Self::Settled,
            "reversed" => Self::Reversed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One fee record's share of a payable intent. Rows of a multi-record intent
/// share `provider_order_id`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub payer_id: Uuid,
    pub fee_record_id: Uuid,
    pub payee_id: Uuid,
    /// This record's allocation, minor units.
    pub amount: i64,
    /// Amount of the whole provider order.
    pub total_amount: i64,
    pub currency: String,
    pub provider_order_id: String,
    pub status: OrderStatus,
    pub payment_applied: bool,
    pub provider_payment_id: Option<String>,
    pub provider_signature: Option<String>,
    /// Payee commission rate at the time the order was created.
    pub commission_rate: Decimal,
    pub platform_fee: Option<i64>,
    pub transfer_amount: Option<i64>,
    pub transfer_id: Option<String>,
    pub transfer_status: Option<TransferStatus>,
    pub transfer_error: Option<String>,
    pub reversed_amount: i64,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Whether settlement still has to create (or find) a transfer.
    pub fn needs_transfer(&self) -> bool {
        self.payment_applied
            && (self.transfer_id.is_none()
                || self.transfer_status == Some(TransferStatus::Failed))
    }
}
