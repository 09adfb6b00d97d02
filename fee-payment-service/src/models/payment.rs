//! Money movements recorded against fee records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Money received against one fee record. Never updated once written.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub fee_record_id: Uuid,
    /// Member the fee record belongs to; receipt numbers run per payer.
    pub payer_id: Uuid,
    pub order_id: Uuid,
    pub provider_payment_id: String,
    pub amount: i64,
    pub receipt_number: String,
    /// `verification`, `webhook`, or the operator id that recorded it.
    pub recorded_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundKind {
    Refund,
    Chargeback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Money returned (or clawed back by a lost dispute) against a payment.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub fee_record_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub kind: RefundKind,
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    /// Failed refunds returned no money and do not count against the ledger.
    pub fn counts_against_ledger(&self) -> bool {
        self.status != RefundStatus::Failed
    }
}

/// Provider-side tracking of a refund, written before the refund API call.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RefundTracking {
    pub refund_id: Uuid,
    pub provider_payment_id: String,
    pub provider_refund_id: Option<String>,
    pub status: RefundStatus,
    pub updated_at: DateTime<Utc>,
}
