//! Payment gateway abstraction and the provider entities it exchanges.
//!
//! Entity shapes follow the provider's REST payloads so they deserialize both
//! from API responses and from webhook bodies.

use crate::error::PaymentError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway credentials not configured")]
    NotConfigured,

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway returned {status}: {code} - {description}")]
    Api {
        status: u16,
        code: String,
        description: String,
    },

    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Network failures, throttling and provider-side errors may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::NotConfigured | Self::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<GatewayError> for PaymentError {
    fn from(err: GatewayError) -> Self {
        PaymentError::Gateway {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub receipt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub order_id: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ProviderPayment {
    pub fn is_captured(&self) -> bool {
        self.status == "captured"
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_at, 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub amount: i64,
    pub notes: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    #[serde(default)]
    pub payment_id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub notes: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub account: String,
    pub amount: i64,
    pub currency: String,
    pub notes: serde_json::Value,
    pub on_hold: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTransfer {
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: serde_json::Value,
}

impl ProviderTransfer {
    /// String value of a note attached at creation.
    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReversal {
    pub id: String,
    #[serde(default)]
    pub transfer_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDispute {
    pub id: String,
    #[serde(default)]
    pub payment_id: String,
    pub amount: i64,
    #[serde(default)]
    pub reason_code: Option<String>,
}

/// Outbound operations against the payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public key id handed to checkout clients.
    fn key_id(&self) -> &str;

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder, GatewayError>;

    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, GatewayError>;

    async fn create_refund(
        &self,
        payment_id: &str,
        request: &RefundRequest,
    ) -> Result<ProviderRefund, GatewayError>;

    async fn create_transfer(
        &self,
        payment_id: &str,
        request: &TransferRequest,
    ) -> Result<ProviderTransfer, GatewayError>;

    async fn reverse_transfer(
        &self,
        transfer_id: &str,
        amount: i64,
    ) -> Result<ProviderReversal, GatewayError>;

    async fn list_payment_transfers(
        &self,
        payment_id: &str,
    ) -> Result<Vec<ProviderTransfer>, GatewayError>;

    /// Captured payments created in `[from, to)`.
    async fn list_captured_payments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProviderPayment>, GatewayError>;
}
