//! Razorpay payment provider client.
//!
//! Implements the Orders, Payments, Refunds and Route (transfers) APIs used by
//! the payment engine, plus the webhook envelope the provider posts back.

use crate::config::RazorpayConfig;
use crate::services::gateway::{
    GatewayError, OrderRequest, PaymentGateway, ProviderDispute, ProviderOrder, ProviderPayment,
    ProviderRefund, ProviderReversal, ProviderTransfer, RefundRequest, TransferRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PAGE_SIZE: usize = 100;

/// Razorpay client for interacting with the Razorpay API.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: RazorpayConfig,
}

/// Razorpay API error response.
#[derive(Debug, Deserialize)]
pub struct RazorpayError {
    pub error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct RazorpayErrorDetail {
    pub code: String,
    pub description: String,
    pub source: Option<String>,
    pub step: Option<String>,
    pub reason: Option<String>,
}

/// List responses (`entity: collection`).
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Collection<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Serialize)]
struct CreateTransfers<'a> {
    transfers: [&'a TransferRequest; 1],
}

#[derive(Debug, Serialize)]
struct ReversalRequest {
    amount: i64,
}

/// Razorpay webhook event.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub payload: WebhookPayload,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<Wrapped<ProviderPayment>>,
    pub order: Option<Wrapped<ProviderOrder>>,
    pub refund: Option<Wrapped<ProviderRefund>>,
    pub transfer: Option<Wrapped<ProviderTransfer>>,
    pub dispute: Option<Wrapped<ProviderDispute>>,
}

/// Webhook entities arrive as `{"entity": {...}}`.
#[derive(Debug, Deserialize)]
pub struct Wrapped<T> {
    pub entity: T,
}

impl WebhookEvent {
    /// Typed view of an already-decoded webhook body.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload)
    }

    pub fn payment(&self) -> Option<&ProviderPayment> {
        self.payload.payment.as_ref().map(|w| &w.entity)
    }

    pub fn order(&self) -> Option<&ProviderOrder> {
        self.payload.order.as_ref().map(|w| &w.entity)
    }

    pub fn refund(&self) -> Option<&ProviderRefund> {
        self.payload.refund.as_ref().map(|w| &w.entity)
    }

    pub fn transfer(&self) -> Option<&ProviderTransfer> {
        self.payload.transfer.as_ref().map(|w| &w.entity)
    }

    pub fn dispute(&self) -> Option<&ProviderDispute> {
        self.payload.dispute.as_ref().map(|w| &w.entity)
    }
}

impl RazorpayClient {
    /// Create a new Razorpay client.
    pub fn new(config: RazorpayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    /// Check if Razorpay is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn send<B, T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let url = format!("{}{}", self.config.api_base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(method = %method, path = %path, status = %status, "Razorpay response");

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
        } else {
            let error: RazorpayError =
                serde_json::from_str(&body).unwrap_or_else(|_| RazorpayError {
                    error: RazorpayErrorDetail {
                        code: "UNKNOWN".to_string(),
                        description: body.clone(),
                        source: None,
                        step: None,
                        reason: None,
                    },
                });
            tracing::error!(
                path = %path,
                status = status.as_u16(),
                code = %error.error.code,
                description = %error.error.description,
                "Razorpay request failed"
            );
            Err(GatewayError::Api {
                status: status.as_u16(),
                code: error.error.code,
                description: error.error.description,
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    fn key_id(&self) -> &str {
        &self.config.key_id
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder, GatewayError> {
        let order: ProviderOrder = self
            .send(Method::POST, "/orders", &[], Some(request))
            .await?;
        tracing::info!(
            provider_order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            "Razorpay order created"
        );
        Ok(order)
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, GatewayError> {
        self.send::<(), _>(Method::GET, &format!("/payments/{}", payment_id), &[], None)
            .await
    }

    async fn create_refund(
        &self,
        payment_id: &str,
        request: &RefundRequest,
    ) -> Result<ProviderRefund, GatewayError> {
        let refund: ProviderRefund = self
            .send(
                Method::POST,
                &format!("/payments/{}/refund", payment_id),
                &[],
                Some(request),
            )
            .await?;
        tracing::info!(
            provider_refund_id = %refund.id,
            provider_payment_id = %payment_id,
            amount = refund.amount,
            "Razorpay refund created"
        );
        Ok(refund)
    }

    async fn create_transfer(
        &self,
        payment_id: &str,
        request: &TransferRequest,
    ) -> Result<ProviderTransfer, GatewayError> {
        let body = CreateTransfers {
            transfers: [request],
        };
        let collection: Collection<ProviderTransfer> = self
            .send(
                Method::POST,
                &format!("/payments/{}/transfers", payment_id),
                &[],
                Some(&body),
            )
            .await?;
        collection
            .items
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("transfer response had no items".to_string()))
    }

    async fn reverse_transfer(
        &self,
        transfer_id: &str,
        amount: i64,
    ) -> Result<ProviderReversal, GatewayError> {
        self.send(
            Method::POST,
            &format!("/transfers/{}/reversals", transfer_id),
            &[],
            Some(&ReversalRequest { amount }),
        )
        .await
    }

    async fn list_payment_transfers(
        &self,
        payment_id: &str,
    ) -> Result<Vec<ProviderTransfer>, GatewayError> {
        let collection: Collection<ProviderTransfer> = self
            .send::<(), _>(
                Method::GET,
                &format!("/payments/{}/transfers", payment_id),
                &[],
                None,
            )
            .await?;
        Ok(collection.items)
    }

    async fn list_captured_payments(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProviderPayment>, GatewayError> {
        let (from_ts, to_ts) = (from.timestamp(), to.timestamp());
        let mut captured = Vec::new();
        let mut skip = 0usize;

        loop {
            let query = [
                ("from", from_ts.to_string()),
                ("to", to_ts.to_string()),
                ("count", PAGE_SIZE.to_string()),
                ("skip", skip.to_string()),
            ];
            let page: Collection<ProviderPayment> = self
                .send::<(), _>(Method::GET, "/payments", &query, None)
                .await?;
            let fetched = page.items.len();
            captured.extend(
                page.items
                    .into_iter()
                    .filter(|p| p.is_captured() && p.created_at >= from_ts && p.created_at < to_ts),
            );
            if fetched < PAGE_SIZE {
                break;
            }
            skip += fetched;
        }

        Ok(captured)
    }
}
