//! Fire-and-forget notifications to the notification service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentConfirmed,
    RefundFailed,
    DisputeCreated,
    DisputeLost,
    DisputeClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub tenant_id: Uuid,
    pub payee_id: Option<Uuid>,
    pub member_id: Option<Uuid>,
    pub fee_record_id: Option<Uuid>,
    pub amount: Option<i64>,
    pub reference: Option<String>,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, tenant_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            kind,
            tenant_id,
            payee_id: None,
            member_id: None,
            fee_record_id: None,
            amount: None,
            reference: None,
            message: message.into(),
        }
    }
}

/// Delivery never fails the caller; implementations log what they cannot send.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

pub struct HttpNotifier {
    client: Client,
    url: Option<String>,
}

impl HttpNotifier {
    pub fn new(url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: Notification) {
        let Some(url) = self.url.as_deref() else {
            tracing::info!(
                kind = ?notification.kind,
                tenant_id = %notification.tenant_id,
                message = %notification.message,
                "Notification (no endpoint configured)"
            );
            return;
        };

        match self.client.post(url).json(&notification).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(kind = ?notification.kind, "Notification delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    kind = ?notification.kind,
                    status = response.status().as_u16(),
                    "Notification endpoint rejected event"
                );
            }
            Err(e) => {
                tracing::warn!(kind = ?notification.kind, error = %e, "Notification delivery failed");
            }
        }
    }
}
