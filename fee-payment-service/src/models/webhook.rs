use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only log entry for a verified inbound provider event.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookEventLog {
    pub id: Uuid,
    pub provider_event_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
