//! Configuration for fee-payment-service.

use chrono::Duration;
use dotenvy::dotenv;
use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub razorpay: RazorpayConfig,
    pub policy: PolicyConfig,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
}

impl RazorpayConfig {
    /// Whether API credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.key_id.is_empty() && !self.key_secret.expose_secret().is_empty()
    }
}

/// Business thresholds of the payment engine and its background jobs.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub currency: String,
    pub order_reuse_window: Duration,
    pub verify_retry: RetryConfig,
    pub stale_order_after: Duration,
    pub stale_refund_after: Duration,
    pub transfer_retry_grace: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
            order_reuse_window: Duration::minutes(15),
            verify_retry: RetryConfig::default(),
            stale_order_after: Duration::hours(24),
            stale_refund_after: Duration::hours(48),
            transfer_retry_grace: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    /// Endpoint receiving JSON notification events. Unset means log-only.
    pub url: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let common = core_config::Config::load()?;
        let defaults = PolicyConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "fee-payment-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2),
            },
            razorpay: RazorpayConfig {
                key_id: env::var("RAZORPAY_KEY_ID").unwrap_or_default(),
                key_secret: Secret::new(env::var("RAZORPAY_KEY_SECRET").unwrap_or_default()),
                webhook_secret: Secret::new(
                    env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default(),
                ),
                api_base_url: env::var("RAZORPAY_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
            },
            policy: PolicyConfig {
                currency: env::var("PAYMENT_CURRENCY").unwrap_or(defaults.currency),
                order_reuse_window: Duration::seconds(env_parse("ORDER_REUSE_WINDOW_SECS", 900)),
                verify_retry: RetryConfig::with_max_retries(env_parse("VERIFY_MAX_RETRIES", 3)),
                stale_order_after: Duration::hours(env_parse("STALE_ORDER_HOURS", 24)),
                stale_refund_after: Duration::hours(env_parse("STALE_REFUND_HOURS", 48)),
                transfer_retry_grace: Duration::minutes(env_parse(
                    "TRANSFER_RETRY_GRACE_MINUTES",
                    30,
                )),
            },
            notification: NotificationConfig {
                url: env::var("NOTIFICATION_SERVICE_URL")
                    .ok()
                    .filter(|s| !s.is_empty()),
            },
        })
    }
}
