//! Application startup and lifecycle management.

use crate::config::PaymentConfig;
use crate::handlers::{self, payments, webhooks};
use crate::services::{init_metrics, HttpNotifier, RazorpayClient, Services};
use crate::store::PgStore;
use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub services: Services,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the production application: PostgreSQL ledger, Razorpay gateway
    /// and HTTP notifications.
    pub async fn build(config: PaymentConfig) -> Result<Self, AppError> {
        let store = PgStore::connect(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            AppError::from(e)
        })?;
        store.run_migrations().await?;

        let razorpay = RazorpayClient::new(config.razorpay.clone());
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!(
                "Razorpay credentials not configured - payment features will be limited"
            );
        }

        let notifier = HttpNotifier::new(config.notification.url.clone());
        let services = Services::new(
            Arc::new(store),
            Arc::new(razorpay),
            Arc::new(notifier),
            &config.razorpay,
            config.policy.clone(),
        );

        Self::build_with(&config, services).await
    }

    /// Build around already wired services. Tests use this with the in-memory
    /// store and a scripted gateway.
    pub async fn build_with(config: &PaymentConfig, services: Services) -> Result<Self, AppError> {
        init_metrics();

        let state = AppState {
            service_name: config.service_name.clone(),
            services,
        };

        // Port 0 = random port for testing
        let address = config.common.bind_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", address, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!("{} listening on port {}", config.service_name, port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, router(self.state)).await
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/orders", post(payments::create_order))
        .route("/orders/abandon", post(payments::abandon_order))
        .route("/payments/verify", post(payments::verify_payment))
        .route("/payments/:id/refunds", post(payments::create_refund))
        .route("/fee-records/:id", get(payments::get_fee_record))
        .route("/webhooks/razorpay", post(webhooks::razorpay_webhook))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                    tenant_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

