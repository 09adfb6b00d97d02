//! Prometheus metrics for fee-payment-service.
//!
//! Business counters live in the default `prometheus` registry; HTTP request
//! metrics recorded through the `metrics` facade are rendered by the exporter
//! handle and appended.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Ledger applications by outcome (applied, already_applied, conflict, error).
pub static PAYMENTS_APPLIED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fee_payments_applied_total",
        "Ledger application attempts by outcome",
        &["outcome", "actor"]
    )
    .expect("Failed to register fee_payments_applied_total")
});

/// Minor units credited to fee records, by currency.
pub static PAYMENT_AMOUNT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fee_payment_amount_total",
        "Amount credited to fee records in minor units",
        &["currency"]
    )
    .expect("Failed to register fee_payment_amount_total")
});

pub static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fee_webhook_events_total",
        "Provider webhook events by type and outcome",
        &["event", "outcome"]
    )
    .expect("Failed to register fee_webhook_events_total")
});

pub static REFUNDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fee_refunds_total",
        "Refunds by outcome",
        &["outcome"]
    )
    .expect("Failed to register fee_refunds_total")
});

pub static TRANSFERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fee_transfers_total",
        "Settlement transfers by outcome",
        &["outcome"]
    )
    .expect("Failed to register fee_transfers_total")
});

pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fee_db_query_duration_seconds",
        "Database operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register fee_db_query_duration_seconds")
});

/// Install the `metrics` recorder and force the business metrics into the
/// registry. Safe to call more than once.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder already installed"),
        }
    }

    Lazy::force(&PAYMENTS_APPLIED_TOTAL);
    Lazy::force(&PAYMENT_AMOUNT_TOTAL);
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&REFUNDS_TOTAL);
    Lazy::force(&TRANSFERS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let mut buffer = Vec::new();
    if TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .is_ok()
    {
        output.push_str(&String::from_utf8_lossy(&buffer));
    }

    output
}

pub fn record_apply(outcome: &str, actor: &str) {
    PAYMENTS_APPLIED_TOTAL
        .with_label_values(&[outcome, actor])
        .inc();
}

pub fn record_amount(currency: &str, amount: i64) {
    if amount > 0 {
        PAYMENT_AMOUNT_TOTAL
            .with_label_values(&[currency])
            .inc_by(amount as u64);
    }
}

pub fn record_webhook(event: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[event, outcome])
        .inc();
}

pub fn record_refund(outcome: &str) {
    REFUNDS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_transfer(outcome: &str) {
    TRANSFERS_TOTAL.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_output_contains_business_counters() {
        init_metrics();
        record_apply("applied", "verification");
        record_refund("confirmed");
        let text = get_metrics();
        assert!(text.contains("fee_payments_applied_total"));
        assert!(text.contains("fee_refunds_total"));
    }
}
