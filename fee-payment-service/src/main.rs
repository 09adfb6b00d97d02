use fee_payment_service::{config::PaymentConfig, Application};
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PaymentConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    let application = Application::build(config).await?;
    application.run_until_stopped().await?;

    Ok(())
}
