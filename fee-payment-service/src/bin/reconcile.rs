//! Operator CLI for the reconciliation jobs.
//!
//! Exit codes: 0 clean, 1 anomalies found, 2 a job failed.

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use fee_payment_service::config::PaymentConfig;
use fee_payment_service::services::reconciliation::default_recon_date;
use fee_payment_service::services::{HttpNotifier, RazorpayClient, Services};
use fee_payment_service::store::PgStore;
use secrecy::ExposeSecret;
use serde::Serialize;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "reconcile", about = "Fee payment reconciliation jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Compare provider captured payments with the ledger for one day.
    Day {
        /// UTC day, defaults to yesterday.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Retry missing or failed settlement transfers.
    Transfers,
    /// Check every fee record against its payments and refunds.
    Integrity,
    /// Report stale orders and refunds, duplicate payments and missing transfers.
    Health,
    /// Run every job.
    All,
}

/// Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum JobStatus {
    Clean,
    Anomalies,
    Failed,
}

impl JobStatus {
    fn exit_code(self) -> ExitCode {
        match self {
            JobStatus::Clean => ExitCode::SUCCESS,
            JobStatus::Anomalies => ExitCode::from(1),
            JobStatus::Failed => ExitCode::from(2),
        }
    }
}

fn worst(statuses: impl IntoIterator<Item = JobStatus>) -> JobStatus {
    statuses.into_iter().max().unwrap_or(JobStatus::Clean)
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Day { .. } => "day",
            Command::Transfers => "transfers",
            Command::Integrity => "integrity",
            Command::Health => "health",
            Command::All => "all",
        }
    }
}

fn print_report<T: Serialize>(job: &str, report: &T) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("== {} ==\n{}", job, json),
        Err(e) => eprintln!("== {} == (report not printable: {})", job, e),
    }
}

fn status(anomalies: bool) -> JobStatus {
    if anomalies {
        JobStatus::Anomalies
    } else {
        JobStatus::Clean
    }
}

const ALL_JOBS: [Command; 4] = [
    Command::Day { date: None },
    Command::Transfers,
    Command::Integrity,
    Command::Health,
];

async fn run_job(services: &Services, command: Command) -> anyhow::Result<JobStatus> {
    let jobs = &services.reconciliation;
    match command {
        Command::Day { date } => {
            let date = date.unwrap_or_else(|| default_recon_date(Utc::now()));
            let report = jobs.reconcile_day(date).await?;
            print_report("day", &report);
            Ok(status(report.has_anomalies()))
        }
        Command::Transfers => {
            let report = jobs.retry_transfers().await?;
            print_report("transfers", &report);
            Ok(status(report.failed > 0))
        }
        Command::Integrity => {
            let report = jobs.check_integrity().await?;
            print_report("integrity", &report);
            Ok(status(report.has_anomalies()))
        }
        Command::Health => {
            let report = jobs.run_health_checks().await?;
            print_report("health", &report);
            Ok(status(report.has_anomalies()))
        }
        Command::All => anyhow::bail!("`all` is not a single job"),
    }
}

/// Runs every job even when an earlier one fails and reports the worst outcome.
async fn run_each<F, Fut>(commands: &[Command], mut job: F) -> JobStatus
where
    F: FnMut(Command) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<JobStatus>>,
{
    let mut statuses = Vec::with_capacity(commands.len());
    for &command in commands {
        let status = match job(command).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, job = command.name(), "Reconciliation job failed");
                JobStatus::Failed
            }
        };
        statuses.push(status);
    }
    worst(statuses)
}

async fn run(services: &Services, command: Command) -> JobStatus {
    let commands = match command {
        Command::All => ALL_JOBS.to_vec(),
        single => vec![single],
    };
    run_each(&commands, |job| run_job(services, job)).await
}

async fn connect(config: &PaymentConfig) -> anyhow::Result<Services> {
    let store = PgStore::connect(
        config.database.url.expose_secret(),
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    Ok(Services::new(
        Arc::new(store),
        Arc::new(RazorpayClient::new(config.razorpay.clone())),
        Arc::new(HttpNotifier::new(config.notification.url.clone())),
        &config.razorpay,
        config.policy.clone(),
    ))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match PaymentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing("reconcile", &config.log_level, config.otlp_endpoint.as_deref());

    let services = match connect(&config).await {
        Ok(services) => services,
        Err(e) => {
            tracing::error!(error = %e, "Could not set up reconciliation");
            return ExitCode::from(2);
        }
    };

    run(&services, cli.command).await.exit_code()
}
