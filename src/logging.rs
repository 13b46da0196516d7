//! # Structured Logging Module
//!
//! Environment-aware console logging on the tracing ecosystem. Logs go to stdout; set
//! `LOG_FORMAT=json` for machine-readable output and `RUST_LOG` to override the level.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(&environment)));

        let json = std::env::var("LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            environment = %environment,
            json = json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("BATCHED_MIGRATIONS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log a migration-level operation (transition, hold, retry pass)
pub fn log_migration_operation(
    operation: &str,
    migration_id: i64,
    job_class_name: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        migration_id = migration_id,
        job_class_name = %job_class_name,
        status = %status,
        details = details,
        "MIGRATION_OPERATION"
    );
}

/// Log a batch job outcome
pub fn log_job_operation(
    operation: &str,
    migration_id: i64,
    job_id: i64,
    min_value: i64,
    max_value: i64,
    status: &str,
    attempts: i32,
) {
    tracing::info!(
        operation = %operation,
        migration_id = migration_id,
        job_id = job_id,
        min_value = min_value,
        max_value = max_value,
        status = %status,
        attempts = attempts,
        "BATCHED_JOB_OPERATION"
    );
}
