//! Structured logging setup and in-process metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log format options for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output with all fields
    Pretty,
    /// One line per event
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format: {other} (expected compact, pretty or json)")),
        }
    }
}

/// Logging configuration.
///
/// All runtime logs carry correlation fields where they apply:
/// - `instance_id`
/// - `execution_id`
/// - `orchestration_name`
/// - `activity_name`
/// - `worker_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[serde(rename = "format")]
    pub log_format: LogFormat,
    /// Level for the crate's own targets (e.g. "info", "debug")
    #[serde(rename = "level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,durable_e2e={level},tower_http={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides `log_level` when set.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of key metrics counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub orch_completions: u64,
    pub orch_failures: u64,
    pub orch_application_errors: u64,
    pub orch_infrastructure_errors: u64,
    pub orch_configuration_errors: u64,
    pub orch_terminations: u64,
    pub orch_continue_as_new: u64,
    pub activity_success: u64,
    pub activity_app_errors: u64,
    pub activity_infra_errors: u64,
    pub activity_config_errors: u64,
    pub entity_success: u64,
    pub entity_errors: u64,
}

#[derive(Debug, Default)]
pub struct MetricsProvider {
    orch_completions: AtomicU64,
    orch_failures: AtomicU64,
    orch_application_errors: AtomicU64,
    orch_infrastructure_errors: AtomicU64,
    orch_configuration_errors: AtomicU64,
    orch_terminations: AtomicU64,
    orch_continue_as_new: AtomicU64,
    activity_success: AtomicU64,
    activity_app_errors: AtomicU64,
    activity_infra_errors: AtomicU64,
    activity_config_errors: AtomicU64,
    entity_success: AtomicU64,
    entity_errors: AtomicU64,
}

impl MetricsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_orchestration_completion(&self) {
        self.orch_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failure under the category of its [`crate::ErrorDetails`].
    pub fn record_orchestration_failure(&self, category: &str) {
        self.orch_failures.fetch_add(1, Ordering::Relaxed);
        match category {
            "application" => self.orch_application_errors.fetch_add(1, Ordering::Relaxed),
            "infrastructure" => self.orch_infrastructure_errors.fetch_add(1, Ordering::Relaxed),
            "configuration" => self.orch_configuration_errors.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    #[inline]
    pub fn record_orchestration_termination(&self) {
        self.orch_terminations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_continue_as_new(&self) {
        self.orch_continue_as_new.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_success(&self) {
        self.activity_success.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_app_error(&self) {
        self.activity_app_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_infra_error(&self) {
        self.activity_infra_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_config_error(&self) {
        self.activity_config_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entity_operation(&self, success: bool) {
        if success {
            self.entity_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entity_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orch_completions: self.orch_completions.load(Ordering::Relaxed),
            orch_failures: self.orch_failures.load(Ordering::Relaxed),
            orch_application_errors: self.orch_application_errors.load(Ordering::Relaxed),
            orch_infrastructure_errors: self.orch_infrastructure_errors.load(Ordering::Relaxed),
            orch_configuration_errors: self.orch_configuration_errors.load(Ordering::Relaxed),
            orch_terminations: self.orch_terminations.load(Ordering::Relaxed),
            orch_continue_as_new: self.orch_continue_as_new.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_app_errors: self.activity_app_errors.load(Ordering::Relaxed),
            activity_infra_errors: self.activity_infra_errors.load(Ordering::Relaxed),
            activity_config_errors: self.activity_config_errors.load(Ordering::Relaxed),
            entity_success: self.entity_success.load(Ordering::Relaxed),
            entity_errors: self.entity_errors.load(Ordering::Relaxed),
        }
    }
}
