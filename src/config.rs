//! Application configuration.
//!
//! Loaded from an optional TOML file; fields missing from the file keep their
//! defaults, and command-line flags win over both.
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::{LogFormat, ObservabilityConfig, RuntimeOptions};

/// Durable end-to-end scenario host.
#[derive(Parser, Debug, Default)]
#[command(name = "durable-e2e", version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "DURABLE_E2E_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP surface to.
    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// `memory` or `sqlite:<url>`.
    #[arg(long, env = "DURABLE_E2E_STORAGE")]
    pub storage: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// compact, pretty or json.
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Failures injected before a flaky activity or entity succeeds.
    #[arg(long)]
    pub fail_first_attempts: Option<u32>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, message } => write!(f, "failed to read config file {}: {message}", path.display()),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {msg}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub runtime: RuntimeConfig,
    pub logging: ObservabilityConfig,
    pub faults: FaultConfig,
    pub scenarios: ScenarioConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL used in check-status links; derived from host and port when unset.
    pub base_url: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7071,
            base_url: None,
        }
    }
}

impl HttpConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Mirrors [`RuntimeOptions`] with plain millisecond fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub dispatcher_idle_sleep_ms: u64,
    pub orchestration_concurrency: usize,
    pub worker_concurrency: usize,
    pub entity_concurrency: usize,
    pub orchestrator_lock_timeout_ms: u64,
    pub worker_lock_timeout_ms: u64,
    pub entity_lock_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let d = RuntimeOptions::default();
        Self {
            dispatcher_idle_sleep_ms: d.dispatcher_idle_sleep_ms,
            orchestration_concurrency: d.orchestration_concurrency,
            worker_concurrency: d.worker_concurrency,
            entity_concurrency: d.entity_concurrency,
            orchestrator_lock_timeout_ms: d.orchestrator_lock_timeout.as_millis() as u64,
            worker_lock_timeout_ms: d.worker_lock_timeout.as_millis() as u64,
            entity_lock_timeout_ms: d.entity_lock_timeout.as_millis() as u64,
        }
    }
}

impl RuntimeConfig {
    pub fn to_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            dispatcher_idle_sleep_ms: self.dispatcher_idle_sleep_ms,
            orchestration_concurrency: self.orchestration_concurrency,
            worker_concurrency: self.worker_concurrency,
            entity_concurrency: self.entity_concurrency,
            orchestrator_lock_timeout: Duration::from_millis(self.orchestrator_lock_timeout_ms),
            worker_lock_timeout: Duration::from_millis(self.worker_lock_timeout_ms),
            entity_lock_timeout: Duration::from_millis(self.entity_lock_timeout_ms),
            ..RuntimeOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Attempts that fail before a flaky activity or entity operation succeeds.
    pub fail_first_attempts: u32,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self { fail_first_attempts: 1 }
    }
}

/// Timings used by the scenario apps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub retry_first_interval_ms: u64,
    pub simulated_work_ms: u64,
    pub long_activity_ms: u64,
    pub long_timer_minutes: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            retry_first_interval_ms: 5000,
            simulated_work_ms: 100,
            long_activity_ms: 5000,
            long_timer_minutes: 30,
        }
    }
}

/// Backing store for the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StorageConfig {
    #[default]
    Memory,
    /// sqlx connection url, e.g. `sqlite:durable.db`.
    Sqlite(String),
}

impl std::str::FromStr for StorageConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("memory") {
            return Ok(StorageConfig::Memory);
        }
        match s.strip_prefix("sqlite:") {
            Some(rest) if !rest.is_empty() => Ok(StorageConfig::Sqlite(s.to_string())),
            _ => Err(format!("unknown storage '{s}', expected 'memory' or 'sqlite:<url>'")),
        }
    }
}

impl TryFrom<String> for StorageConfig {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorageConfig> for String {
    fn from(value: StorageConfig) -> Self {
        match value {
            StorageConfig::Memory => "memory".to_string(),
            StorageConfig::Sqlite(url) => url,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// File (when given), then flag overrides, then validation.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => {
                debug!(target: "durable_e2e::config", path = %path.display(), "Loading config file");
                Self::load_from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_cli_overrides(cli)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli_overrides(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(host) = &cli.host {
            self.http.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.http.port = port;
        }
        if let Some(storage) = &cli.storage {
            self.storage = storage.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(level) = &cli.log_level {
            self.logging.log_level = level.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.log_format = format;
        }
        if let Some(n) = cli.fail_first_attempts {
            self.faults.fail_first_attempts = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == 0 {
            return Err(ConfigError::Invalid("http.port must be non-zero".to_string()));
        }
        let rt = &self.runtime;
        for (name, value) in [
            ("runtime.orchestration_concurrency", rt.orchestration_concurrency),
            ("runtime.worker_concurrency", rt.worker_concurrency),
            ("runtime.entity_concurrency", rt.entity_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: an empty file yields every default
    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.http.port, 7071);
        assert_eq!(config.http.base_url(), "http://127.0.0.1:7071");
        assert_eq!(config.faults.fail_first_attempts, 1);
        assert_eq!(config.scenarios.retry_first_interval_ms, 5000);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.runtime.to_options().worker_concurrency, 4);
    }

    /// Test: partial sections keep defaults for the fields they omit
    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml_str(
            r#"
            storage = "sqlite:durable.db"

            [http]
            port = 8080
            base_url = "http://example.test/"

            [logging]
            level = "debug"
            format = "json"

            [runtime]
            worker_concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.http.host, "127.0.0.1");
        assert_eq!(config.http.base_url(), "http://example.test");
        assert_eq!(config.storage, StorageConfig::Sqlite("sqlite:durable.db".to_string()));
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.logging.log_format, LogFormat::Json);
        assert_eq!(config.runtime.worker_concurrency, 8);
        assert_eq!(config.runtime.entity_concurrency, 2);
    }

    /// Test: flags override file values and validation rejects zero values
    #[test]
    fn test_cli_overrides_and_validation() {
        let mut config = AppConfig::default();
        let cli = Cli {
            port: Some(9000),
            fail_first_attempts: Some(2),
            storage: Some("memory".to_string()),
            ..Cli::default()
        };
        config.apply_cli_overrides(&cli).unwrap();
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.faults.fail_first_attempts, 2);
        assert!(config.validate().is_ok());

        config.runtime.worker_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.runtime.worker_concurrency = 1;
        config.http.port = 0;
        assert!(config.validate().is_err());
    }

    /// Test: unknown storage kinds are rejected
    #[test]
    fn test_storage_parse() {
        assert!("postgres://x".parse::<StorageConfig>().is_err());
        assert!("sqlite:".parse::<StorageConfig>().is_err());
        assert_eq!("MEMORY".parse::<StorageConfig>().unwrap(), StorageConfig::Memory);
    }
}
