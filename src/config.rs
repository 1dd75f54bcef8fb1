//! Configuration loader and validator for the letter delivery engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub transport: Transport,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sweep_interval_ms: u64,
    pub dispatch_workers: usize,
    pub run_deadline_seconds: u64,
    pub send_timeout_ms: u64,
}

/// Mail API transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transport {
    pub endpoint: String,
    pub api_key: String,
    pub from_address: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sweep_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sweep_interval_ms must be > 0"));
    }
    if cfg.app.dispatch_workers == 0 {
        return Err(ConfigError::Invalid("app.dispatch_workers must be > 0"));
    }
    if cfg.app.run_deadline_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.run_deadline_seconds must be > 0",
        ));
    }
    if cfg.app.send_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.send_timeout_ms must be > 0"));
    }

    if cfg.transport.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("transport.endpoint must be non-empty"));
    }
    if cfg.transport.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("transport.api_key must be non-empty"));
    }
    if cfg.transport.from_address.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "transport.from_address must be non-empty",
        ));
    }

    Ok(())
}

/// Example YAML document; parsed by tests and shipped as a starting point.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sweep_interval_ms: 1000
  dispatch_workers: 4
  run_deadline_seconds: 300
  send_timeout_ms: 10000

transport:
  endpoint: "https://mail.example.com/v1/messages"
  api_key: "YOUR_MAIL_API_KEY"
  from_address: "letters@example.com"
"#
}
