//! Server configuration loaded from `CHAIRBOOK_*` environment variables.
//!
//! A `.env` file in the working directory is read first (see `main.rs`), so
//! local development can keep its settings there.
//!
//! | Variable | Default |
//! |---|---|
//! | `CHAIRBOOK_BIND` | `0.0.0.0` |
//! | `CHAIRBOOK_PORT` | `5433` |
//! | `CHAIRBOOK_DATA_DIR` | `./data` |
//! | `CHAIRBOOK_PASSWORD` | `chairbook` |
//! | `CHAIRBOOK_MAX_CONNECTIONS` | `256` |
//! | `CHAIRBOOK_COMPACT_THRESHOLD` | `1000` |
//! | `CHAIRBOOK_METRICS_PORT` | unset (exporter disabled) |
//! | `CHAIRBOOK_LOCK_TIMEOUT_MS` | `2000` |
//! | `CHAIRBOOK_COMMIT_ATTEMPTS` | `3` |
//! | `CHAIRBOOK_RETRY_BASE_MS` | `20` |
//! | `CHAIRBOOK_NOTIFY_TIMEOUT_MS` | `1000` |
//! | `CHAIRBOOK_LOG_FORMAT` | `text` (or `json`) |
//!
//! Log verbosity follows `RUST_LOG`.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::scheduling::CommitPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// How long a mutation waits for a provider's lock before giving up.
    pub lock_timeout: Duration,
    /// Commit attempts, the first included.
    pub commit_attempts: usize,
    pub retry_base: Duration,
    pub notify_timeout: Duration,
    pub log_format: String,
}

/// Parsed value of `name`, or `default` if unset. A set but malformed value
/// is an error rather than a silent fallback.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    var_or(name, default).map(Duration::from_millis)
}

impl Config {
    /// Reads the environment. Call [`Config::validate`] before use.
    pub fn from_env() -> Result<Self> {
        let metrics_port: Option<u16> = match env::var("CHAIRBOOK_METRICS_PORT") {
            Ok(raw) => Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("CHAIRBOOK_METRICS_PORT has an invalid value {raw:?}"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            bind: env::var("CHAIRBOOK_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: var_or("CHAIRBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(
                env::var("CHAIRBOOK_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            password: env::var("CHAIRBOOK_PASSWORD").unwrap_or_else(|_| "chairbook".to_string()),
            max_connections: var_or("CHAIRBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: var_or("CHAIRBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            lock_timeout: millis("CHAIRBOOK_LOCK_TIMEOUT_MS", 2000)?,
            commit_attempts: var_or("CHAIRBOOK_COMMIT_ATTEMPTS", 3)?,
            retry_base: millis("CHAIRBOOK_RETRY_BASE_MS", 20)?,
            notify_timeout: millis("CHAIRBOOK_NOTIFY_TIMEOUT_MS", 1000)?,
            log_format: env::var("CHAIRBOOK_LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("CHAIRBOOK_MAX_CONNECTIONS must be at least 1");
        }
        if self.compact_threshold == 0 {
            anyhow::bail!("CHAIRBOOK_COMPACT_THRESHOLD must be greater than 0");
        }
        if self.lock_timeout.is_zero() {
            anyhow::bail!("CHAIRBOOK_LOCK_TIMEOUT_MS must be greater than 0");
        }
        if self.commit_attempts == 0 || self.commit_attempts > 10 {
            anyhow::bail!(
                "CHAIRBOOK_COMMIT_ATTEMPTS must be between 1 and 10, got {}",
                self.commit_attempts
            );
        }
        if self.notify_timeout.is_zero() {
            anyhow::bail!("CHAIRBOOK_NOTIFY_TIMEOUT_MS must be greater than 0");
        }
        if self.password.is_empty() {
            anyhow::bail!("CHAIRBOOK_PASSWORD must not be empty");
        }
        if self.log_format != "text" && self.log_format != "json" {
            anyhow::bail!(
                "CHAIRBOOK_LOG_FORMAT must be 'text' or 'json', got '{}'",
                self.log_format
            );
        }
        if self.metrics_port == Some(self.port) {
            anyhow::bail!("CHAIRBOOK_METRICS_PORT must differ from CHAIRBOOK_PORT");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("chairbook.wal")
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            attempts: self.commit_attempts,
            retry_base: self.retry_base,
            notify_timeout: self.notify_timeout,
        }
    }

    /// Logs the effective settings, password omitted.
    pub fn print_summary(&self) {
        tracing::info!("configuration loaded:");
        tracing::info!("  listen: {}", self.listen_addr());
        tracing::info!("  data_dir: {}", self.data_dir.display());
        tracing::info!("  max_connections: {}", self.max_connections);
        tracing::info!("  compact_threshold: {}", self.compact_threshold);
        tracing::info!(
            "  commit: {} attempts, {:?} base backoff, {:?} lock timeout",
            self.commit_attempts,
            self.retry_base,
            self.lock_timeout
        );
        tracing::info!(
            "  metrics: {}",
            self.metrics_port
                .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
        );
    }
}

/// Reads and validates the configuration.
pub fn load_from_env() -> Result<Config> {
    let config = Config::from_env()?;
    config.validate()?;
    Ok(config)
}
