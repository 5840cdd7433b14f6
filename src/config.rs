use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Process configuration. Loaded from environment variables (via `.env` in
/// development) with an optional TOML overlay for the less sensitive knobs
/// (batch sizes, worker pool widths, lock leases). Secrets (bucket keys, mongo
/// credentials, SMTP auth) only ever come from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_database: String,

    pub source_bucket: String,
    pub source_prefix: String,
    pub target_bucket: String,
    pub target_prefix: String,
    pub report_bucket: String,
    pub report_prefix: String,

    pub smtp_relay: String,
    pub smtp_username: String,
    pub smtp_password: String,
    pub notification_from: String,
    pub notification_to: Vec<String>,

    pub tuning: Tuning,
}

/// The non-secret, frequently-tweaked knobs. Broken out so it can be loaded
/// from a TOML file and overridden piecemeal without touching secrets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub ingestion_batch_size: usize,
    pub acquisition_workers: usize,
    pub ingestion_workers: usize,
    pub lock_lease_secs: u64,
    pub lock_heartbeat_interval_secs: u64,
    pub lock_acquire_timeout_secs: u64,
    pub report_page_size: usize,
    pub analysis_page_size: usize,
    pub analysis_progress_every: usize,
    pub presign_ttl_secs: u64,
    pub retry_max_attempts: u32,
}

impl Tuning {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn lock_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lock_heartbeat_interval_secs)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_acquire_timeout_secs)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            ingestion_batch_size: 1000,
            acquisition_workers: 8,
            ingestion_workers: 4,
            lock_lease_secs: 60,
            lock_heartbeat_interval_secs: 20,
            lock_acquire_timeout_secs: 5,
            report_page_size: 50,
            analysis_page_size: 500,
            analysis_progress_every: 500,
            presign_ttl_secs: 7 * 24 * 60 * 60,
            retry_max_attempts: 6,
        }
    }
}

impl Config {
    /// Loads configuration the way the CLI does: `.env` first (best effort,
    /// missing file is fine), then required environment variables, then an
    /// optional `litp.toml` tuning overlay if `LITP_CONFIG_FILE` points at one.
    pub fn from_env() -> Result<Config, ConfigError> {
        dotenvy::dotenv().ok();

        let tuning = match std::env::var("LITP_CONFIG_FILE") {
            Ok(path) => {
                let contents = std::fs::read_to_string(&path)?;
                toml::from_str(&contents)?
            }
            Err(_) => Tuning::default(),
        };

        Ok(Config {
            mongo_uri: required("LITP_MONGO_URI")?,
            mongo_database: env_or("LITP_MONGO_DATABASE", "litp"),
            source_bucket: required("LITP_SOURCE_BUCKET")?,
            source_prefix: env_or("LITP_SOURCE_PREFIX", ""),
            target_bucket: required("LITP_TARGET_BUCKET")?,
            target_prefix: env_or("LITP_TARGET_PREFIX", ""),
            report_bucket: required("LITP_REPORT_BUCKET")?,
            report_prefix: env_or("LITP_REPORT_PREFIX", "cleanse-reports/"),
            smtp_relay: env_or("LITP_SMTP_RELAY", ""),
            smtp_username: env_or("LITP_SMTP_USERNAME", ""),
            smtp_password: env_or("LITP_SMTP_PASSWORD", ""),
            notification_from: env_or("LITP_NOTIFICATION_FROM", "litp-cleanse@example.com"),
            notification_to: env_or("LITP_NOTIFICATION_TO", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            tuning,
        })
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
