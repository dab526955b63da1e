use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 900;
pub const DEFAULT_MAIL_SENDER: &str = "strata@localhost";
pub const DEFAULT_SUBJECT_PREFIX: &str = "Strata Report";

/// Top-level config (strata.toml + STRATA_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

/// Where schedule state, reports and run history live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Polling worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between poll cycles. Worst-case delivery delay is about one interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on a single report execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// How long in-flight runs may continue after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// A claim older than this is considered abandoned and may be taken over.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
    /// Stable worker identity. When unset the binary derives one at startup.
    pub id: Option<String>,
    /// IANA zone used for schedules without their own timezone.
    /// Falls back to `$TZ`, then UTC.
    pub timezone: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            id: None,
            timezone: None,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

/// The database that report SQL is executed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_path")]
    pub path: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: default_data_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub directory: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
        }
    }
}

/// Email hand-off. Delivery is skipped (with a warning) while `outbox_path` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub outbox_path: Option<String>,
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            outbox_path: None,
            sender: default_sender(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_execution_timeout() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}
fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_max_concurrent_runs() -> usize {
    DEFAULT_MAX_CONCURRENT_RUNS
}
fn default_claim_ttl() -> u64 {
    DEFAULT_CLAIM_TTL_SECS
}
fn default_sender() -> String {
    DEFAULT_MAIL_SENDER.to_string()
}
fn default_subject_prefix() -> String {
    DEFAULT_SUBJECT_PREFIX.to_string()
}
fn default_db_path() -> String {
    format!("{}/strata.db", strata_home())
}
fn default_data_path() -> String {
    format!("{}/data.db", strata_home())
}
fn default_cache_dir() -> String {
    format!("{}/cache", strata_home())
}

fn strata_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.strata", home)
}

impl StrataConfig {
    /// Load config from a TOML file with STRATA_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `STRATA_WORKER__POLL_INTERVAL_SECS=10`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("STRATA_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| crate::error::StrataError::Config(e.to_string()))?;
        config.worker.validate()?;
        Ok(config)
    }
}

impl WorkerConfig {
    /// A claim must outlive the longest run it guards, otherwise another
    /// worker can take over a schedule that is still executing.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.claim_ttl_secs <= self.execution_timeout_secs {
            return Err(crate::error::StrataError::Config(format!(
                "worker.claim_ttl_secs ({}) must be greater than worker.execution_timeout_secs ({})",
                self.claim_ttl_secs, self.execution_timeout_secs
            )));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    format!("{}/strata.toml", strata_home())
}
