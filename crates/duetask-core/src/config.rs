//! Duetask configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DuetaskError, Result};

/// Environment variable overriding `push.api_key`.
pub const ENV_PUSH_API_KEY: &str = "DUETASK_PUSH_API_KEY";
/// Environment variable overriding `push.app_id`.
pub const ENV_PUSH_APP_ID: &str = "DUETASK_PUSH_APP_ID";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuetaskConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub push: PushConfig,
}

impl DuetaskConfig {
    /// Load config from the default path (~/.duetask/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let config = if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load_from(&path)?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DuetaskError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DuetaskError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply `DUETASK_PUSH_*` environment variables on top of the file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(ENV_PUSH_API_KEY) {
            if !key.is_empty() {
                self.push.api_key = key;
            }
        }
        if let Ok(app_id) = std::env::var(ENV_PUSH_APP_ID) {
            if !app_id.is_empty() {
                self.push.app_id = app_id;
            }
        }
        self
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DuetaskError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the duetask home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".duetask")
    }
}

/// Job scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long before the due date the warning goes out.
    #[serde(default = "default_warn_window_secs")]
    pub warn_window_secs: u64,
    /// How often the job runner looks for due jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Max jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a claimed job stays leased before it is redelivered.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_warn_window_secs() -> u64 { 600 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_batch_size() -> usize { 32 }
fn default_lease_secs() -> u64 { 60 }
fn default_max_concurrent_jobs() -> usize { 8 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warn_window_secs: default_warn_window_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Upper bound for any configured delay, so timestamp arithmetic cannot overflow.
pub const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 3600;

fn capped_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DELAY_SECS) as i64)
}

fn capped_millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.min(MAX_DELAY_SECS * 1000) as i64)
}

impl SchedulerConfig {
    pub fn warn_window(&self) -> chrono::Duration {
        capped_secs(self.warn_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, MAX_DELAY_SECS * 1000))
    }

    pub fn lease(&self) -> chrono::Duration {
        capped_secs(self.lease_secs)
    }
}

/// Retry policy for failed job handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total deliveries allowed before a job is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 300_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> chrono::Duration {
        capped_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> chrono::Duration {
        capped_millis(self.max_delay_ms)
    }
}

/// SQLite database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.duetask/duetask.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Push notification API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_push_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Authorization scheme placed before the key (`Basic`, `Bearer`, `Key`).
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default = "default_push_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

fn default_push_endpoint() -> String { "https://onesignal.com/api/v1/notifications".into() }
fn default_auth_scheme() -> String { "Basic".into() }
fn default_push_timeout_secs() -> u64 { 5 }
fn default_max_redirects() -> usize { 5 }

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: default_push_endpoint(),
            app_id: String::new(),
            api_key: String::new(),
            auth_scheme: default_auth_scheme(),
            timeout_secs: default_push_timeout_secs(),
            max_redirects: default_max_redirects(),
        }
    }
}

impl PushConfig {
    /// Push is only attempted when a credential is present.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
