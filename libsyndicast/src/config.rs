//! Configuration management for Syndicast
//!
//! Every section carries serde defaults, so an empty file (or no file at all,
//! via [`Config::default_config`]) yields a working single-host setup.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::jobs::{QueueName, QueueOptions, RetentionPolicy, RetryPolicy};
use crate::rate_limiter::RateLimitPolicy;
use crate::types::Platform;

/// Environment variable holding the credential vault master key
pub const MASTER_KEY_ENV: &str = "SYNDICAST_MASTER_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/syndicast/syndicast.db".to_string(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Master secret for token encryption. Prefer `SYNDICAST_MASTER_KEY`.
    #[serde(default, skip_serializing)]
    pub master_key: Option<String>,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl VaultConfig {
    /// Resolve the master key, with the environment taking precedence
    pub fn resolve_master_key(&self) -> Result<SecretString> {
        let key = std::env::var(MASTER_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.master_key.clone().filter(|k| !k.is_empty()))
            .ok_or_else(|| ConfigError::MissingField(format!("vault.master_key or {}", MASTER_KEY_ENV)))?;
        Ok(SecretString::from(key))
    }
}

/// Per-queue tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub job_timeout_secs: u64,
    pub keep_completed: usize,
    pub completed_max_age_secs: u64,
    pub keep_failed: usize,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            attempts: 3,
            backoff_ms: 5_000,
            max_backoff_ms: 300_000,
            job_timeout_secs: 120,
            keep_completed: 100,
            completed_max_age_secs: 24 * 3600,
            keep_failed: 500,
            poll_interval_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn to_options(&self) -> QueueOptions {
        QueueOptions {
            retry: RetryPolicy::exponential(
                self.attempts,
                Duration::from_millis(self.backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            ),
            retention: RetentionPolicy {
                keep_completed: self.keep_completed,
                completed_max_age: Duration::from_secs(self.completed_max_age_secs),
                keep_failed: self.keep_failed,
            },
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub publish: QueueConfig,
    pub metrics: QueueConfig,
    pub inbox_poll: QueueConfig,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            publish: QueueConfig {
                concurrency: 3,
                ..QueueConfig::default()
            },
            metrics: QueueConfig::default(),
            inbox_poll: QueueConfig::default(),
        }
    }
}

impl QueuesConfig {
    pub fn for_queue(&self, queue: QueueName) -> &QueueConfig {
        match queue {
            QueueName::Publish => &self.publish,
            QueueName::Metrics => &self.metrics,
            QueueName::InboxPoll => &self.inbox_poll,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// Shared counter store; requires the `redis` feature
    pub redis_url: Option<String>,
    pub api: RateLimitPolicy,
    pub publish: RateLimitPolicy,
    pub ai: RateLimitPolicy,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            api: RateLimitPolicy {
                max_requests: 100,
                window_ms: 60_000,
            },
            publish: RateLimitPolicy {
                max_requests: 10,
                window_ms: 60_000,
            },
            ai: RateLimitPolicy {
                max_requests: 20,
                window_ms: 60_000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Items refreshed per account-mode metrics job
    pub batch_size: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { batch_size: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub metrics_interval_secs: u64,
    pub inbox_interval_secs: u64,
    /// Spread each round's jobs over this many seconds
    pub jitter_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 3600,
            inbox_interval_secs: 300,
            jitter_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Override the API base URL (used by tests and API proxies)
    pub api_base: Option<String>,
    pub timeout_secs: u64,
    /// App secret used to verify webhook signatures
    #[serde(skip_serializing)]
    pub app_secret: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            timeout_secs: 30,
            app_secret: None,
        }
    }
}

impl PlatformConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    pub instagram: PlatformConfig,
    pub facebook: PlatformConfig,
    pub x: PlatformConfig,
}

impl PlatformsConfig {
    pub fn for_platform(&self, platform: Platform) -> Option<&PlatformConfig> {
        match platform {
            Platform::Instagram => Some(&self.instagram),
            Platform::Facebook => Some(&self.facebook),
            Platform::X => Some(&self.x),
            Platform::LinkedIn | Platform::TikTok | Platform::YouTube => None,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error: defaults apply.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::debug!("No config file at {}, using defaults", config_path.display());
            return Ok(Self::default_config());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject values that would wedge a worker pool or limiter
    pub fn validate(&self) -> Result<()> {
        for queue in QueueName::ALL {
            let qc = self.queues.for_queue(queue);
            if qc.concurrency == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("queues.{}.concurrency", queue.config_key()),
                    message: "must be at least 1".to_string(),
                }
                .into());
            }
        }
        for (name, policy) in [
            ("api", &self.rate_limits.api),
            ("publish", &self.rate_limits.publish),
            ("ai", &self.rate_limits.ai),
        ] {
            if policy.window_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("rate_limits.{}.window_ms", name),
                    message: "must be greater than zero".to_string(),
                }
                .into());
            }
        }
        for (field, secs) in [
            ("scheduler.metrics_interval_secs", self.scheduler.metrics_interval_secs),
            ("scheduler.inbox_interval_secs", self.scheduler.inbox_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be greater than zero".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> String {
        if let Ok(path) = std::env::var("SYNDICAST_DB_PATH") {
            return shellexpand::tilde(&path).to_string();
        }
        shellexpand::tilde(&self.database.path).to_string()
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.queues.publish.attempts, 3);
        assert_eq!(config.queues.publish.concurrency, 3);
        assert_eq!(config.queues.metrics.concurrency, 5);
        assert_eq!(config.metrics.batch_size, 20);
        assert_eq!(config.rate_limits.publish.max_requests, 10);
    }

    #[test]
    fn test_partial_queue_section() {
        let config = Config::from_toml(
            r#"
            [queues.metrics]
            concurrency = 12

            [rate_limits.api]
            max_requests = 3
            window_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.queues.metrics.concurrency, 12);
        assert_eq!(config.queues.metrics.attempts, 3);
        assert_eq!(config.rate_limits.api.max_requests, 3);
        assert_eq!(config.rate_limits.api.window_ms, 1000);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Config::from_toml(
            r#"
            [queues.publish]
            concurrency = 0
            "#,
        );
        let message = result.unwrap_err().to_string();
        assert!(message.contains("queues.publish.concurrency"));
    }

    #[test]
    fn test_queue_options_from_config() {
        let qc = QueueConfig::default();
        let options = qc.to_options();
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(options.retry.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(options.retention.keep_completed, 100);
    }

    #[test]
    #[serial]
    fn test_master_key_env_overrides_file() {
        std::env::set_var(MASTER_KEY_ENV, "from-env");
        let vault = VaultConfig {
            master_key: Some("from-file".to_string()),
        };
        let key = vault.resolve_master_key().unwrap();
        assert_eq!(key.expose_secret(), "from-env");
        std::env::remove_var(MASTER_KEY_ENV);

        let key = vault.resolve_master_key().unwrap();
        assert_eq!(key.expose_secret(), "from-file");
    }

    #[test]
    #[serial]
    fn test_missing_master_key() {
        std::env::remove_var(MASTER_KEY_ENV);
        let vault = VaultConfig::default();
        assert!(vault.resolve_master_key().is_err());
    }

    #[test]
    fn test_vault_debug_redacts_key() {
        let vault = VaultConfig {
            master_key: Some("super-secret".to_string()),
        };
        let debug = format!("{:?}", vault);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_env() {
        std::env::set_var("SYNDICAST_CONFIG", "/tmp/syndicast-test.toml");
        let path = resolve_config_path().unwrap();
        assert_eq!(path, PathBuf::from("/tmp/syndicast-test.toml"));
        std::env::remove_var("SYNDICAST_CONFIG");
    }
}
