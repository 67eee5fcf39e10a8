//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Email provider and sender configuration.
    pub mail: MailConfig,
    /// Outbound send caps.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Retry policy for failed deliveries.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Worker pool and queue maintenance settings.
    #[serde(default)]
    pub queue: QueueSettings,
    /// `PostgreSQL` job store. The in-memory store is used when absent.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Redis for shared rate-limit counters. Counters stay in-process when absent.
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Email provider configuration.
///
/// Which credential fields are required depends on `provider`; the provider
/// factory validates them at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Active provider selector (`sendgrid` or `ses`).
    pub provider: String,
    /// `SendGrid` API key.
    #[serde(default)]
    pub sendgrid_api_key: Option<String>,
    /// AWS access key ID for SES.
    #[serde(default)]
    pub ses_access_key_id: Option<String>,
    /// AWS secret access key for SES.
    #[serde(default)]
    pub ses_secret_access_key: Option<String>,
    /// AWS region for SES.
    #[serde(default)]
    pub ses_region: Option<String>,
    /// Default from address.
    pub from_address: String,
    /// Default from name.
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Reply-to address.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Public URL of the platform, linked from built-in templates.
    #[serde(default = "default_platform_url")]
    pub platform_url: String,
    /// Timeout for a single provider call, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Override for the provider API base URL (testing, regional endpoints).
    #[serde(default)]
    pub api_base_url: Option<String>,
}

impl MailConfig {
    /// Timeout for a single provider call.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Send caps shared by all workers.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Maximum sends per minute.
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    /// Maximum sends per hour.
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound for any retry delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Minimum delay after the provider throttled us, in seconds.
    #[serde(default = "default_throttle_delay_secs")]
    pub throttle_delay_secs: u64,
    /// How many times a job may be pushed back without consuming an attempt.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            throttle_delay_secs: default_throttle_delay_secs(),
            max_deferrals: default_max_deferrals(),
        }
    }
}

/// Worker pool and queue maintenance settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long a claim stays owned before it may be reaped, in seconds.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Idle poll interval for workers, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long terminal jobs are retained, in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Interval between stale-claim sweeps, in seconds.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Interval between retention cleanups, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            retention_days: default_retention_days(),
            reap_interval_secs: default_reap_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

fn default_from_name() -> String {
    "Scholar".to_string()
}

fn default_platform_url() -> String {
    "http://localhost:3000".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_per_minute() -> u32 {
    600
}

const fn default_per_hour() -> u32 {
    20_000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_secs() -> u64 {
    30
}

const fn default_max_delay_secs() -> u64 {
    3600
}

const fn default_throttle_delay_secs() -> u64 {
    120
}

const fn default_max_deferrals() -> u32 {
    20
}

const fn default_workers() -> usize {
    4
}

const fn default_visibility_timeout_secs() -> u64 {
    300
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_retention_days() -> u32 {
    14
}

const fn default_reap_interval_secs() -> u64 {
    60
}

const fn default_cleanup_interval_secs() -> u64 {
    3600
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_redis_prefix() -> String {
    "scholar".to_string()
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `SCHOLAR_ENV`)
    /// 3. Environment variables with `SCHOLAR_` prefix, `__` between sections
    ///    (e.g. `SCHOLAR_MAIL__PROVIDER=ses`)
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("SCHOLAR_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(environment())
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        config.try_deserialize()
    }

    /// Parse configuration from a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("SCHOLAR")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [mail]
        provider = "sendgrid"
        sendgrid_api_key = "SG.abc.def"
        from_address = "noreply@scholar.test"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.mail.provider, "sendgrid");
        assert_eq!(config.mail.from_name, "Scholar");
        assert_eq!(config.mail.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limit.per_minute, 600);
        assert_eq!(config.queue.workers, 4);
        assert!(config.database.is_none());
        assert!(config.redis.is_none());
    }

    #[test]
    fn test_sections_override_defaults() {
        let toml = format!(
            "{MINIMAL}
            [queue]
            workers = 8
            visibility_timeout_secs = 120

            [retry]
            max_attempts = 5

            [redis]
            url = \"redis://localhost:6379\"
            "
        );
        let config = Config::from_toml_str(&toml).unwrap();

        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.visibility_timeout_secs, 120);
        assert_eq!(config.queue.retention_days, 14);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_secs, 30);
        assert_eq!(config.redis.unwrap().prefix, "scholar");
    }

    #[test]
    fn test_missing_mail_section_is_an_error() {
        assert!(Config::from_toml_str("[queue]\nworkers = 2\n").is_err());
    }
}
