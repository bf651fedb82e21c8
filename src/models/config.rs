//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Ten years; keeps every derived deadline within `chrono`'s range.
const MAX_RETENTION_DAYS: u32 = 3650;
const MAX_TTL_SECS: u64 = MAX_RETENTION_DAYS as u64 * 86_400;
const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scraper scheduling behavior
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Shared retry/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Cache locations and freshness
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Provider health tracking
    #[serde(default)]
    pub health: HealthConfig,

    /// Output locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Provider endpoints for the JSON feed scraper
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Apply environment variable overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(n) = var("MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.orchestrator.max_concurrent = n;
        }
        if let Some(secs) = var("SCRAPER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.orchestrator.timeout_secs = secs;
        }
        if let Some(flag) = var("FAIL_FAST") {
            self.orchestrator.fail_fast = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = var("CACHE_DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent == 0 {
            return Err(AppError::validation("orchestrator.max_concurrent must be > 0"));
        }
        let timeout = self.orchestrator.timeout_secs;
        if !(timeout.is_finite() && timeout > 0.0 && timeout <= MAX_TIMEOUT_SECS) {
            return Err(AppError::validation(format!(
                "orchestrator.timeout_secs must be in (0, {MAX_TIMEOUT_SECS}]"
            )));
        }
        if self.retry.retries == 0 {
            return Err(AppError::validation("retry.retries must be >= 1"));
        }
        if self.cache.ttl_secs == 0 || self.cache.ttl_secs > MAX_TTL_SECS {
            return Err(AppError::validation(format!(
                "cache.ttl_secs must be in 1..={MAX_TTL_SECS}"
            )));
        }
        if self.cache.stale_retention_days > MAX_RETENTION_DAYS
            || self.cache.snapshot_max_age_days > MAX_RETENTION_DAYS
            || self.health.retention_days > MAX_RETENTION_DAYS
        {
            return Err(AppError::validation(format!(
                "retention and snapshot ages must be <= {MAX_RETENTION_DAYS} days"
            )));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.health.history_limit == 0 || self.health.success_window == 0 {
            return Err(AppError::validation(
                "health.history_limit and health.success_window must be > 0",
            ));
        }
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(AppError::validation("provider with empty name"));
            }
            url::Url::parse(&provider.url).map_err(|e| {
                AppError::validation(format!("provider {} url: {e}", provider.name))
            })?;
        }
        Ok(())
    }
}

/// Scraper scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum scrapers in flight at once
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Deadline for a single scraper, retries included
    #[serde(default = "defaults::scraper_timeout")]
    pub timeout_secs: f64,

    /// Retry transient scraper failures with the shared retry policy
    #[serde(default = "defaults::retry_failed")]
    pub retry_failed: bool,

    /// Abort the whole run on the first scraper failure
    #[serde(default)]
    pub fail_fast: bool,
}

impl OrchestratorConfig {
    pub fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout_secs).map_err(|e| {
            AppError::config(format!("orchestrator.timeout_secs {}: {e}", self.timeout_secs))
        })
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            timeout_secs: defaults::scraper_timeout(),
            retry_failed: defaults::retry_failed(),
            fail_fast: false,
        }
    }
}

/// Retry/backoff settings shared by the orchestrator and health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, first one included
    #[serde(default = "defaults::retries")]
    pub retries: u32,

    /// Base delay; attempt `n` waits `backoff_factor_ms * 2^n`
    #[serde(default = "defaults::backoff_factor_ms")]
    pub backoff_factor_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "defaults::max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: defaults::retries(),
            backoff_factor_ms: defaults::backoff_factor_ms(),
            max_backoff_secs: defaults::max_backoff_secs(),
        }
    }
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Key/value cache directory (non-CI runs)
    #[serde(default = "defaults::cache_dir")]
    pub dir: PathBuf,

    /// HTTP response cache directory
    #[serde(default = "defaults::http_cache_dir")]
    pub http_dir: PathBuf,

    /// Freshness window for cached data
    #[serde(default = "defaults::cache_ttl")]
    pub ttl_secs: u64,

    /// How long stale entries are kept for error fallback
    #[serde(default = "defaults::stale_retention_days")]
    pub stale_retention_days: u32,

    /// How far back provider snapshots are searched
    #[serde(default = "defaults::snapshot_max_age_days")]
    pub snapshot_max_age_days: u32,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.stale_retention_days) * 86_400)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: defaults::cache_dir(),
            http_dir: defaults::http_cache_dir(),
            ttl_secs: defaults::cache_ttl(),
            stale_retention_days: defaults::stale_retention_days(),
            snapshot_max_age_days: defaults::snapshot_max_age_days(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::http_timeout(),
        }
    }
}

/// Provider health tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures after which a provider is no longer retried
    #[serde(default = "defaults::failure_ceiling")]
    pub failure_ceiling: u32,

    /// Checks (and recovery attempts) kept per provider
    #[serde(default = "defaults::history_limit")]
    pub history_limit: usize,

    /// Checks older than this are pruned
    #[serde(default = "defaults::retention_days")]
    pub retention_days: u32,

    /// Checks considered for success rate and response time
    #[serde(default = "defaults::success_window")]
    pub success_window: usize,

    /// Cap for exponential recovery backoff
    #[serde(default = "defaults::max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_ceiling: defaults::failure_ceiling(),
            history_limit: defaults::history_limit(),
            retention_days: defaults::retention_days(),
            success_window: defaults::success_window(),
            max_backoff_secs: defaults::max_backoff_secs(),
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding `deprecations.json`
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,

    /// Published feed snapshot
    #[serde(default = "defaults::feed_file")]
    pub feed_file: PathBuf,

    /// Records needing enrichment after the last run
    #[serde(default = "defaults::changed_file")]
    pub changed_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: defaults::data_dir(),
            feed_file: defaults::feed_file(),
            changed_file: defaults::changed_file(),
        }
    }
}

/// A provider endpoint serving deprecations as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
}

mod defaults {
    use std::path::PathBuf;

    // Orchestrator defaults
    pub fn max_concurrent() -> usize {
        5
    }
    pub fn scraper_timeout() -> f64 {
        300.0
    }
    pub fn retry_failed() -> bool {
        true
    }

    // Retry defaults
    pub fn retries() -> u32 {
        3
    }
    pub fn backoff_factor_ms() -> u64 {
        1_000
    }
    pub fn max_backoff_secs() -> u64 {
        300
    }

    // Cache defaults
    pub fn cache_dir() -> PathBuf {
        PathBuf::from(".cache/deprecations")
    }
    pub fn http_cache_dir() -> PathBuf {
        PathBuf::from(".cache/http")
    }
    pub fn cache_ttl() -> u64 {
        23 * 3600
    }
    pub fn stale_retention_days() -> u32 {
        7
    }
    pub fn snapshot_max_age_days() -> u32 {
        7
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "deprecations-rss/1.0".into()
    }
    pub fn http_timeout() -> u64 {
        30
    }

    // Health defaults
    pub fn failure_ceiling() -> u32 {
        10
    }
    pub fn history_limit() -> usize {
        100
    }
    pub fn retention_days() -> u32 {
        7
    }
    pub fn success_window() -> usize {
        20
    }

    // Path defaults
    pub fn data_dir() -> PathBuf {
        PathBuf::from("data")
    }
    pub fn feed_file() -> PathBuf {
        PathBuf::from("data/feed.json")
    }
    pub fn changed_file() -> PathBuf {
        PathBuf::from("data/changed.json")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.orchestrator.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        let mut config = Config::default();
        config.orchestrator.timeout_secs = 1e20;
        assert!(config.validate().is_err());
        assert!(config.orchestrator.timeout().is_err());

        let mut config = Config::default();
        config.cache.ttl_secs = 10_000_000_000_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.stale_retention_days = u32::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.health.retention_days = u32::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_provider_url() {
        let mut config = Config::default();
        config.providers.push(ProviderConfig {
            name: "openai".into(),
            url: "not a url".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [orchestrator]
            max_concurrent = 2

            [[providers]]
            name = "openai"
            url = "https://example.com/openai.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 2);
        assert_eq!(config.orchestrator.timeout_secs, 300.0);
        assert_eq!(config.cache.ttl_secs, 23 * 3600);
        assert_eq!(config.providers.len(), 1);
    }

    #[test]
    fn test_env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("MAX_CONCURRENT", "9"),
            ("SCRAPER_TIMEOUT_SECS", "12.5"),
            ("FAIL_FAST", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.orchestrator.max_concurrent, 9);
        assert_eq!(config.orchestrator.timeout_secs, 12.5);
        assert!(config.orchestrator.fail_fast);
    }
}
