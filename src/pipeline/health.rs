//! Provider health tracking and recovery strategies.
//!
//! State is in-memory and per process. History is bounded: at most
//! `history_limit` checks per provider, none older than `retention_days`,
//! and at most `history_limit` recovery attempts overall.
//!
//! Once a provider reaches `failure_ceiling` consecutive failures it is no
//! longer recoverable: the orchestrator skips it and the circuit-breaker
//! strategy refuses to call it until a success resets the counter.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::CacheManager;
use crate::error::{AppError, Result};
use crate::models::HealthConfig;
use crate::pipeline::RetryPolicy;
use crate::utils::http::HttpTransport;

/// Health of a provider as of its latest check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Reachable but answering with a client error (4xx)
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Status implied by a failure.
    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::HttpStatus { status, .. } if (400..500).contains(status) && *status != 429 => {
                Self::Degraded
            }
            _ => Self::Unhealthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One observation of a provider.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub response_time: Option<Duration>,
    pub error_message: Option<String>,
}

/// Rolling health of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub checks: VecDeque<HealthCheck>,
}

impl ProviderHealth {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            checks: VecDeque::new(),
        }
    }

    fn record(&mut self, check: HealthCheck, config: &HealthConfig) {
        if check.status == HealthStatus::Healthy {
            self.consecutive_failures = 0;
            self.last_success = Some(check.timestamp);
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(check.timestamp);
        }
        self.status = check.status;
        self.checks.push_back(check);

        while self.checks.len() > config.history_limit {
            self.checks.pop_front();
        }
        // A retention reaching past chrono's range keeps everything
        let Some(cutoff) = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(config.retention_days)))
        else {
            return;
        };
        while self.checks.front().is_some_and(|c| c.timestamp < cutoff) {
            self.checks.pop_front();
        }
    }

    fn recent(&self, window: usize) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().skip(self.checks.len().saturating_sub(window))
    }

    /// Share of healthy checks among the last `window`; 1.0 with no checks.
    pub fn success_rate(&self, window: usize) -> f64 {
        let (total, ok) = self.recent(window).fold((0usize, 0usize), |(total, ok), c| {
            (total + 1, ok + usize::from(c.status == HealthStatus::Healthy))
        });
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    pub fn average_response_time(&self, window: usize) -> Option<Duration> {
        let times: Vec<Duration> = self.recent(window).filter_map(|c| c.response_time).collect();
        if times.is_empty() {
            return None;
        }
        let total: Duration = times.iter().sum();
        Some(total / times.len() as u32)
    }

    pub fn is_recoverable(&self, ceiling: u32) -> bool {
        self.consecutive_failures < ceiling
    }
}

/// How to try a failing provider again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Call again under the shared retry policy
    Retry,
    /// Wait `min(2^failures, cap)` seconds, then call
    ExponentialBackoff,
    /// Refuse while the provider is not recoverable, otherwise call
    CircuitBreaker,
    /// Serve the latest cached snapshot instead of calling
    Fallback,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::ExponentialBackoff => "exponential_backoff",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration: Duration,
}

#[derive(Default)]
struct MonitorState {
    providers: HashMap<String, ProviderHealth>,
    recoveries: VecDeque<RecoveryAttempt>,
}

/// Tracks provider health across one process.
pub struct HealthMonitor {
    config: HealthConfig,
    retry: RetryPolicy,
    cache: Option<CacheManager>,
    transport: Option<Arc<dyn HttpTransport>>,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            retry,
            cache: None,
            transport: None,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Enable the fallback strategy.
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Enable [`HealthMonitor::check_provider`].
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    async fn record(&self, provider: &str, check: HealthCheck) {
        let mut state = self.state.lock().await;
        let health = state
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(provider));
        health.record(check, &self.config);
        if health.consecutive_failures == self.config.failure_ceiling {
            log::error!(
                "{provider}: {} consecutive failures, circuit open",
                health.consecutive_failures
            );
        }
    }

    pub async fn record_success(&self, provider: &str, response_time: Duration) {
        self.record(
            provider,
            HealthCheck {
                timestamp: Utc::now(),
                status: HealthStatus::Healthy,
                response_time: Some(response_time),
                error_message: None,
            },
        )
        .await;
    }

    pub async fn record_failure(&self, provider: &str, error: &AppError, response_time: Duration) {
        self.record(
            provider,
            HealthCheck {
                timestamp: Utc::now(),
                status: HealthStatus::from_error(error),
                response_time: Some(response_time),
                error_message: Some(error.to_string()),
            },
        )
        .await;
    }

    /// Providers never seen are recoverable.
    pub async fn is_recoverable(&self, provider: &str) -> bool {
        let state = self.state.lock().await;
        state
            .providers
            .get(provider)
            .is_none_or(|h| h.is_recoverable(self.config.failure_ceiling))
    }

    pub async fn status(&self, provider: &str) -> HealthStatus {
        let state = self.state.lock().await;
        state
            .providers
            .get(provider)
            .map_or(HealthStatus::Unknown, |h| h.status)
    }

    pub async fn provider_health(&self, provider: &str) -> Option<ProviderHealth> {
        self.state.lock().await.providers.get(provider).cloned()
    }

    /// Providers whose latest check was unhealthy or degraded, sorted.
    pub async fn unhealthy_providers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .providers
            .values()
            .filter(|h| matches!(h.status, HealthStatus::Unhealthy | HealthStatus::Degraded))
            .map(|h| h.provider.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn recovery_history(&self) -> Vec<RecoveryAttempt> {
        self.state.lock().await.recoveries.iter().cloned().collect()
    }

    /// Probe `url` and record the result: 200 is healthy, 4xx degraded,
    /// anything else (or no answer) unhealthy.
    pub async fn check_provider(&self, provider: &str, url: &str) -> Result<HealthCheck> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| AppError::config("health monitor has no HTTP transport"))?;

        let started = Instant::now();
        let result = transport.get(url, &[]).await;
        let response_time = started.elapsed();

        let (status, error_message) = match result {
            Ok(response) if response.status == 200 => (HealthStatus::Healthy, None),
            Ok(response) if (400..500).contains(&response.status) => {
                (HealthStatus::Degraded, Some(format!("HTTP {}", response.status)))
            }
            Ok(response) => (HealthStatus::Unhealthy, Some(format!("HTTP {}", response.status))),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };
        let check = HealthCheck {
            timestamp: Utc::now(),
            status,
            response_time: Some(response_time),
            error_message,
        };
        self.record(provider, check.clone()).await;
        Ok(check)
    }

    /// Backoff before the next attempt on `provider`.
    pub async fn backoff_delay(&self, provider: &str) -> Duration {
        let failures = self
            .provider_health(provider)
            .await
            .map_or(0, |h| h.consecutive_failures);
        RetryPolicy::exponential_delay(failures, Duration::from_secs(self.config.max_backoff_secs))
    }

    /// Try `provider` again with `strategy`. `op` performs the real call; its
    /// outcome is recorded as a health check. The fallback strategy never
    /// calls `op` and serves the newest cached snapshot instead.
    pub async fn recover<T, F, Fut>(
        &self,
        provider: &str,
        strategy: RecoveryStrategy,
        mut op: F,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match strategy {
            RecoveryStrategy::Retry => self.observe(provider, self.retry.run(provider, &mut op)).await,
            RecoveryStrategy::ExponentialBackoff => {
                let delay = self.backoff_delay(provider).await;
                log::info!("{provider}: backing off {delay:?} before retry");
                tokio::time::sleep(delay).await;
                self.observe(provider, op()).await
            }
            RecoveryStrategy::CircuitBreaker => {
                if self.is_recoverable(provider).await {
                    self.observe(provider, op()).await
                } else {
                    Err(AppError::CircuitOpen {
                        provider: provider.to_string(),
                    })
                }
            }
            RecoveryStrategy::Fallback => self.fallback(provider).await,
        };

        self.push_recovery(RecoveryAttempt {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            strategy,
            success: result.is_ok(),
            error_message: result.as_ref().err().map(ToString::to_string),
            duration: started.elapsed(),
        })
        .await;
        result
    }

    async fn observe<T>(&self, provider: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = call.await;
        match &result {
            Ok(_) => self.record_success(provider, started.elapsed()).await,
            Err(e) => self.record_failure(provider, e, started.elapsed()).await,
        }
        result
    }

    async fn fallback<T: DeserializeOwned>(&self, provider: &str) -> Result<T> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| AppError::config("fallback recovery needs a cache manager"))?;
        cache
            .get_deprecation_data(provider, None, cache.snapshot_max_age_days())
            .await
            .ok_or_else(|| AppError::cache(format!("no cached snapshot for {provider}")))
    }

    async fn push_recovery(&self, attempt: RecoveryAttempt) {
        let mut state = self.state.lock().await;
        state.recoveries.push_back(attempt);
        while state.recoveries.len() > self.config.history_limit {
            state.recoveries.pop_front();
        }
    }

    /// Markdown summary of every tracked provider and recent recoveries.
    pub async fn health_report(&self) -> String {
        let state = self.state.lock().await;
        let window = self.config.success_window;

        let mut lines = vec![
            "# Provider Health Report".to_string(),
            String::new(),
            format!("**Generated:** {}", Utc::now().to_rfc3339()),
            String::new(),
            "## Provider Status".to_string(),
        ];

        let mut providers: Vec<&ProviderHealth> = state.providers.values().collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));
        for health in providers {
            lines.push(String::new());
            lines.push(format!("### {}", health.provider));
            lines.push(format!("- **Status:** {}", health.status));
            lines.push(format!(
                "- **Consecutive Failures:** {}",
                health.consecutive_failures
            ));
            lines.push(format!(
                "- **Success Rate:** {:.1}%",
                health.success_rate(window) * 100.0
            ));
            if let Some(avg) = health.average_response_time(window) {
                lines.push(format!("- **Avg Response Time:** {}ms", avg.as_millis()));
            }
            if let Some(at) = health.last_success {
                lines.push(format!("- **Last Success:** {}", at.to_rfc3339()));
            }
            if let Some(at) = health.last_failure {
                lines.push(format!("- **Last Failure:** {}", at.to_rfc3339()));
            }
            if !health.is_recoverable(self.config.failure_ceiling) {
                lines.push("- **Circuit:** OPEN".to_string());
            }
        }

        let recent: Vec<&RecoveryAttempt> = state.recoveries.iter().rev().take(10).collect();
        if !recent.is_empty() {
            lines.push(String::new());
            lines.push("## Recent Recovery Attempts".to_string());
            for attempt in recent.into_iter().rev() {
                let mark = if attempt.success { "✓" } else { "✗" };
                lines.push(format!(
                    "- {mark} {} ({}) @ {}",
                    attempt.provider,
                    attempt.strategy,
                    attempt.timestamp.to_rfc3339()
                ));
                if let Some(error) = &attempt.error_message {
                    lines.push(format!("  Error: {error}"));
                }
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cache::FileSystemStorage;
    use crate::utils::http::testing::FakeTransport;
    use tempfile::TempDir;

    fn monitor(ceiling: u32, history_limit: usize) -> HealthMonitor {
        let config = HealthConfig {
            failure_ceiling: ceiling,
            history_limit,
            ..HealthConfig::default()
        };
        HealthMonitor::new(
            config,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn boom() -> AppError {
        AppError::scrape("openai", "boom")
    }

    #[tokio::test]
    async fn test_consecutive_failures_open_circuit() {
        let health = monitor(3, 100);
        for _ in 0..2 {
            health.record_failure("openai", &boom(), Duration::from_millis(5)).await;
        }
        assert!(health.is_recoverable("openai").await);

        health.record_failure("openai", &boom(), Duration::from_millis(5)).await;
        assert!(!health.is_recoverable("openai").await);
        assert_eq!(health.unhealthy_providers().await, vec!["openai"]);

        health.record_success("openai", Duration::from_millis(5)).await;
        assert!(health.is_recoverable("openai").await);
        assert_eq!(health.status("openai").await, HealthStatus::Healthy);
        assert!(health.is_recoverable("never-seen").await);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let health = monitor(1000, 5);
        for i in 0..12 {
            if i % 2 == 0 {
                health.record_success("cohere", Duration::from_millis(10)).await;
            } else {
                health.record_failure("cohere", &boom(), Duration::from_millis(30)).await;
            }
        }
        let snapshot = health.provider_health("cohere").await.unwrap();
        assert_eq!(snapshot.checks.len(), 5);
        // Last five: fail, ok, fail, ok, fail
        assert!((snapshot.success_rate(20) - 0.4).abs() < 1e-9);
        assert_eq!(snapshot.average_response_time(2), Some(Duration::from_millis(20)));
    }

    fn check_at(timestamp: DateTime<Utc>) -> HealthCheck {
        HealthCheck {
            timestamp,
            status: HealthStatus::Healthy,
            response_time: None,
            error_message: None,
        }
    }

    #[test]
    fn test_old_checks_are_pruned() {
        let config = HealthConfig {
            retention_days: 7,
            ..HealthConfig::default()
        };
        let mut health = ProviderHealth::new("openai");
        let now = Utc::now();
        health.record(check_at(now - chrono::Duration::days(10)), &config);
        health.record(check_at(now - chrono::Duration::days(8)), &config);
        health.record(check_at(now - chrono::Duration::days(1)), &config);
        health.record(check_at(now), &config);

        assert_eq!(health.checks.len(), 2);
        assert!(health.checks.iter().all(|c| c.timestamp >= now - chrono::Duration::days(7)));
    }

    #[test]
    fn test_unbounded_retention_keeps_checks() {
        let config = HealthConfig {
            retention_days: u32::MAX,
            ..HealthConfig::default()
        };
        let mut health = ProviderHealth::new("openai");
        health.record(check_at(Utc::now() - chrono::Duration::days(400)), &config);
        health.record(check_at(Utc::now()), &config);
        assert_eq!(health.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_history_is_bounded() {
        let health = monitor(1000, 3);
        for i in 0..5u32 {
            let result: Result<u32> = health
                .recover("openai", RecoveryStrategy::CircuitBreaker, || async move { Ok(i) })
                .await;
            assert_eq!(result.unwrap(), i);
        }

        let history = health.recovery_history().await;
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|a| a.success && a.strategy == RecoveryStrategy::CircuitBreaker));
    }

    #[test]
    fn test_degraded_for_client_errors() {
        let not_found = AppError::HttpStatus {
            url: "u".into(),
            status: 404,
        };
        let throttled = AppError::HttpStatus {
            url: "u".into(),
            status: 429,
        };
        assert_eq!(HealthStatus::from_error(&not_found), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_error(&throttled), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_error(&boom()), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_circuit_breaker_strategy_refuses() {
        let health = monitor(1, 100);
        health.record_failure("openai", &boom(), Duration::ZERO).await;

        let calls = &AtomicU32::new(0);
        let result: Result<u32> = health
            .recover("openai", RecoveryStrategy::CircuitBreaker, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(AppError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let history = health.recovery_history().await;
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_retry_strategy_records_success() {
        let health = monitor(10, 100);
        let calls = &AtomicU32::new(0);
        let result: Result<u32> = health
            .recover("openai", RecoveryStrategy::Retry, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::network("https://x.test", "reset"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(health.status("openai").await, HealthStatus::Healthy);
        assert!(health.recovery_history().await[0].success);
    }

    #[tokio::test]
    async fn test_backoff_delay_grows_with_failures() {
        let health = monitor(100, 100);
        assert_eq!(health.backoff_delay("openai").await, Duration::from_secs(1));
        for _ in 0..3 {
            health.record_failure("openai", &boom(), Duration::ZERO).await;
        }
        assert_eq!(health.backoff_delay("openai").await, Duration::from_secs(8));
        for _ in 0..20 {
            health.record_failure("openai", &boom(), Duration::ZERO).await;
        }
        assert_eq!(health.backoff_delay("openai").await, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_fallback_serves_cached_snapshot() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheManager::new(Arc::new(FileSystemStorage::new(tmp.path())));
        cache
            .save_deprecation_data("openai", &vec!["gpt-4-0314".to_string()], None)
            .await;

        let health = monitor(10, 100).with_cache(cache);
        let result: Result<Vec<String>> = health
            .recover("openai", RecoveryStrategy::Fallback, || async {
                Err(AppError::scrape("openai", "should not be called"))
            })
            .await;
        assert_eq!(result.unwrap(), vec!["gpt-4-0314".to_string()]);

        let missing: Result<Vec<String>> = health
            .recover("cohere", RecoveryStrategy::Fallback, || async { Ok(Vec::new()) })
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_check_provider_statuses() {
        let transport = Arc::new(FakeTransport::default());
        transport.ok("https://ok.test", "", &[]);
        transport.status("https://gone.test", 404);
        transport.network_error("https://down.test");

        let health = monitor(10, 100).with_transport(transport);
        let ok = health.check_provider("ok", "https://ok.test").await.unwrap();
        let gone = health.check_provider("gone", "https://gone.test").await.unwrap();
        let down = health.check_provider("down", "https://down.test").await.unwrap();

        assert_eq!(ok.status, HealthStatus::Healthy);
        assert_eq!(gone.status, HealthStatus::Degraded);
        assert_eq!(down.status, HealthStatus::Unhealthy);
        assert_eq!(health.unhealthy_providers().await, vec!["down", "gone"]);
    }

    #[tokio::test]
    async fn test_health_report_mentions_providers() {
        let health = monitor(10, 100);
        health.record_success("openai", Duration::from_millis(120)).await;
        health.record_failure("cohere", &boom(), Duration::from_millis(40)).await;

        let report = health.health_report().await;
        assert!(report.starts_with("# Provider Health Report"));
        assert!(report.contains("### cohere"));
        assert!(report.contains("- **Status:** UNHEALTHY"));
        assert!(report.contains("- **Avg Response Time:** 120ms"));
    }
}
