//! Concurrent scraper orchestration.
//!
//! A run drives every scraper through `pending → running → {succeeded,
//! failed, timed_out, skipped}` with at most `max_concurrent` scrapes in
//! flight, then merges the valid records into the store:
//!
//! - unknown identity: new, bulk-inserted once
//! - known identity, same fingerprint: nothing to do
//! - known identity, different fingerprint: updated in place
//!
//! Failures stay attributed to their scraper. Only `fail_fast` lets one
//! escape, and then the remaining scrapes are dropped before anything is
//! merged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{AppError, Result};
use crate::models::{DeprecationRecord, IdentityKey, OrchestratorConfig, ProviderStatus};
use crate::pipeline::{HealthMonitor, RetryPolicy};
use crate::services::Scraper;
use crate::storage::DeprecationStore;

/// Terminal state of one scraper task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Succeeded,
    Failed,
    TimedOut,
    /// Refused by the health monitor's circuit breaker
    Skipped,
}

/// Per-scraper line of a run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ScraperReport {
    pub name: String,
    pub state: TaskState,
    pub records: usize,
    pub rejected: usize,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Summary of one orchestration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorResult {
    pub total_scrapers: usize,
    pub successful_scrapers: usize,
    pub failed_scrapers: usize,
    /// Valid records returned by successful scrapers, before deduplication
    pub total_records: usize,
    pub new_records: usize,
    pub updated_records: usize,
    pub execution_time: Duration,
    /// One entry per failed scraper, in scraper order, plus merge failures
    pub errors: Vec<String>,
    /// Records dropped by validation
    pub record_errors: Vec<String>,
    pub provider_statuses: Vec<ProviderStatus>,
    pub reports: Vec<ScraperReport>,
}

impl OrchestratorResult {
    /// Share of scrapers that succeeded; 0.0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.total_scrapers == 0 {
            0.0
        } else {
            self.successful_scrapers as f64 / self.total_scrapers as f64
        }
    }

    /// Every requested scraper failed.
    pub fn all_failed(&self) -> bool {
        self.total_scrapers > 0 && self.successful_scrapers == 0
    }
}

enum TaskOutcome {
    Succeeded {
        records: Vec<DeprecationRecord>,
        rejected: Vec<String>,
    },
    Failed {
        state: TaskState,
        error: AppError,
        rejected: Vec<String>,
    },
}

struct FinishedTask {
    name: String,
    elapsed: Duration,
    outcome: TaskOutcome,
}

#[derive(Default)]
struct MergeCounts {
    new_records: usize,
    updated_records: usize,
}

/// Runs scrapers and merges their output into a [`DeprecationStore`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    retry: RetryPolicy,
    store: Arc<dyn DeprecationStore>,
    health: Option<Arc<HealthMonitor>>,
    locks: DashMap<IdentityKey, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, store: Arc<dyn DeprecationStore>) -> Self {
        Self {
            config,
            retry: RetryPolicy::default(),
            store,
            health: None,
            locks: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record outcomes in `health` and skip providers whose circuit is open.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run all scrapers and merge their records.
    ///
    /// Returns `Err` for a timeout that does not fit a `Duration`, and otherwise
    /// only under `fail_fast`, with the first failure observed.
    pub async fn run(&self, scrapers: &[Arc<dyn Scraper>]) -> Result<OrchestratorResult> {
        let started = Instant::now();
        if scrapers.is_empty() {
            log::info!("No scrapers to run");
            return Ok(OrchestratorResult {
                execution_time: started.elapsed(),
                ..OrchestratorResult::default()
            });
        }

        let timeout = self.config.timeout()?;
        let concurrency = self.config.max_concurrent.max(1);
        log::info!(
            "Running {} scrapers (max {} concurrent, timeout {:?})",
            scrapers.len(),
            concurrency,
            timeout
        );

        let mut tasks = stream::iter(scrapers.iter().enumerate())
            .map(|(index, scraper)| async move {
                (index, self.run_one(scraper.as_ref(), timeout).await)
            })
            .buffer_unordered(concurrency);

        let mut finished = Vec::with_capacity(scrapers.len());
        while let Some((index, task)) = tasks.next().await {
            if self.config.fail_fast {
                if let TaskOutcome::Failed { error, .. } = task.outcome {
                    // Returning drops the stream, cancelling every scrape still in flight.
                    log::error!("{}: aborting run (fail_fast): {error}", task.name);
                    return Err(error);
                }
            }
            finished.push((index, task));
        }
        drop(tasks);
        finished.sort_by_key(|(index, _)| *index);

        let mut result = OrchestratorResult {
            total_scrapers: scrapers.len(),
            ..OrchestratorResult::default()
        };
        let mut collected = Vec::new();

        for (_, task) in finished {
            let (report, status) = match task.outcome {
                TaskOutcome::Succeeded { records, rejected } => {
                    result.successful_scrapers += 1;
                    result.total_records += records.len();
                    let report = ScraperReport {
                        name: task.name.clone(),
                        state: TaskState::Succeeded,
                        records: records.len(),
                        rejected: rejected.len(),
                        duration: task.elapsed,
                        error: None,
                    };
                    result.record_errors.extend(rejected);
                    collected.extend(records);
                    (report, ProviderStatus::healthy(&task.name))
                }
                TaskOutcome::Failed {
                    state,
                    error,
                    rejected,
                } => {
                    result.failed_scrapers += 1;
                    let message = describe_failure(&task.name, &error);
                    result.errors.push(message.clone());
                    let report = ScraperReport {
                        name: task.name.clone(),
                        state,
                        records: 0,
                        rejected: rejected.len(),
                        duration: task.elapsed,
                        error: Some(message.clone()),
                    };
                    result.record_errors.extend(rejected);
                    (report, ProviderStatus::failed(&task.name, message))
                }
            };
            result.reports.push(report);
            result.provider_statuses.push(status);
        }

        match self.merge(collected).await {
            Ok(counts) => {
                result.new_records = counts.new_records;
                result.updated_records = counts.updated_records;
            }
            Err(e) if self.config.fail_fast => return Err(e),
            Err(e) => {
                log::error!("Merging scraped records failed: {e}");
                result.errors.push(format!("Merge failed: {e}"));
            }
        }

        result.execution_time = started.elapsed();
        log::info!(
            "Run complete in {:?}: {}/{} scrapers succeeded, {} new, {} updated",
            result.execution_time,
            result.successful_scrapers,
            result.total_scrapers,
            result.new_records,
            result.updated_records
        );
        Ok(result)
    }

    async fn run_one(&self, scraper: &dyn Scraper, timeout: Duration) -> FinishedTask {
        let name = scraper.name().to_string();
        let started = Instant::now();

        if let Some(health) = &self.health {
            if !health.is_recoverable(&name).await {
                log::warn!("{name}: circuit open, skipping");
                return FinishedTask {
                    outcome: TaskOutcome::Failed {
                        state: TaskState::Skipped,
                        error: AppError::CircuitOpen {
                            provider: name.clone(),
                        },
                        rejected: Vec::new(),
                    },
                    elapsed: started.elapsed(),
                    name,
                };
            }
        }

        log::debug!("{name}: scraping");
        let outcome = self.scrape_and_validate(scraper, &name, timeout).await;
        let elapsed = started.elapsed();

        if let Some(health) = &self.health {
            match &outcome {
                TaskOutcome::Succeeded { .. } => health.record_success(&name, elapsed).await,
                TaskOutcome::Failed { error, .. } => {
                    health.record_failure(&name, error, elapsed).await
                }
            }
        }

        match &outcome {
            TaskOutcome::Succeeded { records, rejected } => log::info!(
                "{name}: {} records ({} rejected) in {elapsed:?}",
                records.len(),
                rejected.len()
            ),
            TaskOutcome::Failed { error, .. } => log::warn!("{name}: {error}"),
        }

        FinishedTask {
            name,
            elapsed,
            outcome,
        }
    }

    async fn scrape_and_validate(
        &self,
        scraper: &dyn Scraper,
        name: &str,
        timeout: Duration,
    ) -> TaskOutcome {
        let policy = if self.config.retry_failed {
            self.retry.clone()
        } else {
            RetryPolicy::none()
        };

        let attempt = policy.run(name, || scraper.scrape());
        let raw = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(error)) => {
                return TaskOutcome::Failed {
                    state: TaskState::Failed,
                    error,
                    rejected: Vec::new(),
                };
            }
            Err(_) => {
                return TaskOutcome::Failed {
                    state: TaskState::TimedOut,
                    error: AppError::Timeout {
                        scraper: name.to_string(),
                        seconds: self.config.timeout_secs,
                    },
                    rejected: Vec::new(),
                };
            }
        };

        let scraped_at = Utc::now();
        let returned = raw.len();
        let mut records = Vec::with_capacity(returned);
        let mut rejected = Vec::new();
        for item in raw {
            let label = format!(
                "{}/{}",
                item.provider.as_deref().unwrap_or("?"),
                item.model.as_deref().unwrap_or("?")
            );
            match DeprecationRecord::try_from_raw(item, scraped_at) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("{name}: dropping {label}: {e}");
                    rejected.push(format!("{name}: {label}: {e}"));
                }
            }
        }

        if returned > 0 && records.is_empty() {
            return TaskOutcome::Failed {
                state: TaskState::Failed,
                error: AppError::scrape(name, format!("all {returned} records failed validation")),
                rejected,
            };
        }
        TaskOutcome::Succeeded { records, rejected }
    }

    /// Merge records under per-identity locks.
    ///
    /// Locks are taken in key order so concurrent merges cannot deadlock.
    async fn merge(&self, records: Vec<DeprecationRecord>) -> Result<MergeCounts> {
        if records.is_empty() {
            return Ok(MergeCounts::default());
        }

        let mut latest: BTreeMap<IdentityKey, DeprecationRecord> = BTreeMap::new();
        for record in records {
            latest.insert(record.identity(), record);
        }

        let mut guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(latest.len());
        for key in latest.keys() {
            let lock = self.locks.entry(key.clone()).or_default().value().clone();
            guards.push(lock.lock_owned().await);
        }

        let counts = self.merge_locked(latest).await;

        drop(guards);
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        counts
    }

    async fn merge_locked(
        &self,
        latest: BTreeMap<IdentityKey, DeprecationRecord>,
    ) -> Result<MergeCounts> {
        let existing: HashMap<IdentityKey, DeprecationRecord> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|r| (r.identity(), r))
            .collect();

        let mut counts = MergeCounts::default();
        let mut fresh = Vec::new();
        for (key, record) in latest {
            match existing.get(&key) {
                None => fresh.push(record),
                Some(current) if current.same_content(&record) => {}
                Some(_) => {
                    if self.store.update(&record).await? {
                        log::debug!("Updated {key}");
                        counts.updated_records += 1;
                    }
                }
            }
        }

        if !fresh.is_empty() {
            counts.new_records = self.store.store(&fresh).await?;
        }
        Ok(counts)
    }
}

/// Human-readable error line naming the scraper.
fn describe_failure(name: &str, error: &AppError) -> String {
    match error {
        AppError::Timeout { .. } | AppError::CircuitOpen { .. } => error.to_string(),
        AppError::Scrape { scraper, .. } if scraper == name => error.to_string(),
        other => format!("Scraper {name} failed: {other}"),
    }
}
