//! Orchestration pipeline.
//!
//! - `orchestrator`: run scrapers concurrently and merge into the store
//! - `retry`: shared retry/backoff policy
//! - `health`: per-provider health and recovery strategies
//! - `changes`: select records changed since the last published feed
//! - `run`: the end-to-end run used by the CLI

pub mod changes;
pub mod health;
pub mod orchestrator;
pub mod retry;
pub mod run;

pub use changes::{ChangeDetector, ChangeSet, detect_changes};
pub use health::{HealthCheck, HealthMonitor, HealthStatus, ProviderHealth, RecoveryAttempt, RecoveryStrategy};
pub use orchestrator::{Orchestrator, OrchestratorResult, ScraperReport, TaskState};
pub use retry::RetryPolicy;
pub use run::{RunReport, build_scrapers, run_pipeline};
