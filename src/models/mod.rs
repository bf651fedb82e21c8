// src/models/mod.rs

//! Domain models for the deprecation watcher.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod deprecation;
mod status;

// Re-export all public types
pub use config::{
    CacheConfig, Config, HealthConfig, HttpConfig, OrchestratorConfig, PathsConfig,
    ProviderConfig, RetryConfig,
};
pub use deprecation::{DeprecationRecord, IdentityKey, RawDeprecation};
pub use status::ProviderStatus;
