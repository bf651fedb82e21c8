// src/error.rs

//! Unified error handling for scraping, caching and storage.

use std::fmt;

use thiserror::Error;

/// Result type alias for deprecation-watch operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error that is not a plain connectivity failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Connection refused, reset, DNS failure or request timeout
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Server answered with a status we cannot use
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Scraper reported a failure
    #[error("Scraper {scraper} failed: {message}")]
    Scrape { scraper: String, message: String },

    /// Scraper exceeded its deadline
    #[error("Scraper {scraper} timed out after {seconds}s")]
    Timeout { scraper: String, seconds: f64 },

    /// Provider refused by the health monitor
    #[error("Circuit breaker open for {provider}: too many consecutive failures")]
    CircuitOpen { provider: String },

    /// Cache layer error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Persistent store error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a scrape error attributed to a scraper.
    pub fn scrape(scraper: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Scrape {
            scraper: scraper.into(),
            message: message.to_string(),
        }
    }

    /// Create a network error for a URL.
    pub fn network(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl fmt::Display) -> Self {
        Self::Cache(message.to_string())
    }

    /// Create a storage error.
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Connectivity failure: the only case where stale cached data replaces a fetch.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Scraper deadline exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Worth retrying: network failures, timeouts, throttling and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout { .. } => true,
            other => other.is_network(),
        }
    }
}
