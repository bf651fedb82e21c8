//! Cache layers for scraped data and HTTP responses.
//!
//! ## Layers
//!
//! ```text
//! CacheManager      get_with_fallback, provider/date snapshots
//! HttpCache         ETag / Last-Modified / max-age, stale-on-error
//! CacheStorage      byte storage with TTL + metadata
//!   ├── FileSystemStorage
//!   └── CiCacheStorage (FileSystemStorage + cache-state.json manifest)
//! ```

pub mod ci;
pub mod filesystem;
pub mod http;
pub mod manager;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::{sanitize, sha256_hex};

// Re-export for convenience
pub use ci::{CacheActionKeys, CacheInfo, CiCacheStorage};
pub use filesystem::FileSystemStorage;
pub use http::HttpCache;
pub use manager::CacheManager;

/// Metadata stored next to every cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheMetadata {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Trait for cache storage backends.
///
/// Implementations must tolerate concurrent calls: writes to different keys
/// never interfere and concurrent writes to one key end with one complete value.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Payload for `key`, or `None` when missing, expired or unreadable.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value`, replacing any previous entry. No `ttl` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Remove payload and metadata; `Ok(false)` when nothing was stored.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Same expiry semantics as [`CacheStorage::get`].
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry, returning how many were removed.
    async fn clear(&self) -> Result<usize>;

    async fn get_metadata(&self, key: &str) -> Result<Option<CacheMetadata>>;

    /// Live keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    fn generate_key(&self, prefix: &str, identifier: &str, date: Option<NaiveDate>) -> String {
        generate_key(prefix, identifier, date)
    }
}

/// Compose a cache key as `prefix:identifier[:YYYY-MM-DD]`.
///
/// Identifiers containing anything outside `[A-Za-z0-9._-]` are sanitized and
/// suffixed with a short digest of the original, so distinct identifiers
/// never map to the same key.
pub fn generate_key(prefix: &str, identifier: &str, date: Option<NaiveDate>) -> String {
    let safe = sanitize(identifier);
    let identifier = if safe == identifier {
        safe
    } else {
        format!("{safe}-{}", &sha256_hex(identifier)[..12])
    };
    match date {
        Some(date) => format!("{prefix}:{identifier}:{}", date.format("%Y-%m-%d")),
        None => format!("{prefix}:{identifier}"),
    }
}

/// The backend chosen for this process.
#[derive(Clone)]
pub enum CacheBackend {
    FileSystem(FileSystemStorage),
    Ci(CiCacheStorage),
}

impl CacheBackend {
    pub fn shared(&self) -> Arc<dyn CacheStorage> {
        match self {
            Self::FileSystem(storage) => Arc::new(storage.clone()),
            Self::Ci(storage) => Arc::new(storage.clone()),
        }
    }

    pub async fn info(&self) -> Result<CacheInfo> {
        match self {
            Self::FileSystem(storage) => {
                let (entries, total_bytes) = storage.stats().await?;
                Ok(CacheInfo {
                    entries,
                    total_bytes,
                    directory: storage.root().to_path_buf(),
                    is_ci: false,
                    last_updated: None,
                })
            }
            Self::Ci(storage) => storage.cache_info().await,
        }
    }
}
