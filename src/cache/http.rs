//! HTTP response cache with conditional requests.
//!
//! Entries live in a [`CacheStorage`] without a backend TTL; freshness is
//! decided here so an expired entry is still around for revalidation and
//! as a fallback when the network is down.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStorage, generate_key};
use crate::error::{AppError, Result};
use crate::utils::http::{HttpResponse, HttpTransport};

/// Freshness window when a response carries no `max-age`.
///
/// Just under a day, so a daily job always gets one revalidation per run.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(23 * 3600);

const KEY_PREFIX: &str = "http";

/// One cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HttpCacheEntry {
    url: String,
    #[serde(with = "base64_bytes")]
    content: Vec<u8>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    max_age: Option<u64>,
    timestamp: DateTime<Utc>,
}

impl HttpCacheEntry {
    fn from_response(url: &str, response: HttpResponse) -> Self {
        let max_age = response.header("cache-control").and_then(parse_max_age);
        Self {
            url: url.to_string(),
            etag: response.header("etag").map(str::to_string),
            last_modified: response.header("last-modified").map(str::to_string),
            max_age,
            timestamp: Utc::now(),
            content: response.body,
        }
    }

    fn is_fresh(&self, default_freshness: Duration, now: DateTime<Utc>) -> bool {
        let ttl = self
            .max_age
            .map(Duration::from_secs)
            .unwrap_or(default_freshness);
        // Negative age (clock moved back) counts as fresh
        let age = (now - self.timestamp).to_std().unwrap_or(Duration::ZERO);
        age < ttl
    }

    fn conditional_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(etag) = &self.etag {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(last_modified) = &self.last_modified {
            headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
        }
        headers
    }
}

static RE_MAX_AGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"max-age=(\d+)").ok());

/// Extract the `max-age` seconds from a `Cache-Control` value.
pub fn parse_max_age(cache_control: &str) -> Option<u64> {
    let re = RE_MAX_AGE.as_ref()?;
    re.captures(cache_control)?.get(1)?.as_str().parse().ok()
}

/// Cache-aware GET on top of an [`HttpTransport`].
pub struct HttpCache {
    storage: Arc<dyn CacheStorage>,
    transport: Arc<dyn HttpTransport>,
    default_freshness: Duration,
}

impl HttpCache {
    pub fn new(storage: Arc<dyn CacheStorage>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            storage,
            transport,
            default_freshness: DEFAULT_FRESHNESS,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.default_freshness = freshness;
        self
    }

    fn key(url: &str) -> String {
        generate_key(KEY_PREFIX, url, None)
    }

    /// Load an entry; unreadable entries are dropped and count as a miss.
    async fn load(&self, key: &str) -> Option<HttpCacheEntry> {
        let bytes = match self.storage.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("HTTP cache read failed for {key}: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Corrupt HTTP cache entry {key}: {e}; removing");
                if let Err(e) = self.storage.delete(key).await {
                    log::warn!("Failed to remove corrupt entry {key}: {e}");
                }
                None
            }
        }
    }

    async fn save(&self, key: &str, entry: &HttpCacheEntry) {
        let result = match serde_json::to_vec(entry) {
            Ok(bytes) => self.storage.set(key, &bytes, None).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            log::warn!("Failed to cache response for {}: {e}", entry.url);
        }
    }

    /// Fetch `url`, serving from cache while fresh.
    ///
    /// Expired entries are revalidated with `If-None-Match` / `If-Modified-Since`.
    /// Network failures fall back to any cached copy, however old; other
    /// non-200/304 statuses are returned as [`AppError::HttpStatus`].
    pub async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>> {
        let key = Self::key(url);
        let cached = self.load(&key).await;

        let mut request_headers = headers.to_vec();
        if let Some(entry) = &cached {
            if entry.is_fresh(self.default_freshness, Utc::now()) {
                log::debug!("HTTP cache hit: {url}");
                return Ok(entry.content.clone());
            }
            request_headers.extend(entry.conditional_headers());
        }

        match self.transport.get(url, &request_headers).await {
            Ok(response) if response.status == 304 => match cached {
                Some(mut entry) => {
                    log::debug!("Not modified: {url}");
                    entry.timestamp = Utc::now();
                    self.save(&key, &entry).await;
                    Ok(entry.content)
                }
                None => Err(AppError::HttpStatus {
                    url: url.to_string(),
                    status: 304,
                }),
            },
            Ok(response) if response.status == 200 => {
                let entry = HttpCacheEntry::from_response(url, response);
                self.save(&key, &entry).await;
                Ok(entry.content)
            }
            Ok(response) => Err(AppError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            }),
            Err(e) if e.is_network() => match cached {
                Some(entry) => {
                    log::warn!("Network error for {url} ({e}); serving cached copy from {}", entry.timestamp);
                    Ok(entry.content)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Drop the cached response for `url`.
    pub async fn invalidate(&self, url: &str) -> Result<bool> {
        self.storage.delete(&Self::key(url)).await
    }

    /// Drop every cached response.
    pub async fn clear(&self) -> Result<usize> {
        let keys = self.storage.list_keys(&format!("{KEY_PREFIX}:")).await?;
        let mut removed = 0;
        for key in keys {
            if self.storage.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
