//! Fallback-oriented cache façade.
//!
//! Values are stored as a JSON envelope `{data, created_at, ttl}`. Freshness
//! is judged against the caller's `ttl`; the backend keeps entries for
//! `max(ttl, stale_retention)` so a stale copy survives for error fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::cache::CacheStorage;
use crate::error::Result;
use crate::models::CacheConfig;

const SNAPSHOT_PREFIX: &str = "deprecations";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    data: Value,
    created_at: DateTime<Utc>,
    /// Seconds
    ttl: u64,
}

impl Envelope {
    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = (now - self.created_at).to_std().unwrap_or(Duration::ZERO);
        age < ttl
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderSnapshot {
    provider: String,
    date: NaiveDate,
    data: Value,
    scraped_at: DateTime<Utc>,
}

/// `null`, `[]`, `{}` and `""` never replace cached data.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Shared by scrapers and the orchestrator; cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    storage: Arc<dyn CacheStorage>,
    default_ttl: Duration,
    stale_retention: Duration,
    snapshot_max_age_days: u32,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self::from_config(storage, &CacheConfig::default())
    }

    pub fn from_config(storage: Arc<dyn CacheStorage>, config: &CacheConfig) -> Self {
        Self {
            storage,
            default_ttl: config.ttl(),
            stale_retention: config.stale_retention(),
            snapshot_max_age_days: config.snapshot_max_age_days,
        }
    }

    pub fn snapshot_max_age_days(&self) -> u32 {
        self.snapshot_max_age_days
    }

    /// Read an envelope; unparsable entries are deleted and count as a miss.
    async fn load(&self, key: &str) -> Option<Envelope> {
        let bytes = match self.storage.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                log::warn!("Cache read failed for {key}: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                log::warn!("Corrupt cache entry {key}: {e}; removing");
                if let Err(e) = self.storage.delete(key).await {
                    log::warn!("Failed to remove corrupt entry {key}: {e}");
                }
                None
            }
        }
    }

    async fn store(&self, key: &str, data: Value, ttl: Duration) -> Result<()> {
        let envelope = Envelope {
            data,
            created_at: Utc::now(),
            ttl: ttl.as_secs(),
        };
        let bytes = serde_json::to_vec(&envelope)?;
        let retention = ttl.max(self.stale_retention);
        self.storage.set(key, &bytes, Some(retention)).await
    }

    fn decode<T: DeserializeOwned>(key: &str, envelope: Envelope) -> Option<T> {
        serde_json::from_value(envelope.data)
            .map_err(|e| log::warn!("Cached value for {key} has unexpected shape: {e}"))
            .ok()
    }

    /// Cached value while younger than `ttl`, otherwise one `fetch` attempt.
    ///
    /// A non-empty fetch result is cached and returned. A failed fetch falls
    /// back to the cached value, however old. Retrying is the caller's job.
    pub async fn get_with_fallback<T>(
        &self,
        key: &str,
        fetch: Option<BoxFuture<'_, Result<T>>>,
        ttl: Duration,
        use_stale_on_error: bool,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let cached = self.load(key).await;

        if let Some(envelope) = cached.as_ref().filter(|e| e.is_fresh(ttl, Utc::now())) {
            log::debug!("Cache hit: {key}");
            if let Ok(value) = serde_json::from_value(envelope.data.clone()) {
                return Some(value);
            }
        }

        if let Some(fetch) = fetch {
            match fetch.await {
                Ok(fresh) => {
                    match serde_json::to_value(&fresh) {
                        Ok(value) if !is_empty(&value) => {
                            if let Err(e) = self.store(key, value, ttl).await {
                                log::warn!("Failed to cache {key}: {e}");
                            }
                            return Some(fresh);
                        }
                        Ok(_) => log::debug!("Fetch for {key} returned nothing; keeping cache"),
                        Err(e) => log::warn!("Fetched value for {key} is not serializable: {e}"),
                    }
                }
                Err(e) => {
                    log::warn!("Failed to fetch fresh data for {key}: {e}");
                    if use_stale_on_error {
                        if let Some(envelope) = cached {
                            log::info!("Using stale cache for {key}");
                            return Self::decode(key, envelope);
                        }
                    }
                }
            }
        }

        cached.and_then(|envelope| Self::decode(key, envelope))
    }

    /// [`CacheManager::get_with_fallback`] with the configured freshness
    /// window and stale-on-error enabled.
    pub async fn get_or_fetch<T>(&self, key: &str, fetch: BoxFuture<'_, Result<T>>) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.get_with_fallback(key, Some(fetch), self.default_ttl, true)
            .await
    }

    async fn write_snapshot<T: Serialize>(
        &self,
        key: &str,
        provider: &str,
        data: &T,
        date: NaiveDate,
    ) -> Result<()> {
        let snapshot = ProviderSnapshot {
            provider: provider.to_string(),
            date,
            data: serde_json::to_value(data)?,
            scraped_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let retention_days = u64::from(self.snapshot_max_age_days.max(2));
        self.storage
            .set(key, &bytes, Some(Duration::from_secs(retention_days * 86_400)))
            .await
    }

    /// Snapshot a provider's data under a date-scoped key. Write failures are
    /// logged and reported as `false`.
    pub async fn save_deprecation_data<T: Serialize>(
        &self,
        provider: &str,
        data: &T,
        date: Option<NaiveDate>,
    ) -> bool {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        let key = self.storage.generate_key(SNAPSHOT_PREFIX, provider, Some(date));

        let result = self.write_snapshot(&key, provider, data, date).await;

        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to save {provider} snapshot for {date}: {e}");
                false
            }
        }
    }

    /// Most recent snapshot for `provider` within `max_age_days` of `date`.
    pub async fn get_deprecation_data<T: DeserializeOwned>(
        &self,
        provider: &str,
        date: Option<NaiveDate>,
        max_age_days: u32,
    ) -> Option<T> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());

        for days_back in 0..max_age_days {
            let Some(day) = date.checked_sub_days(chrono::Days::new(u64::from(days_back))) else {
                break;
            };
            let key = self.storage.generate_key(SNAPSHOT_PREFIX, provider, Some(day));
            let bytes = match self.storage.get(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Snapshot read failed for {key}: {e}");
                    continue;
                }
            };
            match serde_json::from_slice::<ProviderSnapshot>(&bytes) {
                Ok(snapshot) => match serde_json::from_value(snapshot.data) {
                    Ok(data) => {
                        log::debug!("Using {provider} snapshot from {day}");
                        return Some(data);
                    }
                    Err(e) => log::warn!("Snapshot {key} has unexpected shape: {e}"),
                },
                Err(e) => {
                    log::warn!("Corrupt snapshot {key}: {e}; removing");
                    let _ = self.storage.delete(&key).await;
                }
            }
        }
        None
    }

    /// Latest snapshot per provider, skipping providers with none.
    pub async fn get_all_providers_data(
        &self,
        providers: &[String],
        date: Option<NaiveDate>,
    ) -> BTreeMap<String, Value> {
        let mut result = BTreeMap::new();
        for provider in providers {
            if let Some(data) = self
                .get_deprecation_data::<Value>(provider, date, self.snapshot_max_age_days)
                .await
            {
                result.insert(provider.clone(), data);
            }
        }
        result
    }
}
