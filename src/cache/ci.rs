//! CI-aware cache backend.
//!
//! Wraps [`FileSystemStorage`] and keeps a `cache-state.json` manifest of
//! active keys so a CI cache step can save and restore the directory under
//! date and week scoped keys. The manifest is bookkeeping only: a missing or
//! broken manifest never affects `get`/`set`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::{CacheMetadata, CacheStorage, FileSystemStorage};
use crate::error::Result;
use crate::utils::fs;

const STATE_FILE: &str = "cache-state.json";
const STATE_VERSION: &str = "1.0.0";
const KEY_PREFIX: &str = "deprecations-cache";

/// Manifest persisted next to the cache entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheState {
    version: String,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    entries: BTreeMap<String, StateEntry>,
}

impl CacheState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            created_at: now,
            last_updated: now,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEntry {
    added_at: DateTime<Utc>,
    size: u64,
}

/// Summary of a cache directory.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub entries: usize,
    pub total_bytes: u64,
    pub directory: PathBuf,
    pub is_ci: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Keys for a CI cache save/restore step.
#[derive(Debug, Clone, Serialize)]
pub struct CacheActionKeys {
    pub path: PathBuf,
    pub key: String,
    pub restore_keys: Vec<String>,
    pub info: CacheInfo,
}

/// Filesystem cache with a CI state manifest.
#[derive(Debug, Clone)]
pub struct CiCacheStorage {
    inner: FileSystemStorage,
    state_lock: Arc<Mutex<()>>,
}

impl CiCacheStorage {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: FileSystemStorage::new(root_dir),
            state_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_ci() -> bool {
        Self::ci_root(|name| std::env::var(name).ok()).is_some()
    }

    /// `$GITHUB_WORKSPACE/.github-cache/deprecations` when `GITHUB_ACTIONS=true`,
    /// with variables looked up through `var`.
    pub fn ci_root(var: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
        if var("GITHUB_ACTIONS").as_deref() != Some("true") {
            return None;
        }
        let workspace = var("GITHUB_WORKSPACE").unwrap_or_else(|| ".".to_string());
        Some(Path::new(&workspace).join(".github-cache").join("deprecations"))
    }

    pub fn root(&self) -> &Path {
        self.inner.root()
    }

    fn state_path(&self) -> PathBuf {
        self.inner.root().join(STATE_FILE)
    }

    async fn load_state(&self) -> CacheState {
        match fs::read_json::<CacheState>(&self.state_path()).await {
            Ok(Some(state)) => state,
            Ok(None) => CacheState::new(),
            Err(e) => {
                log::warn!("Unreadable cache manifest, starting a new one: {e}");
                CacheState::new()
            }
        }
    }

    /// Apply `change` to the manifest. Failures are logged, never returned.
    async fn update_state(&self, change: impl FnOnce(&mut CacheState)) {
        let _guard = self.state_lock.lock().await;
        let mut state = self.load_state().await;
        change(&mut state);
        state.last_updated = Utc::now();
        if let Err(e) = fs::write_json(&self.state_path(), &state).await {
            log::warn!("Failed to update cache manifest: {e}");
        }
    }

    pub async fn cache_info(&self) -> Result<CacheInfo> {
        let (_, total_bytes) = self.inner.stats().await?;
        let state = self.load_state().await;
        Ok(CacheInfo {
            entries: state.entries.len(),
            total_bytes,
            directory: self.root().to_path_buf(),
            is_ci: Self::is_ci(),
            last_updated: Some(state.last_updated),
        })
    }

    /// Primary key: `deprecations-cache-{base}-{YYYY-MM-DD}-week-{YYYY-Www}`.
    ///
    /// Weeks start on Sunday (`%U`).
    pub fn action_key(base: &str, date: NaiveDate) -> String {
        format!(
            "{KEY_PREFIX}-{base}-{}-week-{}",
            date.format("%Y-%m-%d"),
            date.format("%Y-W%U")
        )
    }

    /// Save key plus restore keys from most to least specific.
    pub fn action_keys_for(date: NaiveDate) -> (String, Vec<String>) {
        let key = Self::action_key("primary", date);
        let restore = vec![
            key.clone(),
            format!("{KEY_PREFIX}-primary-{}", date.format("%Y-%m-")),
            format!("{KEY_PREFIX}-primary-{}", date.format("%Y-")),
            format!("{KEY_PREFIX}-primary-"),
        ];
        (key, restore)
    }

    pub async fn prepare_for_cache_action(&self) -> Result<CacheActionKeys> {
        let (key, restore_keys) = Self::action_keys_for(Utc::now().date_naive());
        Ok(CacheActionKeys {
            path: self.root().to_path_buf(),
            key,
            restore_keys,
            info: self.cache_info().await?,
        })
    }
}

#[async_trait]
impl CacheStorage for CiCacheStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl).await?;
        let size = value.len() as u64;
        self.update_state(|state| {
            state.entries.insert(
                key.to_string(),
                StateEntry {
                    added_at: Utc::now(),
                    size,
                },
            );
        })
        .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self.inner.delete(key).await?;
        if deleted {
            self.update_state(|state| {
                state.entries.remove(key);
            })
            .await;
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn clear(&self) -> Result<usize> {
        let removed = self.inner.clear().await?;
        self.update_state(|state| state.entries.clear()).await;
        Ok(removed)
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        self.inner.get_metadata(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_keys(prefix).await
    }
}
