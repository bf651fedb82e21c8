//! Filesystem cache backend.
//!
//! ## Layout
//!
//! ```text
//! {root}/
//! ├── {sha256(key)}.cache        # payload
//! └── .metadata/
//!     └── {sha256(key)}.json     # CacheMetadata
//! ```
//!
//! File names are digests of the key, so any key string is path-safe.
//! Every write goes through a temp file and a rename.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::cache::{CacheMetadata, CacheStorage};
use crate::error::{AppError, Result};
use crate::utils::{fs, sha256_hex};

const DATA_EXT: &str = "cache";
const METADATA_DIR: &str = ".metadata";

/// Local filesystem cache backend.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root_dir: PathBuf,
}

impl FileSystemStorage {
    /// Create a new storage rooted at the given directory.
    ///
    /// Directories are created lazily on first write.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root_dir
            .join(format!("{}.{DATA_EXT}", sha256_hex(key)))
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root_dir.join(METADATA_DIR)
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.metadata_dir().join(format!("{}.json", sha256_hex(key)))
    }

    /// Metadata for `key`. A metadata file that cannot be parsed is removed
    /// together with its payload and reported as missing.
    async fn load_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        let Some(bytes) = fs::read_optional(&self.metadata_path(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<CacheMetadata>(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                log::warn!("Corrupt cache metadata for {key}: {e}; dropping entry");
                self.remove_files(key).await?;
                Ok(None)
            }
        }
    }

    async fn remove_files(&self, key: &str) -> Result<bool> {
        let data = fs::remove_if_exists(&self.data_path(key)).await?;
        let meta = fs::remove_if_exists(&self.metadata_path(key)).await?;
        Ok(data || meta)
    }

    /// Metadata of a live entry; expired entries are removed on the way.
    async fn live_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        match self.load_metadata(key).await? {
            Some(meta) if meta.is_expired() => {
                log::debug!("Cache entry expired: {key}");
                self.remove_files(key).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Number of payload files and their total size in bytes.
    pub async fn stats(&self) -> Result<(usize, u64)> {
        let mut entries = 0;
        let mut total = 0;
        let mut dir = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(AppError::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == DATA_EXT) {
                entries += 1;
                total += entry.metadata().await?.len();
            }
        }
        Ok((entries, total))
    }
}

/// Remove every file in `dir` whose extension matches; missing dir is empty.
async fn remove_with_extension(dir: &Path, ext: &str) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(AppError::Io(e)),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == ext) && fs::remove_if_exists(&path).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

#[async_trait]
impl CacheStorage for FileSystemStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.live_metadata(key).await?;
        fs::read_optional(&self.data_path(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let created_at = Utc::now();
        let expires_at = ttl
            .map(|ttl| {
                chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| created_at.checked_add_signed(ttl))
                    .ok_or_else(|| AppError::cache(format!("ttl {ttl:?} out of range for {key}")))
            })
            .transpose()?;
        let meta = CacheMetadata {
            key: key.to_string(),
            created_at,
            size: value.len() as u64,
            expires_at,
        };

        fs::write_atomic(&self.data_path(key), value).await?;
        fs::write_json(&self.metadata_path(key), &meta).await?;
        log::debug!("Cached {key} ({} bytes)", value.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.remove_files(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        // Expired or corrupt entries are removed here, so the payload check decides.
        self.live_metadata(key).await?;
        Ok(tokio::fs::try_exists(self.data_path(key)).await?)
    }

    async fn clear(&self) -> Result<usize> {
        let removed = remove_with_extension(&self.root_dir, DATA_EXT).await?;
        remove_with_extension(&self.metadata_dir(), "json").await?;
        log::info!("Cleared {removed} cache entries from {:?}", self.root_dir);
        Ok(removed)
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        self.load_metadata(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.metadata_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(AppError::Io(e)),
        };
        let now = Utc::now();
        while let Some(entry) = entries.next_entry().await? {
            let Some(bytes) = fs::read_optional(&entry.path()).await? else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<CacheMetadata>(&bytes) else {
                continue;
            };
            if meta.key.starts_with(prefix)
                && !meta.is_expired_at(now)
                && tokio::fs::try_exists(self.data_path(&meta.key)).await?
            {
                keys.push(meta.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
