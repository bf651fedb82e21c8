// src/config.rs

//! Configuration loading and backend selection.
//!
//! Everything the CLI wires together at startup is built here from a
//! [`Config`], so the orchestration code never reads the environment itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheBackend, CacheManager, CiCacheStorage, FileSystemStorage, HttpCache};
use crate::error::Result;
use crate::models::{CacheConfig, Config, HttpConfig};
use crate::utils::http::ReqwestTransport;

/// Load configuration from a TOML file, apply environment overrides and validate.
///
/// A missing or unreadable file falls back to defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load_or_default(path)
    } else {
        log::info!("No config at {path:?}; using defaults");
        Config::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Pick the cache backend for this process: the CI-aware store under
/// `GITHUB_ACTIONS=true`, the plain filesystem store otherwise.
pub fn select_cache_backend(config: &CacheConfig) -> CacheBackend {
    select_cache_backend_with(config, |name| std::env::var(name).ok())
}

fn select_cache_backend_with(
    config: &CacheConfig,
    var: impl Fn(&str) -> Option<String>,
) -> CacheBackend {
    cache_backend_for(config, CiCacheStorage::ci_root(var))
}

/// Backend selection with the CI cache root already resolved.
pub fn cache_backend_for(config: &CacheConfig, ci_root: Option<PathBuf>) -> CacheBackend {
    match ci_root {
        Some(root) => {
            log::info!("CI environment detected; using CI cache storage at {root:?}");
            CacheBackend::Ci(CiCacheStorage::new(root))
        }
        None => CacheBackend::FileSystem(FileSystemStorage::new(&config.dir)),
    }
}

/// Cache manager over the selected backend.
pub fn build_cache_manager(backend: &CacheBackend, config: &CacheConfig) -> CacheManager {
    CacheManager::from_config(backend.shared(), config)
}

/// HTTP response cache. Under CI it lives inside the CI cache root so it is
/// restored together with the rest.
pub fn build_http_cache(
    backend: &CacheBackend,
    cache: &CacheConfig,
    http: &HttpConfig,
) -> Result<Arc<HttpCache>> {
    let dir = match backend {
        CacheBackend::Ci(storage) => storage.root().join("http"),
        CacheBackend::FileSystem(_) => cache.http_dir.clone(),
    };
    let transport = Arc::new(ReqwestTransport::from_config(http)?);
    let storage = Arc::new(FileSystemStorage::new(dir));
    Ok(Arc::new(
        HttpCache::new(storage, transport).with_freshness(cache.ttl()),
    ))
}
