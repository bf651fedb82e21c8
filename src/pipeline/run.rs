// src/pipeline/run.rs

//! End-to-end run: scrape, merge, publish the feed, select changed records.

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{CacheActionKeys, CacheBackend, CacheManager, HttpCache};
use crate::error::Result;
use crate::models::Config;
use crate::pipeline::{ChangeDetector, HealthMonitor, Orchestrator, OrchestratorResult, RetryPolicy};
use crate::services::{JsonFeedScraper, Scraper};
use crate::storage::{DeprecationStore, FeedSnapshot};
use crate::utils::{fs, log};

/// Everything a caller needs to report on a finished run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub result: OrchestratorResult,
    /// Records in the new feed whose content was not in the previous one
    pub changed: usize,
    pub feed_records: usize,
    /// Markdown, see [`HealthMonitor::health_report`]
    pub health_report: String,
    /// Present when running with the CI cache backend
    pub cache_action: Option<CacheActionKeys>,
}

/// One [`JsonFeedScraper`] per configured provider.
pub fn build_scrapers(
    config: &Config,
    http: &Arc<HttpCache>,
    cache: &CacheManager,
) -> Vec<Arc<dyn Scraper>> {
    config
        .providers
        .iter()
        .map(|provider| {
            Arc::new(
                JsonFeedScraper::from_provider(provider, Arc::clone(http)).with_cache(cache.clone()),
            ) as Arc<dyn Scraper>
        })
        .collect()
}

/// Run `scrapers`, merge into `store`, then publish the feed and the changed
/// subset to the paths in `config`.
pub async fn run_pipeline(
    config: &Config,
    backend: &CacheBackend,
    cache: &CacheManager,
    store: Arc<dyn DeprecationStore>,
    scrapers: &[Arc<dyn Scraper>],
) -> Result<RunReport> {
    log::header("Deprecation scrape");
    log::info(&format!("{} scrapers configured", scrapers.len()));

    let health = Arc::new(
        HealthMonitor::new(config.health.clone(), RetryPolicy::from_config(&config.retry))
            .with_cache(cache.clone()),
    );
    let orchestrator = Orchestrator::new(config.orchestrator.clone(), Arc::clone(&store))
        .with_retry(RetryPolicy::from_config(&config.retry))
        .with_health(Arc::clone(&health));

    log::step(1, 3, "Scraping providers");
    let result = orchestrator.run(scrapers).await?;
    for report in &result.reports {
        log::sub_item(&format!(
            "{}: {:?} ({} records, {} rejected)",
            report.name, report.state, report.records, report.rejected
        ));
    }

    log::step(2, 3, "Publishing feed");
    let feed_path = &config.paths.feed_file;
    let previous = ChangeDetector::load_previous(feed_path).await;
    let mut feed = match FeedSnapshot::load(feed_path).await {
        Ok(Some(feed)) => feed,
        Ok(None) => FeedSnapshot::default(),
        Err(e) => {
            log::warn(&format!("Previous feed unreadable ({e}); starting fresh"));
            FeedSnapshot::default()
        }
    };
    feed.merge(store.get_all().await?, result.provider_statuses.clone());
    feed.save(feed_path).await?;

    log::step(3, 3, "Detecting changes");
    let changes = ChangeDetector::new().detect(&feed.deprecations, &previous);
    fs::write_json(&config.paths.changed_file, &changes.changed).await?;
    log::info(&format!(
        "{} changed, {} unchanged (written to {})",
        changes.change_count(),
        changes.unchanged,
        config.paths.changed_file.display()
    ));

    let cache_action = match backend {
        CacheBackend::Ci(storage) => match storage.prepare_for_cache_action().await {
            Ok(keys) => Some(keys),
            Err(e) => {
                log::warn(&format!("Cannot prepare CI cache keys: {e}"));
                None
            }
        },
        CacheBackend::FileSystem(_) => None,
    };

    log::summary(
        "Run summary",
        &[
            ("Scrapers", result.total_scrapers.to_string()),
            ("Succeeded", result.successful_scrapers.to_string()),
            ("Failed", result.failed_scrapers.to_string()),
            ("New records", result.new_records.to_string()),
            ("Updated records", result.updated_records.to_string()),
            ("Elapsed", format!("{:.2?}", result.execution_time)),
        ],
    );
    for error in &result.errors {
        log::error(error);
    }

    Ok(RunReport {
        changed: changes.change_count(),
        feed_records: feed.deprecations.len(),
        health_report: health.health_report().await,
        cache_action,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileSystemStorage;
    use crate::models::PathsConfig;
    use crate::storage::JsonStore;
    use crate::utils::http::testing::FakeTransport;
    use tempfile::TempDir;

    const OPENAI: &str = "https://openai.example.com/deprecations.json";
    const COHERE: &str = "https://cohere.example.com/deprecations.json";

    fn config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.orchestrator.retry_failed = false;
        config.paths = PathsConfig {
            data_dir: tmp.path().join("data"),
            feed_file: tmp.path().join("data/feed.json"),
            changed_file: tmp.path().join("data/changed.json"),
        };
        config
    }

    #[tokio::test]
    async fn test_pipeline_publishes_feed_and_changes() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let backend = CacheBackend::FileSystem(FileSystemStorage::new(tmp.path().join("cache")));
        let cache = CacheManager::from_config(backend.shared(), &config.cache);

        let transport = Arc::new(FakeTransport::default());
        transport.ok(
            OPENAI,
            r#"[{"model":"gpt-4-0314","deprecation_date":"2023-06-06","retirement_date":"2024-06-13"}]"#,
            &[],
        );
        transport.network_error(COHERE);
        let http = Arc::new(
            HttpCache::new(
                Arc::new(FileSystemStorage::new(tmp.path().join("http"))),
                transport.clone(),
            )
            .with_freshness(std::time::Duration::ZERO),
        );
        let scrapers: Vec<Arc<dyn Scraper>> = vec![
            Arc::new(JsonFeedScraper::new("OpenAI", OPENAI, Arc::clone(&http))),
            Arc::new(JsonFeedScraper::new("Cohere", COHERE, Arc::clone(&http))),
        ];
        let store: Arc<dyn DeprecationStore> = Arc::new(JsonStore::new(&config.paths.data_dir));

        let report = run_pipeline(&config, &backend, &cache, Arc::clone(&store), &scrapers)
            .await
            .unwrap();
        assert_eq!(report.result.successful_scrapers, 1);
        assert_eq!(report.result.failed_scrapers, 1);
        assert_eq!(report.feed_records, 1);
        assert_eq!(report.changed, 1);
        assert!(report.health_report.contains("### Cohere"));
        assert!(report.cache_action.is_none());

        let feed = FeedSnapshot::load(&config.paths.feed_file).await.unwrap().unwrap();
        assert_eq!(feed.provider_statuses.len(), 2);

        // Same content again: nothing changed since the published feed.
        transport.ok(
            OPENAI,
            r#"[{"model":"gpt-4-0314","deprecation_date":"2023-06-06","retirement_date":"2024-06-13"}]"#,
            &[],
        );
        transport.network_error(COHERE);
        let again = run_pipeline(&config, &backend, &cache, store, &scrapers)
            .await
            .unwrap();
        assert_eq!(again.result.new_records, 0);
        assert_eq!(again.changed, 0);

        let changed: Vec<serde_json::Value> = serde_json::from_slice(
            &std::fs::read(&config.paths.changed_file).unwrap(),
        )
        .unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn test_build_scrapers_per_provider() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.providers = vec![
            crate::models::ProviderConfig {
                name: "OpenAI".into(),
                url: OPENAI.into(),
            },
            crate::models::ProviderConfig {
                name: "Cohere".into(),
                url: COHERE.into(),
            },
        ];
        let storage = Arc::new(FileSystemStorage::new(tmp.path().join("http")));
        let http = Arc::new(HttpCache::new(storage.clone(), Arc::new(FakeTransport::default())));
        let cache = CacheManager::new(storage);

        let scrapers = build_scrapers(&config, &http, &cache);
        let names: Vec<&str> = scrapers.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["OpenAI", "Cohere"]);
    }
}
