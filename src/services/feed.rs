//! Scraper for providers that publish deprecations as JSON.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{CacheManager, HttpCache};
use crate::error::{AppError, Result};
use crate::models::{ProviderConfig, RawDeprecation};
use crate::services::Scraper;

/// Fetches a JSON array of notices (or `{"deprecations": [...]}`) through the
/// HTTP cache.
///
/// With a [`CacheManager`] attached, each successful fetch is snapshotted and
/// a failed one is answered from the newest snapshot instead.
pub struct JsonFeedScraper {
    name: String,
    url: String,
    http: Arc<HttpCache>,
    cache: Option<CacheManager>,
}

impl JsonFeedScraper {
    pub fn new(name: impl Into<String>, url: impl Into<String>, http: Arc<HttpCache>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            http,
            cache: None,
        }
    }

    pub fn from_provider(provider: &ProviderConfig, http: Arc<HttpCache>) -> Self {
        Self::new(&provider.name, &provider.url, http)
    }

    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn fetch(&self) -> Result<Vec<RawDeprecation>> {
        let body = self.http.get(&self.url, &[]).await?;
        self.parse(&body)
    }

    /// Decode the payload. Entries that are not objects are skipped; missing
    /// `provider` and `source_url` default to this scraper's name and URL.
    fn parse(&self, body: &[u8]) -> Result<Vec<RawDeprecation>> {
        let items = match serde_json::from_slice::<Value>(body)
            .map_err(|e| AppError::scrape(&self.name, format!("invalid JSON: {e}")))?
        {
            Value::Array(items) => items,
            Value::Object(mut document) => match document.remove("deprecations") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(AppError::scrape(
                        &self.name,
                        "document has no deprecations array",
                    ));
                }
            },
            _ => return Err(AppError::scrape(&self.name, "unexpected JSON document")),
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<RawDeprecation>(item) {
                Ok(mut raw) => {
                    raw.provider.get_or_insert_with(|| self.name.clone());
                    raw.source_url.get_or_insert_with(|| self.url.clone());
                    records.push(raw);
                }
                Err(e) => log::warn!("{}: skipping entry: {e}", self.name),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Scraper for JsonFeedScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&self) -> Result<Vec<RawDeprecation>> {
        let error = match self.fetch().await {
            Ok(records) => {
                if let Some(cache) = &self.cache {
                    cache.save_deprecation_data(&self.name, &records, None).await;
                }
                return Ok(records);
            }
            Err(e) => e,
        };

        if let Some(cache) = &self.cache {
            let snapshot: Option<Vec<RawDeprecation>> = cache
                .get_deprecation_data(&self.name, None, cache.snapshot_max_age_days())
                .await;
            if let Some(records) = snapshot {
                log::warn!(
                    "{}: fetch failed ({error}); using cached snapshot with {} records",
                    self.name,
                    records.len()
                );
                return Ok(records);
            }
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileSystemStorage;
    use crate::utils::http::testing::FakeTransport;
    use tempfile::TempDir;

    const URL: &str = "https://status.example.com/deprecations.json";

    fn setup(tmp: &TempDir) -> (Arc<FakeTransport>, Arc<HttpCache>, CacheManager) {
        let transport = Arc::new(FakeTransport::default());
        let http = Arc::new(HttpCache::new(
            Arc::new(FileSystemStorage::new(tmp.path().join("http"))),
            transport.clone(),
        ));
        let cache = CacheManager::new(Arc::new(FileSystemStorage::new(tmp.path().join("data"))));
        (transport, http, cache)
    }

    #[tokio::test]
    async fn test_parses_array_and_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let (transport, http, _) = setup(&tmp);
        transport.ok(
            URL,
            r#"[{"model":"gpt-4-0314","retirement_date":"2024-06-13"},
                {"provider":"Azure","model":"gpt-35","url":"https://azure.example.com/x"},
                42]"#,
            &[],
        );

        let scraper = JsonFeedScraper::new("OpenAI", URL, http);
        let records = scraper.scrape().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].provider.as_deref(), Some("OpenAI"));
        assert_eq!(records[0].source_url.as_deref(), Some(URL));
        assert_eq!(records[1].provider.as_deref(), Some("Azure"));
        assert_eq!(records[1].source_url.as_deref(), Some("https://azure.example.com/x"));
    }

    #[tokio::test]
    async fn test_parses_wrapped_document() {
        let tmp = TempDir::new().unwrap();
        let (transport, http, _) = setup(&tmp);
        transport.ok(URL, r#"{"deprecations":[{"model":"command-light"}]}"#, &[]);

        let records = JsonFeedScraper::new("Cohere", URL, http).scrape().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model.as_deref(), Some("command-light"));
    }

    #[tokio::test]
    async fn test_bad_document_is_scrape_error() {
        let tmp = TempDir::new().unwrap();
        let (transport, http, _) = setup(&tmp);
        transport.ok(URL, r#"{"models":[]}"#, &[]);

        let err = JsonFeedScraper::new("Cohere", URL, http).scrape().await.unwrap_err();
        assert!(matches!(err, AppError::Scrape { .. }));
    }

    #[tokio::test]
    async fn test_falls_back_to_snapshot() {
        let tmp = TempDir::new().unwrap();
        let (transport, http, cache) = setup(&tmp);
        let scraper = JsonFeedScraper::new("OpenAI", URL, http).with_cache(cache.clone());

        transport.ok(URL, r#"[{"model":"gpt-4-0314"}]"#, &[]);
        assert_eq!(scraper.scrape().await.unwrap().len(), 1);

        // Drop the HTTP copy so only the snapshot can answer.
        scraper.http.invalidate(URL).await.unwrap();
        transport.status(URL, 503);
        let records = scraper.scrape().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model.as_deref(), Some("gpt-4-0314"));
    }

    #[tokio::test]
    async fn test_error_without_snapshot() {
        let tmp = TempDir::new().unwrap();
        let (transport, http, cache) = setup(&tmp);
        transport.status(URL, 404);

        let err = JsonFeedScraper::new("OpenAI", URL, http)
            .with_cache(cache)
            .scrape()
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::HttpStatus { status: 404, .. }));
    }
}
