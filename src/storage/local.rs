//! JSON file store.
//!
//! All records live in `{data_dir}/deprecations.json` as one array. Every
//! mutation is a read-modify-write under an in-process lock, persisted with
//! a temp-file rename so readers never see a partial file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::DeprecationRecord;
use crate::storage::{DeprecationStore, in_range, insert_new, replace_by_identity, same_provider};
use crate::utils::fs;

const DATA_FILE: &str = "deprecations.json";

/// Local filesystem record store.
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    /// Create a store keeping its file in `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(DATA_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record. Entries that fail to parse are skipped; a file
    /// that is not a JSON array is an error so it never gets overwritten.
    async fn load(&self) -> Result<Vec<DeprecationRecord>> {
        let Some(bytes) = fs::read_optional(&self.path).await? else {
            return Ok(Vec::new());
        };
        let items: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::storage(format!("{} is not a JSON array of records: {e}", self.path.display()))
        })?;

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<DeprecationRecord>(item) {
                Ok(mut record) => {
                    record.refresh_hash();
                    records.push(record);
                }
                Err(e) => log::warn!("Skipping unparsable record in {:?}: {e}", self.path),
            }
        }
        log::debug!("Loaded {} records from {:?}", records.len(), self.path);
        Ok(records)
    }

    async fn save(&self, records: &[DeprecationRecord]) -> Result<()> {
        fs::write_json(&self.path, records).await?;
        log::debug!("Saved {} records to {:?}", records.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl DeprecationStore for JsonStore {
    async fn store(&self, records: &[DeprecationRecord]) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let added = insert_new(&mut all, records, Utc::now());
        if added > 0 {
            self.save(&all).await?;
            log::info!("Stored {added} new deprecations");
        }
        Ok(added)
    }

    async fn get_all(&self) -> Result<Vec<DeprecationRecord>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn get_by_provider(&self, provider: &str) -> Result<Vec<DeprecationRecord>> {
        let all = self.get_all().await?;
        Ok(all.into_iter().filter(|r| same_provider(r, provider)).collect())
    }

    async fn get_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DeprecationRecord>> {
        let all = self.get_all().await?;
        Ok(all.into_iter().filter(|r| in_range(r, start, end)).collect())
    }

    async fn update(&self, record: &DeprecationRecord) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        if !replace_by_identity(&mut all, record, Utc::now()) {
            return Ok(false);
        }
        self.save(&all).await?;
        log::info!("Updated deprecation: {} {}", record.provider, record.model);
        Ok(true)
    }

    async fn delete_by_provider(&self, provider: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let before = all.len();
        all.retain(|r| !same_provider(r, provider));
        let deleted = before - all.len();
        if deleted > 0 {
            self.save(&all).await?;
            log::info!("Deleted {deleted} deprecations for provider {provider}");
        }
        Ok(deleted)
    }

    async fn clear_all(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let count = self.load().await?.len();
        fs::remove_if_exists(&self.path).await?;
        if count > 0 {
            log::info!("Cleared {count} deprecations");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::record;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_twice_adds_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::new(tmp.path());
        let batch = vec![
            record("OpenAI", "gpt-4-0314", None),
            record("Anthropic", "claude-instant-1", None),
            record("Cohere", "command-light", None),
        ];

        assert_eq!(store.store(&batch).await.unwrap(), 3);
        assert_eq!(store.store(&batch).await.unwrap(), 0);
        assert_eq!(store.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        JsonStore::new(tmp.path())
            .store(&[record("OpenAI", "gpt-4-0314", None)])
            .await
            .unwrap();

        let reopened = JsonStore::new(tmp.path());
        let all = reopened.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content_hash, all[0].compute_hash());
    }

    #[tokio::test]
    async fn test_update_and_queries() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::new(tmp.path());
        store
            .store(&[
                record("OpenAI", "gpt-4-0314", None),
                record("Cohere", "command-light", None),
            ])
            .await
            .unwrap();

        assert!(store.update(&record("OpenAI", "gpt-4-0314", Some("moved"))).await.unwrap());
        assert!(!store.update(&record("Google", "palm-2", None)).await.unwrap());

        let openai = store.get_by_provider("openai").await.unwrap();
        assert_eq!(openai.len(), 1);
        assert_eq!(openai[0].notes.as_deref(), Some("moved"));

        let jan = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert_eq!(store.get_by_date_range(jan, jan).await.unwrap().len(), 2);
        assert!(store.get_by_date_range(feb, feb).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::new(tmp.path());
        store
            .store(&[
                record("OpenAI", "a", None),
                record("OpenAI", "b", None),
                record("Cohere", "c", None),
            ])
            .await
            .unwrap();

        assert_eq!(store.delete_by_provider("OpenAI").await.unwrap(), 2);
        assert_eq!(store.delete_by_provider("OpenAI").await.unwrap(), 0);
        assert_eq!(store.clear_all().await.unwrap(), 1);
        assert_eq!(store.clear_all().await.unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_bad_items_skipped_bad_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = JsonStore::new(tmp.path());

        let good = serde_json::to_value(record("OpenAI", "gpt-4-0314", None)).unwrap();
        let file = serde_json::json!([good, {"provider": "broken"}]);
        std::fs::write(store.path(), serde_json::to_vec(&file).unwrap()).unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);

        std::fs::write(store.path(), b"{oops").unwrap();
        assert!(store.get_all().await.is_err());
        assert!(store.store(&[record("Cohere", "c", None)]).await.is_err());
    }
}
