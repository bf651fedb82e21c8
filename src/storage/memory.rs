//! In-memory record store for tests and dry runs.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::DeprecationRecord;
use crate::storage::{DeprecationStore, in_range, insert_new, replace_by_identity, same_provider};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<DeprecationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl DeprecationStore for MemoryStore {
    async fn store(&self, records: &[DeprecationRecord]) -> Result<usize> {
        let mut all = self.records.lock().await;
        Ok(insert_new(&mut all, records, Utc::now()))
    }

    async fn get_all(&self) -> Result<Vec<DeprecationRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn get_by_provider(&self, provider: &str) -> Result<Vec<DeprecationRecord>> {
        let all = self.records.lock().await;
        Ok(all.iter().filter(|r| same_provider(r, provider)).cloned().collect())
    }

    async fn get_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DeprecationRecord>> {
        let all = self.records.lock().await;
        Ok(all.iter().filter(|r| in_range(r, start, end)).cloned().collect())
    }

    async fn update(&self, record: &DeprecationRecord) -> Result<bool> {
        let mut all = self.records.lock().await;
        Ok(replace_by_identity(&mut all, record, Utc::now()))
    }

    async fn delete_by_provider(&self, provider: &str) -> Result<usize> {
        let mut all = self.records.lock().await;
        let before = all.len();
        all.retain(|r| !same_provider(r, provider));
        Ok(before - all.len())
    }

    async fn clear_all(&self) -> Result<usize> {
        let mut all = self.records.lock().await;
        let count = all.len();
        all.clear();
        Ok(count)
    }
}
