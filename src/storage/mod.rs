//! Persistence for deprecation records and the published feed.
//!
//! ## Files
//!
//! ```text
//! {data_dir}/
//! ├── deprecations.json     # JsonStore: array of DeprecationRecord
//! ├── feed.json             # FeedSnapshot: published records + provider statuses
//! └── changed.json          # records needing enrichment after the last run
//! ```

pub mod local;
pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{DeprecationRecord, IdentityKey, ProviderStatus};
use crate::utils::fs;

// Re-export for convenience
pub use local::JsonStore;
pub use memory::MemoryStore;

/// Trait for deprecation record stores.
///
/// Records are keyed by [`IdentityKey`]; a store never holds two records
/// with the same identity.
#[async_trait]
pub trait DeprecationStore: Send + Sync {
    /// Insert records whose identity is not stored yet; returns how many were added.
    async fn store(&self, records: &[DeprecationRecord]) -> Result<usize>;

    async fn get_all(&self) -> Result<Vec<DeprecationRecord>>;

    /// Case-insensitive provider match.
    async fn get_by_provider(&self, provider: &str) -> Result<Vec<DeprecationRecord>>;

    /// Records whose deprecation date lies in `start..=end`.
    async fn get_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DeprecationRecord>>;

    /// Replace the record with the same identity; `false` if there is none.
    async fn update(&self, record: &DeprecationRecord) -> Result<bool>;

    async fn delete_by_provider(&self, provider: &str) -> Result<usize>;

    async fn clear_all(&self) -> Result<usize>;
}

/// Append records with unseen identities. Within `incoming`, the first
/// record of an identity wins.
pub(crate) fn insert_new(
    existing: &mut Vec<DeprecationRecord>,
    incoming: &[DeprecationRecord],
    now: DateTime<Utc>,
) -> usize {
    let mut seen: std::collections::HashSet<IdentityKey> =
        existing.iter().map(DeprecationRecord::identity).collect();
    let before = existing.len();
    for record in incoming {
        if seen.insert(record.identity()) {
            let mut record = record.clone();
            record.last_updated = now;
            record.refresh_hash();
            existing.push(record);
        }
    }
    existing.len() - before
}

pub(crate) fn replace_by_identity(
    existing: &mut [DeprecationRecord],
    record: &DeprecationRecord,
    now: DateTime<Utc>,
) -> bool {
    let identity = record.identity();
    match existing.iter_mut().find(|r| r.identity() == identity) {
        Some(slot) => {
            *slot = record.clone();
            slot.last_updated = now;
            slot.refresh_hash();
            true
        }
        None => false,
    }
}

pub(crate) fn same_provider(record: &DeprecationRecord, provider: &str) -> bool {
    record.provider.trim().eq_ignore_ascii_case(provider.trim())
}

pub(crate) fn in_range(record: &DeprecationRecord, start: NaiveDate, end: NaiveDate) -> bool {
    record
        .deprecation_date
        .is_some_and(|date| start <= date && date <= end)
}

/// The published feed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub deprecations: Vec<DeprecationRecord>,
    #[serde(default)]
    pub provider_statuses: Vec<ProviderStatus>,
    pub last_updated: DateTime<Utc>,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            deprecations: Vec::new(),
            provider_statuses: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

impl FeedSnapshot {
    /// Load a snapshot, `None` if the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        fs::read_json(path).await
    }

    /// Write atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        fs::write_json(path, self).await?;
        log::info!(
            "Feed written to {:?} ({} deprecations, {} providers)",
            path,
            self.deprecations.len(),
            self.provider_statuses.len()
        );
        Ok(())
    }

    /// Take the store's records and overlay this run's provider statuses.
    ///
    /// Each provider keeps exactly one status, the most recently checked.
    pub fn merge(&mut self, records: Vec<DeprecationRecord>, statuses: Vec<ProviderStatus>) {
        self.deprecations = records;
        self.deprecations.sort_by(|a, b| {
            b.retirement_date
                .cmp(&a.retirement_date)
                .then_with(|| a.identity().cmp(&b.identity()))
        });

        for status in statuses {
            match self
                .provider_statuses
                .iter_mut()
                .find(|s| s.name == status.name)
            {
                Some(existing) if existing.last_checked <= status.last_checked => *existing = status,
                Some(_) => {}
                None => self.provider_statuses.push(status),
            }
        }
        self.provider_statuses.sort_by(|a, b| a.name.cmp(&b.name));
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;

    use crate::models::{DeprecationRecord, RawDeprecation};

    /// Valid record for `provider`/`model` with optional notes.
    pub fn record(provider: &str, model: &str, notes: Option<&str>) -> DeprecationRecord {
        let mut raw = RawDeprecation::new(provider, model, "https://example.com/deprecations")
            .deprecated_on("2024-01-01")
            .retired_on("2024-07-01");
        raw.notes = notes.map(str::to_string);
        DeprecationRecord::try_from_raw(raw, Utc::now()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::record;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_new_dedupes_batch_and_existing() {
        let mut existing = vec![record("OpenAI", "gpt-4-0314", None)];
        let incoming = vec![
            record("openai", "GPT-4-0314", Some("dup of existing")),
            record("OpenAI", "gpt-3.5-turbo-0301", Some("first")),
            record("OpenAI", "gpt-3.5-turbo-0301", Some("second")),
        ];
        assert_eq!(insert_new(&mut existing, &incoming, Utc::now()), 1);
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[1].notes.as_deref(), Some("first"));
    }

    #[test]
    fn test_replace_by_identity() {
        let mut existing = vec![record("OpenAI", "gpt-4-0314", None)];
        let changed = record("OpenAI", "gpt-4-0314", Some("moved"));
        assert!(replace_by_identity(&mut existing, &changed, Utc::now()));
        assert_eq!(existing[0].notes.as_deref(), Some("moved"));
        assert!(!replace_by_identity(
            &mut existing,
            &record("Cohere", "command", None),
            Utc::now()
        ));
    }

    #[test]
    fn test_merge_keeps_latest_status_per_provider() {
        let mut feed = FeedSnapshot::default();
        let mut old = ProviderStatus::failed("openai", "timeout");
        old.last_checked = Utc::now() - chrono::Duration::hours(1);
        feed.merge(Vec::new(), vec![old]);

        feed.merge(
            vec![record("OpenAI", "gpt-4-0314", None)],
            vec![ProviderStatus::healthy("openai"), ProviderStatus::healthy("cohere")],
        );
        assert_eq!(feed.provider_statuses.len(), 2);
        let openai = feed
            .provider_statuses
            .iter()
            .find(|s| s.name == "openai")
            .unwrap();
        assert!(openai.is_healthy);
        assert_eq!(feed.deprecations.len(), 1);
    }

    #[tokio::test]
    async fn test_feed_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("feed.json");
        assert!(FeedSnapshot::load(&path).await.unwrap().is_none());

        let mut feed = FeedSnapshot::default();
        feed.merge(
            vec![record("OpenAI", "gpt-4-0314", None)],
            vec![ProviderStatus::healthy("openai")],
        );
        feed.save(&path).await.unwrap();

        let loaded = FeedSnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.deprecations, feed.deprecations);
        assert_eq!(loaded.provider_statuses.len(), 1);
    }
}
