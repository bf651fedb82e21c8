//! Change detection against the last published feed.
//!
//! Only records whose content differs from the previous snapshot need the
//! (expensive, external) enrichment step. Detection is a pure function of
//! the two record sets; loading the previous snapshot is kept separate.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::DeprecationRecord;
use crate::utils::{fs, sha256_hex};

/// Records split by whether the previous snapshot already had their content.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChangeSet {
    /// In input order
    pub changed: Vec<DeprecationRecord>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.changed.len()
    }
}

/// Detector for records changed since the last snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Stable hash of the fields enrichment depends on.
    ///
    /// Scrape and update timestamps are left out, and so is `replacement`,
    /// which enrichment derives on its own.
    pub fn content_hash(record: &DeprecationRecord) -> String {
        let date = |d: Option<chrono::NaiveDate>| d.map(|d| d.to_string()).unwrap_or_default();
        let announced = date(record.deprecation_date);
        let shutdown = date(record.retirement_date);
        let canonical = [
            record.provider.as_str(),
            record.model.as_str(),
            record.notes.as_deref().unwrap_or_default(),
            announced.as_str(),
            shutdown.as_str(),
            record.source_url.as_str(),
        ]
        .join("\u{1f}");
        sha256_hex(&canonical)[..16].to_string()
    }

    /// Records in `current` whose hash does not occur in `previous`.
    pub fn detect(
        &self,
        current: &[DeprecationRecord],
        previous: &[DeprecationRecord],
    ) -> ChangeSet {
        let known: HashSet<String> = previous.iter().map(Self::content_hash).collect();

        let mut result = ChangeSet::default();
        for record in current {
            if known.contains(&Self::content_hash(record)) {
                result.unchanged += 1;
            } else {
                result.changed.push(record.clone());
            }
        }
        result
    }

    /// Read the previous snapshot: either a bare JSON array of records or a
    /// feed document with a `deprecations` array.
    ///
    /// A missing or unreadable file yields an empty set, so every current
    /// record counts as changed. Entries that do not parse are skipped.
    pub async fn load_previous(path: &Path) -> Vec<DeprecationRecord> {
        let bytes = match fs::read_optional(path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                log::info!("No previous snapshot at {:?}; treating all records as changed", path);
                return Vec::new();
            }
            Err(e) => {
                log::warn!("Cannot read previous snapshot {:?}: {e}", path);
                return Vec::new();
            }
        };

        let items = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(mut document)) => match document.remove("deprecations") {
                Some(Value::Array(items)) => items,
                _ => {
                    log::warn!("Previous snapshot {:?} has no deprecations array", path);
                    return Vec::new();
                }
            },
            Ok(_) | Err(_) => {
                log::warn!("Previous snapshot {:?} is not valid JSON; ignoring it", path);
                return Vec::new();
            }
        };

        items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<DeprecationRecord>(item).ok())
            .collect()
    }
}

/// Convenience wrapper around [`ChangeDetector::detect`].
pub fn detect_changes(current: &[DeprecationRecord], previous: &[DeprecationRecord]) -> ChangeSet {
    ChangeDetector::new().detect(current, previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::record;
    use crate::storage::FeedSnapshot;
    use tempfile::TempDir;

    #[test]
    fn test_no_changes() {
        let previous = vec![record("OpenAI", "gpt-4-0314", None), record("Cohere", "c", None)];
        let current = previous.clone();

        let result = detect_changes(&current, &previous);
        assert!(!result.has_changes());
        assert_eq!(result.unchanged, 2);
    }

    #[test]
    fn test_detection_is_idempotent() {
        let previous = vec![record("OpenAI", "gpt-4-0314", None)];
        let current = vec![
            record("OpenAI", "gpt-4-0314", Some("date moved")),
            record("OpenAI", "gpt-4-0314", None),
            record("Anthropic", "claude-2.0", None),
        ];

        let first = detect_changes(&current, &previous);
        let second = detect_changes(&current, &previous);
        assert_eq!(first.changed, second.changed);
        assert_eq!(first.change_count(), 2);
        // Input order is kept
        assert_eq!(first.changed[0].notes.as_deref(), Some("date moved"));
        assert_eq!(first.changed[1].model, "claude-2.0");
    }

    #[test]
    fn test_empty_previous_marks_everything() {
        let current = vec![record("OpenAI", "a", None), record("OpenAI", "b", None)];
        assert_eq!(detect_changes(&current, &[]).change_count(), 2);
    }

    #[test]
    fn test_hash_ignores_timestamps() {
        let a = record("OpenAI", "gpt-4-0314", None);
        let mut b = a.clone();
        b.scraped_at += chrono::Duration::days(2);
        b.last_updated += chrono::Duration::days(2);
        assert_eq!(ChangeDetector::content_hash(&a), ChangeDetector::content_hash(&b));
        assert_eq!(ChangeDetector::content_hash(&a).len(), 16);
    }

    #[tokio::test]
    async fn test_load_previous_formats() {
        let tmp = TempDir::new().unwrap();
        let records = vec![record("OpenAI", "gpt-4-0314", None)];

        let array = tmp.path().join("array.json");
        std::fs::write(&array, serde_json::to_vec(&records).unwrap()).unwrap();
        assert_eq!(ChangeDetector::load_previous(&array).await.len(), 1);

        let feed_path = tmp.path().join("feed.json");
        let mut feed = FeedSnapshot::default();
        feed.merge(records, Vec::new());
        feed.save(&feed_path).await.unwrap();
        assert_eq!(ChangeDetector::load_previous(&feed_path).await.len(), 1);

        let garbage = tmp.path().join("garbage.json");
        std::fs::write(&garbage, b"not json").unwrap();
        assert!(ChangeDetector::load_previous(&garbage).await.is_empty());
        assert!(ChangeDetector::load_previous(&tmp.path().join("missing.json")).await.is_empty());
    }
}
