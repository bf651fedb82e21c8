//! Deprecation record data structures.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AppError, Result};

/// A deprecation notice as a scraper hands it over, before validation.
///
/// Every field is optional so that one malformed entry can be rejected on its
/// own without failing the rest of a scraper's output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawDeprecation {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub deprecation_date: Option<String>,
    pub retirement_date: Option<String>,
    pub replacement: Option<String>,
    #[serde(alias = "context")]
    pub notes: Option<String>,
    #[serde(alias = "url")]
    pub source_url: Option<String>,
}

impl RawDeprecation {
    /// Start a raw record with the three fields every notice needs.
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            provider: Some(provider.into()),
            model: Some(model.into()),
            source_url: Some(source_url.into()),
            ..Self::default()
        }
    }

    pub fn deprecated_on(mut self, date: impl Into<String>) -> Self {
        self.deprecation_date = Some(date.into());
        self
    }

    pub fn retired_on(mut self, date: impl Into<String>) -> Self {
        self.retirement_date = Some(date.into());
        self
    }

    pub fn replaced_by(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = Some(replacement.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Identity of a deprecation: the same provider deprecating the same model.
///
/// Two records with equal keys describe the same deprecation even if their
/// content differs; content differences make an update, not a new record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    provider: String,
    model: String,
}

impl IdentityKey {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.trim().to_lowercase(),
            model: model.trim().to_lowercase(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// A validated model deprecation notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeprecationRecord {
    /// Provider name (e.g. "OpenAI")
    pub provider: String,

    /// Deprecated model or endpoint
    pub model: String,

    /// When the deprecation was announced
    #[serde(default)]
    pub deprecation_date: Option<NaiveDate>,

    /// When the model stops working
    #[serde(default)]
    pub retirement_date: Option<NaiveDate>,

    /// Suggested alternative
    #[serde(default)]
    pub replacement: Option<String>,

    /// Free-text context from the source page
    #[serde(default, alias = "context")]
    pub notes: Option<String>,

    /// Absolute http(s) URL the notice came from
    pub source_url: String,

    /// Fingerprint of the non-volatile fields
    #[serde(default)]
    pub content_hash: String,

    /// When the scraper produced this record
    pub scraped_at: DateTime<Utc>,

    /// When the store last wrote this record
    pub last_updated: DateTime<Utc>,
}

impl DeprecationRecord {
    /// Validate a raw scraper record.
    pub fn try_from_raw(raw: RawDeprecation, scraped_at: DateTime<Utc>) -> Result<Self> {
        let provider = required(raw.provider, "provider")?;
        let model = required(raw.model, "model")?;
        let source_url = required(raw.source_url, "source_url")?;

        let mut record = Self {
            provider,
            model,
            deprecation_date: raw
                .deprecation_date
                .as_deref()
                .map(|d| parse_date(d, "deprecation_date"))
                .transpose()?,
            retirement_date: raw
                .retirement_date
                .as_deref()
                .map(|d| parse_date(d, "retirement_date"))
                .transpose()?,
            replacement: non_blank(raw.replacement),
            notes: non_blank(raw.notes),
            source_url,
            content_hash: String::new(),
            scraped_at,
            last_updated: scraped_at,
        };
        record.validate()?;
        record.refresh_hash();
        Ok(record)
    }

    /// Check the record invariants.
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(AppError::validation("provider is empty"));
        }
        if self.model.trim().is_empty() {
            return Err(AppError::validation("model is empty"));
        }
        if let (Some(deprecated), Some(retired)) = (self.deprecation_date, self.retirement_date) {
            if retired <= deprecated {
                return Err(AppError::validation(format!(
                    "{} {}: retirement_date {} is not after deprecation_date {}",
                    self.provider, self.model, retired, deprecated
                )));
            }
        }
        validate_source_url(&self.source_url)
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.provider, &self.model)
    }

    /// SHA-256 over provider, model, dates, replacement, notes and URL.
    ///
    /// Timestamps are excluded so an unchanged notice hashes identically run over run.
    pub fn compute_hash(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprint<'a> {
            provider: &'a str,
            model: &'a str,
            deprecation_date: Option<NaiveDate>,
            retirement_date: Option<NaiveDate>,
            replacement: Option<&'a str>,
            notes: Option<&'a str>,
            source_url: &'a str,
        }

        let fingerprint = Fingerprint {
            provider: &self.provider,
            model: &self.model,
            deprecation_date: self.deprecation_date,
            retirement_date: self.retirement_date,
            replacement: self.replacement.as_deref(),
            notes: self.notes.as_deref(),
            source_url: &self.source_url,
        };
        // Serializing a plain struct of strings and dates cannot fail.
        let canonical = serde_json::to_vec(&fingerprint).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Recompute `content_hash` after construction or deserialization.
    pub fn refresh_hash(&mut self) {
        self.content_hash = self.compute_hash();
    }

    /// Equal fingerprints mean nothing worth persisting changed.
    pub fn same_content(&self, other: &Self) -> bool {
        self.compute_hash() == other.compute_hash()
    }
}

impl fmt::Display for DeprecationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = |d: Option<NaiveDate>| d.map_or_else(|| "?".to_string(), |d| d.to_string());
        write!(
            f,
            "{} {}: {} -> {}",
            self.provider,
            self.model,
            date(self.deprecation_date),
            date(self.retirement_date)
        )
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    non_blank(value).ok_or_else(|| AppError::validation(format!("missing required field {field}")))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp.
fn parse_date(value: &str, field: &str) -> Result<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| AppError::validation(format!("{field} '{value}' is not a date")))
}

fn validate_source_url(source_url: &str) -> Result<()> {
    let url = Url::parse(source_url)
        .map_err(|e| AppError::validation(format!("source_url '{source_url}': {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        _ => Err(AppError::validation(format!(
            "source_url '{source_url}' is not an absolute http(s) URL"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawDeprecation {
        RawDeprecation::new("OpenAI", "gpt-3.5-turbo-0301", "https://platform.openai.com/docs/deprecations")
            .deprecated_on("2023-06-13")
            .retired_on("2024-06-13")
            .replaced_by("gpt-3.5-turbo")
    }

    #[test]
    fn test_valid_record() {
        let record = DeprecationRecord::try_from_raw(raw(), Utc::now()).unwrap();
        assert_eq!(record.provider, "OpenAI");
        assert_eq!(
            record.retirement_date,
            NaiveDate::from_ymd_opt(2024, 6, 13)
        );
        assert_eq!(record.content_hash.len(), 64);
    }

    #[test]
    fn test_rfc3339_dates_accepted() {
        let record = DeprecationRecord::try_from_raw(
            raw().deprecated_on("2023-06-13T00:00:00Z"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(record.deprecation_date, NaiveDate::from_ymd_opt(2023, 6, 13));
    }

    #[test]
    fn test_rejects_retirement_before_deprecation() {
        let bad = raw().deprecated_on("2024-06-13").retired_on("2024-06-13");
        assert!(DeprecationRecord::try_from_raw(bad, Utc::now()).is_err());
    }

    #[test]
    fn test_rejects_missing_fields_and_bad_url() {
        let mut no_model = raw();
        no_model.model = Some("   ".into());
        assert!(DeprecationRecord::try_from_raw(no_model, Utc::now()).is_err());

        let mut relative = raw();
        relative.source_url = Some("/docs/deprecations".into());
        assert!(DeprecationRecord::try_from_raw(relative, Utc::now()).is_err());

        let mut ftp = raw();
        ftp.source_url = Some("ftp://example.com/file".into());
        assert!(DeprecationRecord::try_from_raw(ftp, Utc::now()).is_err());
    }

    #[test]
    fn test_dates_are_optional() {
        let record = DeprecationRecord::try_from_raw(
            RawDeprecation::new("Anthropic", "claude-instant-1", "https://docs.anthropic.com/deprecations"),
            Utc::now(),
        )
        .unwrap();
        assert!(record.deprecation_date.is_none());
        assert!(record.retirement_date.is_none());
    }

    #[test]
    fn test_hash_ignores_timestamps() {
        let a = DeprecationRecord::try_from_raw(raw(), Utc::now()).unwrap();
        let later = Utc::now() + chrono::Duration::days(3);
        let b = DeprecationRecord::try_from_raw(raw(), later).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_notes_change_keeps_identity() {
        let a = DeprecationRecord::try_from_raw(raw(), Utc::now()).unwrap();
        let b = DeprecationRecord::try_from_raw(raw().with_notes("Shutdown moved"), Utc::now())
            .unwrap();
        assert_eq!(a.identity(), b.identity());
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        assert_eq!(
            IdentityKey::new("OpenAI", " GPT-4-0314 "),
            IdentityKey::new("openai", "gpt-4-0314")
        );
    }

    #[test]
    fn test_raw_accepts_aliases() {
        let json = r#"{"provider":"Cohere","model":"command-light","url":"https://docs.cohere.com/x","context":"legacy"}"#;
        let raw: RawDeprecation = serde_json::from_str(json).unwrap();
        assert_eq!(raw.source_url.as_deref(), Some("https://docs.cohere.com/x"));
        assert_eq!(raw.notes.as_deref(), Some("legacy"));
    }
}
