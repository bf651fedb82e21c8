//! Per-provider run status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the latest check of one provider.
///
/// One per provider per run; a newer status replaces an older one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatus {
    pub name: String,
    pub last_checked: DateTime<Utc>,
    pub is_healthy: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ProviderStatus {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_checked: Utc::now(),
            is_healthy: true,
            error_message: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_checked: Utc::now(),
            is_healthy: false,
            error_message: Some(error.into()),
        }
    }
}
