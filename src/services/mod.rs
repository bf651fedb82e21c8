//! Scrapers feeding the orchestrator.
//!
//! A scraper is anything that can produce raw deprecation notices on demand.
//! Provider-specific extraction lives behind [`Scraper`]; the orchestrator
//! only ever calls [`Scraper::scrape`].

mod feed;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::RawDeprecation;

pub use feed::JsonFeedScraper;

/// A source of deprecation notices.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Name used in errors, logs and provider statuses.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Fetch and extract notices. Individual malformed entries are fine;
    /// the orchestrator validates and drops them one by one.
    async fn scrape(&self) -> Result<Vec<RawDeprecation>>;
}
