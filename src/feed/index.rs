//! Master feed index loader.
//!
//! The list of known package feeds lives in a remote `package-feeds.json`
//! document. Loading it can fail without taking the service down: the sync
//! orchestrator treats an empty feed list as its abort condition.

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::feed::types::Feed;

/// Default master index of FHIR IG package feeds.
pub const DEFAULT_INDEX_URL: &str =
    "https://raw.githubusercontent.com/FHIR/ig-registry/master/package-feeds.json";

/// This feed is listed in the index but serves a permanently broken
/// document; it is excluded outright.
const EXCLUDED_FEED_URL: &str = "https://fhir.kl.dk/package-feed.xml";

#[derive(Debug, Error)]
pub enum FeedIndexError {
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid index document: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IndexDocument {
    feeds: Vec<IndexFeed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IndexFeed {
    name: Option<String>,
    url: Option<String>,
}

/// Loads the feed list from the master index.
pub struct FeedIndex {
    client: reqwest::Client,
    index_url: String,
    timeout: std::time::Duration,
}

impl FeedIndex {
    pub fn new(client: reqwest::Client, index_url: &str, timeout: std::time::Duration) -> Self {
        Self {
            client,
            index_url: index_url.to_string(),
            timeout,
        }
    }

    /// Fetches and filters the feed list.
    ///
    /// Keeps entries that carry both a name and an `http(s)` URL, minus the
    /// known-bad feed. Callers decide what an empty list means; here it is
    /// just a result.
    pub async fn load(&self) -> Result<Vec<Feed>, FeedIndexError> {
        let response = self
            .client
            .get(&self.index_url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let document: IndexDocument = response.json().await.map_err(|e| {
            warn!("failed to parse feed index response: {e}");
            FeedIndexError::InvalidResponse(e.to_string())
        })?;

        let feeds: Vec<Feed> = document
            .feeds
            .into_iter()
            .filter_map(|f| match (f.name, f.url) {
                (Some(name), Some(url))
                    if (url.starts_with("http://") || url.starts_with("https://"))
                        && url != EXCLUDED_FEED_URL =>
                {
                    Some(Feed { name, url })
                }
                _ => None,
            })
            .collect();

        info!("fetched {} feeds from {}", feeds.len(), self.index_url);
        Ok(feeds)
    }
}
