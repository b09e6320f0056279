//! Per-feed fetching with bounded retry.
//!
//! A feed is fetched, dispatched on content type, and parsed into raw
//! entries. Failures of any kind (network, parse, unknown content type) are
//! retried with a fixed delay; after the last attempt the error surfaces to
//! the orchestrator, which records it against that feed alone.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feed::syndication::{self, SyndicationError};
use crate::feed::types::{
    Feed, MaybeVersion, NameField, RawEntry, RawVersion, Scalar, StringOrList, VersionsField,
};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(String),

    #[error(transparent)]
    Syndication(#[from] SyndicationError),

    #[error("unknown content type: {0}")]
    UnknownContentType(String),
}

/// Bounded fixed-delay retry. Tests shrink the delay to keep runs fast.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

pub struct FeedFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl FeedFetcher {
    pub fn new(client: reqwest::Client, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            client,
            retry,
            timeout,
        }
    }

    /// Fetches and parses one feed, retrying on any failure.
    pub async fn fetch(&self, feed: &Feed) -> Result<Vec<RawEntry>, FeedError> {
        let mut last_error = None;
        for attempt in 1..=self.retry.attempts.max(1) {
            match self.fetch_once(feed).await {
                Ok(entries) => return Ok(entries),
                Err(e) => {
                    warn!(
                        "attempt {attempt}/{} for feed {} failed: {e}",
                        self.retry.attempts.max(1),
                        feed.name
                    );
                    last_error = Some(e);
                    if attempt < self.retry.attempts.max(1) {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }
        Err(last_error.expect("at least one attempt was made"))
    }

    async fn fetch_once(&self, feed: &Feed) -> Result<Vec<RawEntry>, FeedError> {
        info!("fetching feed {} from {}", feed.name, feed.url);
        let response = self
            .client
            .get(&feed.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let body = response.text().await?;
        debug!("feed {}: content-type {content_type}", feed.name);

        if content_type.contains("application/json") || feed.url.ends_with(".json") {
            let entries = parse_json_feed(&body, &feed.url)?;
            info!("fetched {} packages from JSON feed {}", entries.len(), feed.name);
            Ok(entries)
        } else if content_type.contains("xml")
            || content_type.contains("rss")
            || content_type.contains("atom")
            || content_type.contains("text/plain")
            || [".rss", ".atom", ".xml"].iter().any(|s| feed.url.ends_with(s))
        {
            let entries = parse_syndication_feed(&body, feed)?;
            if entries.is_empty() {
                warn!("no entries found in feed {}", feed.name);
            }
            info!("fetched {} entries from syndication feed {}", entries.len(), feed.name);
            Ok(entries)
        } else {
            Err(FeedError::UnknownContentType(content_type))
        }
    }
}

/// Parses a JSON package feed: a top-level `packages` or `entries` array of
/// package objects. An object with no usable `versions` list gets one
/// synthesized from its own `version`/`pubDate` fields.
fn parse_json_feed(body: &str, url: &str) -> Result<Vec<RawEntry>, FeedError> {
    let document: serde_json::Value =
        serde_json::from_str(body).map_err(|e| FeedError::Json(e.to_string()))?;

    let packages = match document.get("packages").or_else(|| document.get("entries")) {
        Some(serde_json::Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(FeedError::Json(format!(
                "feed {url}: packages field is not an array"
            )));
        }
        None => {
            return Err(FeedError::Json(format!(
                "feed {url}: no top-level packages or entries array"
            )));
        }
    };

    let mut entries = Vec::new();
    for item in packages {
        if !item.is_object() {
            continue;
        }
        let mut entry: RawEntry = match serde_json::from_value(item) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping malformed package object in {url}: {e}");
                continue;
            }
        };
        if entry.versions.needs_synthesis() {
            entry.versions = VersionsField::List(vec![MaybeVersion::Entry(RawVersion {
                version: Some(
                    entry
                        .version
                        .as_ref()
                        .and_then(StringOrList::first_string)
                        .unwrap_or_default(),
                ),
                pub_date: Some(
                    entry
                        .pub_date
                        .as_ref()
                        .and_then(Scalar::non_empty)
                        .unwrap_or_else(|| "NA".to_string()),
                ),
            })]);
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Converts syndication items into raw entries: the title splits on the
/// first `#` into name and version, with `id`/`summary` as name fallbacks.
/// Items with no resolvable name are dropped.
fn parse_syndication_feed(body: &str, feed: &Feed) -> Result<Vec<RawEntry>, FeedError> {
    let items = syndication::parse(body)?;

    let mut entries = Vec::new();
    for item in items {
        let (mut name, version) = match item.title.split_once('#') {
            Some((name, version)) => (name.to_string(), version.to_string()),
            None => (item.title.clone(), item.version.clone().unwrap_or_default()),
        };
        if name.is_empty() {
            name = item
                .id
                .clone()
                .or_else(|| item.summary.clone())
                .unwrap_or_default();
        }
        if name.is_empty() {
            continue;
        }

        let published = item.published.clone().unwrap_or_else(|| "NA".to_string());
        entries.push(RawEntry {
            name: Some(Scalar::Text(name)),
            version: Some(StringOrList::One(version.clone())),
            author: Some(NameField::Text(
                item.author.clone().unwrap_or_else(|| "NA".to_string()),
            )),
            fhir_version: Some(StringOrList::One("NA".to_string())),
            url: Some(Scalar::Text(
                item.link.clone().unwrap_or_else(|| "unknown".to_string()),
            )),
            pub_date: Some(Scalar::Text(published.clone())),
            registry: Some(Scalar::Text(feed.url.clone())),
            versions: VersionsField::List(vec![MaybeVersion::Entry(RawVersion {
                version: Some(version),
                pub_date: Some(published),
            })]),
            ..Default::default()
        });
    }
    Ok(entries)
}
