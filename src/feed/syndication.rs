//! RSS 2.0 and Atom parsing for syndication-format package feeds.
//!
//! Simplifier and friends publish package feeds as RSS items whose titles
//! carry `name#version`; a few registries use Atom. Both decode into one
//! [`SyndicationEntry`] shape for the fetcher to turn into raw entries.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyndicationError {
    #[error("feed parse error: {0}")]
    Parse(String),
}

/// One item/entry from a syndication feed, reduced to the fields the
/// aggregation pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyndicationEntry {
    pub title: String,
    pub version: Option<String>,
    pub id: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub link: Option<String>,
    pub published: Option<String>,
}

/// Parses a feed document, trying RSS first and Atom second.
pub fn parse(text: &str) -> Result<Vec<SyndicationEntry>, SyndicationError> {
    let rss_err = match quick_xml::de::from_str::<Rss>(text) {
        Ok(rss) => {
            return Ok(rss
                .channel
                .items
                .into_iter()
                .map(SyndicationEntry::from)
                .collect());
        }
        Err(e) => e,
    };
    match quick_xml::de::from_str::<AtomFeed>(text) {
        Ok(feed) => Ok(feed
            .entries
            .into_iter()
            .map(SyndicationEntry::from)
            .collect()),
        Err(atom_err) => Err(SyndicationError::Parse(format!(
            "not RSS ({rss_err}) and not Atom ({atom_err})"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RssChannel {
    #[serde(rename = "item")]
    items: Vec<RssItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RssItem {
    title: Option<String>,
    version: Option<String>,
    guid: Option<String>,
    description: Option<String>,
    author: Option<String>,
    #[serde(alias = "dc:creator")]
    creator: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

impl From<RssItem> for SyndicationEntry {
    fn from(item: RssItem) -> Self {
        SyndicationEntry {
            title: item.title.unwrap_or_default(),
            version: item.version,
            id: item.guid,
            summary: item.description,
            author: item.author.or(item.creator),
            link: item.link,
            published: item.pub_date,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomFeed {
    #[serde(rename = "entry")]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomEntry {
    title: Option<String>,
    id: Option<String>,
    summary: Option<String>,
    author: Option<AtomAuthor>,
    #[serde(rename = "link")]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomAuthor {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
}

impl From<AtomEntry> for SyndicationEntry {
    fn from(entry: AtomEntry) -> Self {
        SyndicationEntry {
            title: entry.title.unwrap_or_default(),
            version: None,
            id: entry.id,
            summary: entry.summary,
            author: entry.author.and_then(|a| a.name),
            link: entry.links.into_iter().find_map(|l| l.href),
            published: entry.published.or(entry.updated),
        }
    }
}
