//! Core domain types for the refeed pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RefeedError, Result};

// ---------------------------------------------------------------------------
// ArticleKey
// ---------------------------------------------------------------------------

/// Identity of one feed item: the feed name plus a normalized
/// `<publish time><guid>` index with every `:` removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleKey {
    pub feed: String,
    pub index: String,
}

impl ArticleKey {
    /// Build the key for an item published at `published` with the given guid.
    pub fn new(feed: impl Into<String>, published: DateTime<Utc>, guid: &str) -> Self {
        let raw = format!(
            "{}:{guid}",
            published.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        );
        Self {
            feed: feed.into(),
            index: raw.replace(':', ""),
        }
    }
}

impl std::fmt::Display for ArticleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.feed, self.index)
    }
}

impl std::str::FromStr for ArticleKey {
    type Err = RefeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((feed, index)) if !feed.is_empty() && !index.is_empty() => Ok(Self {
                feed: feed.to_string(),
                index: index.to_string(),
            }),
            _ => Err(RefeedError::validation(format!(
                "article key {s:?} is not <feed>:<index>"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ArticleRecord
// ---------------------------------------------------------------------------

/// One accepted feed item, stored under `article:<feed>:<index>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub key: ArticleKey,
    pub title: String,
    /// Canonical link, the primary fetch target.
    pub link: String,
    pub published: DateTime<Utc>,
    /// Raw description/summary HTML from the feed.
    #[serde(default)]
    pub description: String,
    pub guid: String,
    /// Auxiliary data scraped from the description.
    #[serde(default)]
    pub extra: ExtraData,
}

/// Links, vote and comment counts found in an article's description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    /// Auxiliary resources (e.g. a comments page) keyed by their anchor text.
    #[serde(default)]
    pub links: Vec<DiscoveredLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub votes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<u64>,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// A link found in a document, with every distinct non-empty anchor text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub href: String,
    #[serde(default)]
    pub texts: Vec<String>,
}

/// Kind of embedded media reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// An embedded image or video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

/// Readable representation of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadableText {
    #[serde(default)]
    pub title: String,
    /// Plain text with block boundaries as newlines.
    pub text: String,
    /// Markdown rendition of the main content.
    #[serde(default)]
    pub markdown: String,
}

/// Everything extracted from one fetched resource, minus the preview image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceArtifact {
    pub address: String,
    /// Raw document body as rendered.
    pub content: String,
    #[serde(default)]
    pub links: Vec<DiscoveredLink>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    pub readable: ReadableText,
    pub fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FetchState
// ---------------------------------------------------------------------------

/// Per-address fetch status stored under `crawler:<address>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchState {
    Unknown,
    Busy,
    Done,
    Error,
}

impl FetchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Busy => "BUSY",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for FetchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FetchState {
    type Err = RefeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "BUSY" => Ok(Self::Busy),
            "DONE" => Ok(Self::Done),
            "ERROR" => Ok(Self::Error),
            other => Err(RefeedError::validation(format!(
                "unknown fetch state {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Summaries and feed metadata
// ---------------------------------------------------------------------------

/// A topic tag with model confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag: String,
    pub confidence: f64,
}

/// Summary of one article, stored under `summary:<articleKey>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub extra: ExtraData,
    /// Addresses whose artifacts contributed to the summary.
    #[serde(default)]
    pub sources: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a feed's channel metadata, stored under `feed:<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub name: String,
    /// Source address; empty for generated digest feeds.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub updated_at: DateTime<Utc>,
}
