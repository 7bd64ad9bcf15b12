//! Feed source polling.
//!
//! Fetches a configured feed document, parses it (RSS, Atom, or JSON Feed)
//! into [`ParsedFeed`], and turns entries into [`ArticleRecord`]s.

mod extra;

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info, instrument};

use refeed_shared::{ArticleKey, ArticleRecord, FeedSource, RefeedError, Result};

pub use extra::extract_extra;

/// Maximum number of redirects to follow when fetching a feed.
const MAX_REDIRECTS: usize = 5;

/// Default timeout in seconds for fetching a feed document.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Feed documents above this size are rejected (20 MB).
const MAX_RESPONSE_SIZE: u64 = 20 * 1024 * 1024;

const USER_AGENT: &str = concat!("refeed/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Parsed feed
// ---------------------------------------------------------------------------

/// Channel metadata plus entries, in document order.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: String,
    pub description: String,
    pub link: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// One entry as it appeared in the feed. Fields may be missing; validation
/// happens in [`build_article`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Summary HTML, or the full content body when there is no summary.
    pub description: String,
}

/// Parse a feed document.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = feed_rs::parser::parse(bytes)
        .map_err(|e| RefeedError::parse(format!("feed document: {e}")))?;

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| FeedEntry {
            link: entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .filter(|href| !href.is_empty()),
            published: entry.published.or(entry.updated),
            title: entry.title.map(|t| t.content).unwrap_or_default(),
            description: entry
                .summary
                .map(|t| t.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default(),
            guid: entry.id,
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        description: feed.description.map(|t| t.content).unwrap_or_default(),
        link: feed.links.first().map(|l| l.href.clone()),
        entries,
    })
}

/// Validate an entry and derive its [`ArticleRecord`].
///
/// Entries without a link or a publish date cannot be keyed or fetched and
/// come back as permanent errors so the caller can skip them.
pub fn build_article(feed: &str, entry: &FeedEntry) -> Result<ArticleRecord> {
    let link = entry.link.as_deref().ok_or_else(|| {
        RefeedError::permanent(format!("{feed}: entry {:?} has no link", entry.guid))
    })?;
    let published = entry.published.ok_or_else(|| {
        RefeedError::permanent(format!("{feed}: entry {link} has no publish date"))
    })?;
    let guid = if entry.guid.is_empty() {
        link.to_string()
    } else {
        entry.guid.clone()
    };

    Ok(ArticleRecord {
        key: ArticleKey::new(feed, published, &guid),
        title: entry.title.trim().to_string(),
        link: link.to_string(),
        published,
        extra: extract_extra(&entry.description, Some(link)),
        description: entry.description.clone(),
        guid,
    })
}

// ---------------------------------------------------------------------------
// FeedClient
// ---------------------------------------------------------------------------

/// HTTP client for feed sources.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: Client,
}

impl FeedClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|e| RefeedError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Download and parse `source`.
    #[instrument(skip_all, fields(feed = %source.name, url = %source.url))]
    pub async fn fetch(&self, source: &FeedSource) -> Result<ParsedFeed> {
        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| RefeedError::Network(format!("{}: {e}", source.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefeedError::Network(format!("{}: HTTP {status}", source.url)));
        }
        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(RefeedError::validation(format!(
                    "{}: feed too large ({len} bytes, max {MAX_RESPONSE_SIZE})",
                    source.url
                )));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| {
                RefeedError::Network(format!("{}: failed to read body: {e}", source.url))
            })?;
        debug!(bytes = body.len(), "feed downloaded");

        let parsed = parse_feed(&body)?;
        info!(entries = parsed.entries.len(), title = %parsed.title, "feed parsed");
        Ok(parsed)
    }
}
