//! Read side of the pipeline.
//!
//! [`ResultPublisher`] pairs stored articles with their summaries and renders
//! them as an Atom feed. [`FeedWriter`] stores generated (digest) articles
//! in the same shape so they publish the same way.

mod atom;
mod writer;

use tracing::{debug, instrument};

use refeed_shared::{ArticleRecord, FeedSnapshot, RefeedError, Result, SummaryRecord};
use refeed_storage::PipelineState;

pub use atom::{escape_xml, render_atom};
pub use writer::FeedWriter;

/// One publishable entry: an article that has a summary.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub article: ArticleRecord,
    pub summary: SummaryRecord,
}

/// Reads completed summaries back out of the state store.
#[derive(Clone)]
pub struct ResultPublisher {
    state: PipelineState,
}

impl ResultPublisher {
    pub fn new(state: PipelineState) -> Self {
        Self { state }
    }

    /// Every article of `feed` that has a summary, newest first.
    /// Articles still in flight (or permanently failed) are left out.
    pub async fn feed_items(&self, feed: &str) -> Result<Vec<FeedItem>> {
        let articles = self.state.articles_of(feed).await?;
        let total = articles.len();
        let mut items = Vec::new();
        for article in articles {
            if let Some(summary) = self.state.get_summary(&article.key).await? {
                items.push(FeedItem { article, summary });
            }
        }
        items.sort_by(|a, b| b.article.published.cmp(&a.article.published));
        debug!(feed, total, summarized = items.len(), "feed items loaded");
        Ok(items)
    }

    /// The stored `feed:<name>` snapshot.
    pub async fn snapshot(&self, feed: &str) -> Result<FeedSnapshot> {
        self.state
            .get_feed_snapshot(feed)
            .await?
            .ok_or_else(|| RefeedError::NotFound(format!("feed {feed}")))
    }

    /// Render `feed` as an Atom document whose self link is `self_link`.
    #[instrument(skip_all, fields(feed = %feed))]
    pub async fn render(&self, feed: &str, self_link: &str) -> Result<String> {
        let snapshot = self.snapshot(feed).await?;
        let items = self.feed_items(feed).await?;
        Ok(render_atom(&snapshot, &items, self_link))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use refeed_shared::{ArticleKey, ExtraData, Tag};
    use refeed_storage::MemoryStore;

    use super::*;

    fn article(feed: &str, guid: &str, hour: u32) -> ArticleRecord {
        let published = Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap();
        ArticleRecord {
            key: ArticleKey::new(feed, published, guid),
            title: format!("Post {guid}"),
            link: format!("https://example.com/{guid}"),
            published,
            description: "<p>original</p>".into(),
            guid: guid.into(),
            extra: ExtraData::default(),
        }
    }

    fn summary(text: &str) -> SummaryRecord {
        SummaryRecord {
            summary: text.into(),
            tags: vec![Tag {
                tag: "rust".into(),
                confidence: 0.9,
            }],
            extra: ExtraData::default(),
            sources: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn only_summarized_articles_are_published_newest_first() {
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let (a, b, c) = (article("hn", "a", 1), article("hn", "b", 2), article("hn", "c", 3));
        for art in [&a, &b, &c] {
            state.put_article(art).await.unwrap();
        }
        state.put_summary(&a.key, &summary("first")).await.unwrap();
        state.put_summary(&c.key, &summary("third")).await.unwrap();
        state.put_article(&article("other", "x", 4)).await.unwrap();

        let items = ResultPublisher::new(state).feed_items("hn").await.unwrap();
        let guids: Vec<_> = items.iter().map(|i| i.article.guid.as_str()).collect();
        assert_eq!(guids, vec!["c", "a"]);
        assert_eq!(items[0].summary.summary, "third");
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_found() {
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let err = ResultPublisher::new(state)
            .render("nope", "http://localhost/feed/nope")
            .await
            .unwrap_err();
        assert!(matches!(err, RefeedError::NotFound(_)));
    }
}
