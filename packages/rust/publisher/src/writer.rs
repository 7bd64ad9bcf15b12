//! Storage for generated feeds (AI digests).

use chrono::{DateTime, Utc};
use tracing::info;

use refeed_shared::{
    ArticleKey, ArticleRecord, ExtraData, FeedSnapshot, Result, SummaryRecord, Tag, space,
};
use refeed_storage::PipelineState;

/// Writes generated articles for one output feed.
///
/// Each generated article is stored as an article record plus its summary
/// record, so [`crate::ResultPublisher`] serves it like any summarized item.
#[derive(Clone)]
pub struct FeedWriter {
    name: String,
    state: PipelineState,
}

impl FeedWriter {
    pub fn new(name: impl Into<String>, state: PipelineState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove every generated article of this feed along with its summary.
    /// Returns how many articles were removed.
    pub async fn clear(&self) -> Result<usize> {
        let articles = self.state.articles_of(&self.name).await?;
        let store = self.state.store();
        for article in &articles {
            store.delete(&space::summary(&article.key)).await?;
            store.delete(&space::article(&article.key)).await?;
        }
        if !articles.is_empty() {
            info!(feed = %self.name, removed = articles.len(), "cleared generated feed");
        }
        Ok(articles.len())
    }

    /// Store one generated article under `article:<feed>:<index>`.
    pub async fn write_article(
        &self,
        index: &str,
        title: &str,
        link: &str,
        body: &str,
        sources: Vec<String>,
        tags: Vec<Tag>,
    ) -> Result<ArticleKey> {
        let now = Utc::now();
        let key = ArticleKey {
            feed: self.name.clone(),
            index: index.replace(':', ""),
        };
        let article = ArticleRecord {
            key: key.clone(),
            title: title.to_string(),
            link: link.to_string(),
            published: now,
            description: format!("My AI summary of {title}"),
            guid: format!("{title}_summary"),
            extra: ExtraData::default(),
        };
        let summary = SummaryRecord {
            summary: body.to_string(),
            tags,
            extra: ExtraData::default(),
            sources,
            created_at: now,
        };
        self.state.put_article(&article).await?;
        self.state.put_summary(&key, &summary).await?;
        info!(feed = %self.name, article_key = %key, title, "generated article written");
        Ok(key)
    }

    /// Store the feed's `feed:<name>` snapshot.
    pub async fn write_snapshot(
        &self,
        title: &str,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.state
            .put_feed_snapshot(&FeedSnapshot {
                name: self.name.clone(),
                url: String::new(),
                title: title.to_string(),
                description: description.to_string(),
                link: None,
                updated_at: at,
            })
            .await
    }
}
