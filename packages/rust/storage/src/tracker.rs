//! Typed access to the pipeline's key-space on top of a [`StateStore`].
//!
//! Fetch states, article busy-locks, done markers, article and summary
//! records, and feed snapshots all live here, so idempotency checks go
//! through one place instead of ad-hoc `exists` calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use refeed_shared::{
    ArticleKey, ArticleRecord, FeedSnapshot, FetchState, Result, SummaryRecord, space,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::state::StateStore;

/// Typed facade over the shared state store. Cheap to clone.
#[derive(Clone)]
pub struct PipelineState {
    store: Arc<dyn StateStore>,
    busy_ttl: Option<Duration>,
}

impl PipelineState {
    /// `busy_ttl` bounds how long a claim survives; `None` keeps claims forever.
    pub fn new(store: Arc<dyn StateStore>, busy_ttl: Option<Duration>) -> Self {
        Self { store, busy_ttl }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set(key, &bytes, None).await
    }

    // -----------------------------------------------------------------------
    // Fetch state
    // -----------------------------------------------------------------------

    /// Current state of `address`, `Unknown` when never recorded.
    pub async fn fetch_state(&self, address: &str) -> Result<FetchState> {
        match self.store.get(&space::fetch_state(address)).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).parse(),
            None => Ok(FetchState::Unknown),
        }
    }

    pub async fn set_fetch_state(&self, address: &str, state: FetchState) -> Result<()> {
        self.store
            .set(&space::fetch_state(address), state.as_str().as_bytes(), None)
            .await
    }

    /// Operator reset of a terminal `ERROR`. Returns whether anything changed.
    pub async fn clear_error(&self, address: &str) -> Result<bool> {
        if self.fetch_state(address).await? != FetchState::Error {
            return Ok(false);
        }
        self.store.delete(&space::fetch_state(address)).await
    }

    // -----------------------------------------------------------------------
    // Busy-lock and done marker
    // -----------------------------------------------------------------------

    /// Claim an article for processing. True for exactly one caller while
    /// the claim is live.
    pub async fn claim(&self, key: &ArticleKey) -> Result<bool> {
        let stamp = Utc::now().to_rfc3339();
        self.store
            .set_if_absent(&space::busy(key), stamp.as_bytes(), self.busy_ttl)
            .await
    }

    /// Drop a claim. Returns whether a live claim existed.
    pub async fn release(&self, key: &ArticleKey) -> Result<bool> {
        self.store.delete(&space::busy(key)).await
    }

    pub async fn is_claimed(&self, key: &ArticleKey) -> Result<bool> {
        self.store.exists(&space::busy(key)).await
    }

    pub async fn mark_done(&self, key: &ArticleKey) -> Result<()> {
        let stamp = Utc::now().to_rfc3339();
        self.store.set(&space::done(key), stamp.as_bytes(), None).await
    }

    pub async fn is_done(&self, key: &ArticleKey) -> Result<bool> {
        self.store.exists(&space::done(key)).await
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub async fn put_article(&self, article: &ArticleRecord) -> Result<()> {
        self.set_json(&space::article(&article.key), article).await
    }

    pub async fn get_article(&self, key: &ArticleKey) -> Result<Option<ArticleRecord>> {
        self.get_json(&space::article(key)).await
    }

    /// Every stored article of `feed`, in key order (oldest first).
    pub async fn articles_of(&self, feed: &str) -> Result<Vec<ArticleRecord>> {
        let keys = self.store.keys_with_prefix(&space::articles_of(feed)).await?;
        let mut articles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(article) = self.get_json(&key).await? {
                articles.push(article);
            }
        }
        Ok(articles)
    }

    pub async fn put_summary(&self, key: &ArticleKey, summary: &SummaryRecord) -> Result<()> {
        self.set_json(&space::summary(key), summary).await
    }

    pub async fn get_summary(&self, key: &ArticleKey) -> Result<Option<SummaryRecord>> {
        self.get_json(&space::summary(key)).await
    }

    pub async fn has_summary(&self, key: &ArticleKey) -> Result<bool> {
        self.store.exists(&space::summary(key)).await
    }

    pub async fn put_feed_snapshot(&self, snapshot: &FeedSnapshot) -> Result<()> {
        self.set_json(&space::feed(&snapshot.name), snapshot).await
    }

    pub async fn get_feed_snapshot(&self, name: &str) -> Result<Option<FeedSnapshot>> {
        self.get_json(&space::feed(name)).await
    }
}
