//! Feed polling and article admission.
//!
//! Each poll parses the source, drops entries that are invalid, too recent,
//! already done, or already summarized, claims the rest, and submits them
//! in chunks as batch flows.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use refeed_feeds::{FeedClient, ParsedFeed, build_article};
use refeed_shared::{ArticleRecord, FeedSnapshot, FeedSource, Result};
use refeed_storage::PipelineState;

use crate::orchestrator::JobOrchestrator;

/// What one poll did with a feed's entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub feed: String,
    pub entries: usize,
    pub accepted: usize,
    /// No link or no publish date.
    pub invalid: usize,
    /// Younger than the source's minimum age.
    pub too_recent: usize,
    /// Done marker or summary already present.
    pub finished: usize,
    /// Busy-lock held by an earlier poll.
    pub claimed: usize,
    /// Batch job ids, one per submitted chunk.
    pub batches: Vec<String>,
}

pub struct FeedIngester {
    client: FeedClient,
    state: PipelineState,
    orchestrator: JobOrchestrator,
    chunk_size: usize,
    max_articles: usize,
}

impl FeedIngester {
    pub fn new(
        client: FeedClient,
        state: PipelineState,
        orchestrator: JobOrchestrator,
        chunk_size: usize,
        max_articles: usize,
    ) -> Self {
        Self {
            client,
            state,
            orchestrator,
            chunk_size: chunk_size.max(1),
            max_articles,
        }
    }

    /// Download `source` and ingest it.
    #[instrument(skip_all, fields(feed = %source.name))]
    pub async fn poll(&self, source: &FeedSource) -> Result<PollReport> {
        let parsed = self.client.fetch(source).await?;
        self.ingest(source, parsed, Utc::now()).await
    }

    /// Admit the entries of an already parsed feed as of `now`.
    pub async fn ingest(
        &self,
        source: &FeedSource,
        parsed: ParsedFeed,
        now: DateTime<Utc>,
    ) -> Result<PollReport> {
        let min_age = i64::try_from(source.min_age_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(min_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let limit = source.max_articles.unwrap_or(self.max_articles);
        let mut report = PollReport {
            feed: source.name.clone(),
            entries: parsed.entries.len(),
            ..Default::default()
        };

        let mut accepted: Vec<ArticleRecord> = Vec::new();
        let admitted = self
            .admit(source, &parsed, cutoff, limit, now, &mut report, &mut accepted)
            .await;
        if let Err(e) = admitted {
            // Claims taken so far must not outlive a failed poll.
            self.release_all(&accepted).await;
            warn!(error = %e, released = accepted.len(), "poll aborted");
            return Err(e);
        }
        report.accepted = accepted.len();

        for (index, chunk) in accepted.chunks(self.chunk_size).enumerate() {
            match self.orchestrator.submit_batch(&source.name, index, chunk).await {
                Ok(id) => report.batches.push(id),
                Err(e) => {
                    // Unsubmitted articles must be claimable by the next poll.
                    let rest = &accepted[index * self.chunk_size..];
                    self.release_all(rest).await;
                    warn!(error = %e, released = rest.len(), "batch submission failed");
                    return Err(e);
                }
            }
        }

        info!(
            entries = report.entries,
            accepted = report.accepted,
            invalid = report.invalid,
            too_recent = report.too_recent,
            finished = report.finished,
            claimed = report.claimed,
            batches = report.batches.len(),
            "poll finished"
        );
        Ok(report)
    }

    /// Filter and claim entries into `accepted`. An article is pushed as soon
    /// as its claim is taken, so on error `accepted` holds every live claim.
    #[allow(clippy::too_many_arguments)]
    async fn admit(
        &self,
        source: &FeedSource,
        parsed: &ParsedFeed,
        cutoff: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
        report: &mut PollReport,
        accepted: &mut Vec<ArticleRecord>,
    ) -> Result<()> {
        for entry in parsed.entries.iter().take(limit) {
            let article = match build_article(&source.name, entry) {
                Ok(article) => article,
                Err(e) => {
                    warn!(error = %e, "skipping entry");
                    report.invalid += 1;
                    continue;
                }
            };
            if article.published > cutoff {
                debug!(article_key = %article.key, "too recent, leaving for a later poll");
                report.too_recent += 1;
                continue;
            }
            if self.state.is_done(&article.key).await?
                || self.state.has_summary(&article.key).await?
            {
                report.finished += 1;
                continue;
            }
            if !self.state.claim(&article.key).await? {
                debug!(article_key = %article.key, "already claimed");
                report.claimed += 1;
                continue;
            }
            accepted.push(article);

            if accepted.len() == 1 {
                self.state
                    .put_feed_snapshot(&FeedSnapshot {
                        name: source.name.clone(),
                        url: source.url.clone(),
                        title: parsed.title.clone(),
                        description: parsed.description.clone(),
                        link: parsed.link.clone(),
                        updated_at: now,
                    })
                    .await?;
            }
            if let Some(article) = accepted.last() {
                self.state.put_article(article).await?;
            }
        }
        Ok(())
    }

    async fn release_all(&self, articles: &[ArticleRecord]) {
        for article in articles {
            if let Err(e) = self.state.release(&article.key).await {
                warn!(article_key = %article.key, error = %e, "could not release claim");
            }
        }
    }
}
