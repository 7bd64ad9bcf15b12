//! Digest submission: collect recent summarized articles of the source
//! feeds into a keys file and submit `digest ← cluster ← embed`.

use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, instrument, warn};

use refeed_shared::{DigestSource, RefeedError, ResourceKey, Result};
use refeed_storage::PipelineState;

use crate::jobs::EmbedJob;
use crate::orchestrator::JobOrchestrator;

pub struct DigestScheduler {
    state: PipelineState,
    orchestrator: JobOrchestrator,
    scratch_dir: PathBuf,
}

impl DigestScheduler {
    pub fn new(
        state: PipelineState,
        orchestrator: JobOrchestrator,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state,
            orchestrator,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Keys of summarized source articles published within the history window.
    pub async fn recent_keys(
        &self,
        digest: &DigestSource,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let window = i64::try_from(digest.history_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut keys = Vec::new();
        for source in &digest.sources {
            let mut count = 0;
            for article in self.state.articles_of(source).await? {
                if article.published >= since && self.state.has_summary(&article.key).await? {
                    keys.push(article.key.to_string());
                    count += 1;
                }
            }
            info!(source = %source, count, "recent summarized articles");
        }
        Ok(keys)
    }

    /// Write the keys file and submit the digest flow. `None` when there is
    /// nothing to digest.
    #[instrument(skip_all, fields(digest = %digest.name))]
    pub async fn submit(
        &self,
        digest: &DigestSource,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let keys = self.recent_keys(digest, now).await?;
        if keys.is_empty() {
            info!(history_minutes = digest.history_minutes, "no recent articles, skipping digest");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| RefeedError::io(&self.scratch_dir, e))?;
        let stem = ResourceKey::scratch(&digest.name);
        let keys_file = self.scratch_dir.join(format!("{stem}.keys"));
        let embeddings_file = self.scratch_dir.join(format!("{stem}.csv"));
        tokio::fs::write(&keys_file, keys.join("\n"))
            .await
            .map_err(|e| RefeedError::io(&keys_file, e))?;

        let submitted = self
            .orchestrator
            .submit_digest(
                EmbedJob {
                    digest: digest.name.clone(),
                    keys_file: keys_file.clone(),
                    embeddings_file,
                },
                keys.len(),
            )
            .await;
        match submitted {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&keys_file).await {
                    warn!(path = %keys_file.display(), error = %rm, "keys file not removed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use refeed_shared::{ArticleKey, ArticleRecord, ExtraData, SummaryRecord};
    use refeed_storage::{JobQueue, MemoryStore, Storage};

    use super::*;

    fn digest() -> DigestSource {
        DigestSource {
            name: "ai-tech".into(),
            sources: vec!["tildes".into()],
            history_minutes: 60,
            schedule_minutes: 60,
            title: String::new(),
            description: String::new(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn store(
        state: &PipelineState,
        guid: &str,
        published: DateTime<Utc>,
        summarized: bool,
    ) -> ArticleKey {
        let article = ArticleRecord {
            key: ArticleKey::new("tildes", published, guid),
            title: guid.into(),
            link: format!("https://example.com/{guid}"),
            published,
            description: String::new(),
            guid: guid.into(),
            extra: ExtraData::default(),
        };
        state.put_article(&article).await.unwrap();
        if summarized {
            state
                .put_summary(
                    &article.key,
                    &SummaryRecord {
                        summary: "s".into(),
                        tags: vec![],
                        extra: ExtraData::default(),
                        sources: vec![],
                        created_at: now(),
                    },
                )
                .await
                .unwrap();
        }
        article.key
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("refeed_digest_scratch_{}", uuid::Uuid::now_v7()))
    }

    async fn scheduler() -> (DigestScheduler, PipelineState, JobQueue, PathBuf) {
        let db = std::env::temp_dir().join(format!("refeed_digest_{}.db", uuid::Uuid::now_v7()));
        let scratch = scratch_dir();
        let queue = JobQueue::new(Storage::open(&db).await.unwrap());
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let orchestrator = JobOrchestrator::new(queue.clone());
        let scheduler = DigestScheduler::new(state.clone(), orchestrator, &scratch);
        (scheduler, state, queue, scratch)
    }

    #[tokio::test]
    async fn only_recent_summarized_articles_are_collected() {
        let (scheduler, state, queue, scratch) = scheduler().await;
        let fresh = store(&state, "fresh", now() - TimeDelta::minutes(10), true).await;
        store(&state, "stale", now() - TimeDelta::hours(3), true).await;
        store(&state, "pending", now() - TimeDelta::minutes(5), false).await;

        let id = scheduler.submit(&digest(), now()).await.unwrap().unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.payload["article_count"], 1);
        let embed = queue.claim("embed", "t").await.unwrap().unwrap();
        let keys_file: PathBuf =
            serde_json::from_value(embed.payload["keys_file"].clone()).unwrap();
        assert_eq!(std::fs::read_to_string(&keys_file).unwrap(), fresh.to_string());
        std::fs::remove_dir_all(scratch).unwrap();
    }

    #[tokio::test]
    async fn failed_submission_removes_the_keys_file() {
        let db = std::env::temp_dir().join(format!("refeed_digest_{}.db", uuid::Uuid::now_v7()));
        let scratch = scratch_dir();
        let queue = JobQueue::new(Storage::open(&db).await.unwrap());
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let scheduler = DigestScheduler::new(state.clone(), JobOrchestrator::new(queue), &scratch);
        store(&state, "fresh", now() - TimeDelta::minutes(10), true).await;

        let second = libsql::Builder::new_local(&db).build().await.unwrap();
        let conn = second.connect().unwrap();
        conn.execute(
            "CREATE TRIGGER reject_jobs BEFORE INSERT ON jobs
             BEGIN SELECT RAISE(ABORT, 'queue unavailable'); END",
            (),
        )
        .await
        .unwrap();

        assert!(scheduler.submit(&digest(), now()).await.is_err());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
        std::fs::remove_dir_all(scratch).unwrap();
    }

    #[tokio::test]
    async fn nothing_recent_submits_nothing() {
        let (scheduler, state, queue, _scratch) = scheduler().await;
        store(&state, "stale", now() - TimeDelta::days(2), true).await;
        assert!(scheduler.submit(&digest(), now()).await.unwrap().is_none());
        assert!(queue.list(None, None, 10).await.unwrap().is_empty());
    }
}
