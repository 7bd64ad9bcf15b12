//! Flow construction and submission.
//!
//! A feed-poll chunk becomes one flow:
//!
//! ```text
//! batch
//! ├── summarize (article 1)
//! │   ├── fetch  article link      "Article"
//! │   └── fetch  comments page     "Comments"
//! └── summarize (article 2)
//!     └── fetch  article link      "Article"
//! ```
//!
//! A digest becomes `digest ← cluster ← embed`. Submission records the whole
//! tree and returns; nothing waits for a job to run.

use std::time::Duration;

use tracing::{debug, info, instrument};
use url::Url;

use refeed_shared::{ArticleRecord, RefeedError, Result};
use refeed_storage::{BatchReport, FlowNode, Job, JobQueue, JobStatus};

use crate::jobs::{BatchJob, ClusterJob, DigestJob, EmbedJob, FetchJob, JobPayload, SummarizeJob};

/// Auxiliary fetches per article on top of the primary link.
pub const MAX_AUX_LINKS: usize = 4;

pub const PRIMARY_HEADING: &str = "Article";
const FALLBACK_HEADING: &str = "Link";

fn node(payload: JobPayload, name: impl Into<String>) -> Result<FlowNode> {
    Ok(FlowNode::new(payload.stage().as_str(), name, payload.to_value()?))
}

/// Comparable form of an address: parsed and re-serialized when possible.
fn normalized(address: &str) -> String {
    Url::parse(address.trim())
        .map(|u| u.to_string())
        .unwrap_or_else(|_| address.trim().to_string())
}

/// Fetch targets of one article: the link first, then distinct auxiliary
/// links from its description, each with the heading it is assembled under.
pub fn fetch_targets(article: &ArticleRecord) -> Vec<(String, String)> {
    let primary = normalized(&article.link);
    let mut seen = vec![primary];
    let mut targets = vec![(article.link.clone(), PRIMARY_HEADING.to_string())];
    for link in &article.extra.links {
        if targets.len() > MAX_AUX_LINKS {
            break;
        }
        let key = normalized(&link.href);
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        let heading = link
            .texts
            .first()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| FALLBACK_HEADING.to_string());
        targets.push((link.href.clone(), heading));
    }
    targets
}

/// Builds and submits flows on the durable queue.
#[derive(Clone)]
pub struct JobOrchestrator {
    queue: JobQueue,
}

impl JobOrchestrator {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Flow for one chunk of accepted articles.
    pub fn build_batch_flow(
        &self,
        feed: &str,
        chunk_index: usize,
        articles: &[ArticleRecord],
    ) -> Result<FlowNode> {
        if articles.is_empty() {
            return Err(RefeedError::validation(format!("empty chunk {chunk_index} for {feed}")));
        }
        let mut batch = node(
            JobPayload::Batch(BatchJob {
                feed: feed.to_string(),
                chunk_index,
                item_count: articles.len(),
            }),
            format!("{feed}#{chunk_index}"),
        )?;

        for article in articles {
            let mut summarize = node(
                JobPayload::Summarize(SummarizeJob {
                    feed: feed.to_string(),
                    article: article.clone(),
                    article_key: article.key.clone(),
                    address: article.link.clone(),
                }),
                article.key.to_string(),
            )?;
            for (address, heading) in fetch_targets(article) {
                summarize = summarize.with_child(node(
                    JobPayload::Fetch(FetchJob {
                        feed: feed.to_string(),
                        article: article.clone(),
                        address: address.clone(),
                        heading,
                    }),
                    address,
                )?);
            }
            batch = batch.with_child(summarize);
        }
        Ok(batch)
    }

    /// Submit a chunk's flow. Returns the batch job id.
    #[instrument(skip_all, fields(feed = %feed, chunk = chunk_index))]
    pub async fn submit_batch(
        &self,
        feed: &str,
        chunk_index: usize,
        articles: &[ArticleRecord],
    ) -> Result<String> {
        let flow = self.build_batch_flow(feed, chunk_index, articles)?;
        let jobs = flow.node_count();
        let id = self.queue.enqueue_flow(&flow).await?;
        info!(batch_id = %id, articles = articles.len(), jobs, "batch submitted");
        Ok(id)
    }

    /// Submit `digest ← cluster ← embed` for a keys file already on disk.
    /// Returns the digest job id.
    #[instrument(skip_all, fields(digest = %embed.digest))]
    pub async fn submit_digest(&self, embed: EmbedJob, article_count: usize) -> Result<String> {
        let digest = embed.digest.clone();
        let clusters_file = embed.embeddings_file.with_extension("clusters.json");
        let scratch_files = vec![embed.keys_file.clone(), embed.embeddings_file.clone()];

        let flow = node(
            JobPayload::Digest(DigestJob {
                digest: digest.clone(),
                article_count,
                clusters_file: clusters_file.clone(),
                scratch_files,
            }),
            digest.clone(),
        )?
        .with_child(
            node(
                JobPayload::Cluster(ClusterJob {
                    digest: digest.clone(),
                    embeddings_file: embed.embeddings_file.clone(),
                    clusters_file,
                }),
                digest.clone(),
            )?
            .with_child(node(JobPayload::Embed(embed), digest)?),
        );
        let id = self.queue.enqueue_flow(&flow).await?;
        info!(digest_id = %id, article_count, "digest submitted");
        Ok(id)
    }

    pub async fn batch_report(&self, batch_id: &str) -> Result<BatchReport> {
        self.queue.batch_report(batch_id).await
    }

    /// Poll until `job_id` completes or fails.
    pub async fn wait_for(&self, job_id: &str, poll: Duration) -> Result<Job> {
        loop {
            let job = self
                .queue
                .get(job_id)
                .await?
                .ok_or_else(|| RefeedError::NotFound(format!("job {job_id}")))?;
            if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                debug!(job_id, status = %job.status, "job settled");
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};
    use refeed_shared::{ArticleKey, DiscoveredLink, ExtraData};
    use refeed_storage::Storage;

    use super::*;
    use crate::jobs::Stage;

    fn article(guid: &str, links: &[(&str, &[&str])]) -> ArticleRecord {
        let published = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        ArticleRecord {
            key: ArticleKey::new("tildes", published, guid),
            title: guid.into(),
            link: format!("https://example.com/{guid}"),
            published,
            description: String::new(),
            guid: guid.into(),
            extra: ExtraData {
                links: links
                    .iter()
                    .map(|(href, texts)| DiscoveredLink {
                        href: href.to_string(),
                        texts: texts.iter().map(|t| t.to_string()).collect(),
                    })
                    .collect(),
                votes: None,
                comments: None,
            },
        }
    }

    async fn orchestrator() -> JobOrchestrator {
        let path = std::env::temp_dir().join(format!("refeed_orch_{}.db", uuid::Uuid::now_v7()));
        JobOrchestrator::new(JobQueue::new(Storage::open(&path).await.unwrap()))
    }

    #[test]
    fn fetch_targets_dedupe_and_skip_the_primary_link() {
        let a = article(
            "a1",
            &[
                ("https://example.com/a1", &["self"]),
                ("https://tildes.net/~tech/a1", &["Comments URL", "12 comments"]),
                ("https://tildes.net/~tech/a1", &["again"]),
                ("https://other.example/", &[]),
            ],
        );
        let targets = fetch_targets(&a);
        assert_eq!(
            targets,
            vec![
                ("https://example.com/a1".to_string(), "Article".to_string()),
                ("https://tildes.net/~tech/a1".to_string(), "Comments URL".to_string()),
                ("https://other.example/".to_string(), "Link".to_string()),
            ]
        );
    }

    #[test]
    fn auxiliary_links_are_capped() {
        let hrefs: Vec<String> = (0..10).map(|i| format!("https://aux.example/{i}")).collect();
        let links: Vec<(&str, &[&str])> = hrefs.iter().map(|h| (h.as_str(), &[][..])).collect();
        assert_eq!(fetch_targets(&article("a1", &links)).len(), 1 + MAX_AUX_LINKS);
    }

    #[tokio::test]
    async fn batch_flow_shape() {
        let orch = orchestrator().await;
        let articles = [
            article("a1", &[("https://tildes.net/~tech/a1", &["Comments"])]),
            article("a2", &[]),
        ];
        let flow = orch.build_batch_flow("tildes", 3, &articles).unwrap();

        assert_eq!(flow.queue, "batch");
        assert_eq!(flow.children.len(), 2);
        assert_eq!(flow.children[0].children.len(), 2);
        assert_eq!(flow.children[1].children.len(), 1);
        assert_eq!(flow.node_count(), 1 + 2 + 3);
        assert_eq!(flow.children[0].name, articles[0].key.to_string());
        assert_eq!(flow.children[0].children[1].payload["heading"], "Comments");
        assert_eq!(flow.payload["item_count"], 2);
        assert!(orch.build_batch_flow("tildes", 0, &[]).is_err());
    }

    #[tokio::test]
    async fn submission_returns_without_running_anything() {
        let orch = orchestrator().await;
        let id = orch
            .submit_batch("tildes", 0, &[article("a1", &[])])
            .await
            .unwrap();

        let report = orch.batch_report(&id).await.unwrap();
        assert_eq!(report.status, JobStatus::WaitingChildren);
        assert_eq!(report.pending, 1);
        let fetch = orch.queue().claim(Stage::Fetch.as_str(), "t").await.unwrap().unwrap();
        assert_eq!(fetch.payload["address"], "https://example.com/a1");
        assert!(orch.queue().claim(Stage::Summarize.as_str(), "t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn digest_flow_runs_embed_first() {
        let orch = orchestrator().await;
        let dir = std::env::temp_dir();
        let id = orch
            .submit_digest(
                EmbedJob {
                    digest: "ai-tech".into(),
                    keys_file: dir.join("x.keys"),
                    embeddings_file: dir.join("x.csv"),
                },
                7,
            )
            .await
            .unwrap();

        let digest = orch.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(digest.queue, "digest");
        assert_eq!(digest.payload["clusters_file"], serde_json::json!(dir.join("x.clusters.json")));
        let scratch: Vec<PathBuf> =
            serde_json::from_value(digest.payload["scratch_files"].clone()).unwrap();
        assert_eq!(scratch.len(), 2);
        assert!(orch.queue().claim("cluster", "t").await.unwrap().is_none());
        assert!(orch.queue().claim("embed", "t").await.unwrap().is_some());
    }
}
