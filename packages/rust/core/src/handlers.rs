//! Stage handlers run by the worker pools.
//!
//! Every handler is safe to re-deliver: work already recorded by an earlier
//! attempt (a stored summary, a script output file, a previous digest run)
//! is detected and skipped or replaced, never duplicated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use refeed_crawler::ResourceFetcher;
use refeed_publisher::{FeedItem, FeedWriter, ResultPublisher};
use refeed_shared::{DigestSource, RefeedError, Result, SummaryRecord, Tag};
use refeed_storage::{ArtifactStore, Job, JobQueue, PipelineState};

use crate::jobs::{
    BatchJob, ClusterJob, DigestJob, EmbedJob, FetchJob, FetchOutcome, JobPayload, Stage,
    SummarizeJob, SummarizeOutcome,
};
use crate::script::ScriptRunner;
use crate::summarize::{DigestPost, Summarizer};
use crate::worker::StageHandler;

/// Clusters composed at once by one digest job.
const DIGEST_CONCURRENCY: usize = 3;

fn wrong_payload(expected: Stage, payload: &JobPayload) -> RefeedError {
    RefeedError::validation(format!(
        "{expected} handler received a {} payload",
        payload.stage()
    ))
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Runs after every summarize child of a chunk succeeded; marks each
/// article done so later polls skip it.
pub struct BatchHandler {
    queue: JobQueue,
    state: PipelineState,
}

impl BatchHandler {
    pub fn new(queue: JobQueue, state: PipelineState) -> Self {
        Self { queue, state }
    }

    #[instrument(skip_all, fields(feed = %batch.feed, chunk = batch.chunk_index))]
    async fn run(&self, job: &Job, batch: BatchJob) -> Result<Value> {
        let mut done = Vec::new();
        for value in self.queue.children_values(&job.id).await? {
            let outcome: SummarizeOutcome = serde_json::from_value(value)?;
            self.state.mark_done(&outcome.article_key).await?;
            done.push(outcome.article_key.to_string());
        }
        info!(done = done.len(), expected = batch.item_count, "batch finished");
        Ok(json!({
            "feed": batch.feed,
            "chunk_index": batch.chunk_index,
            "done": done,
        }))
    }
}

#[async_trait]
impl StageHandler for BatchHandler {
    async fn handle(&self, job: &Job, payload: JobPayload) -> Result<Value> {
        match payload {
            JobPayload::Batch(batch) => self.run(job, batch).await,
            other => Err(wrong_payload(Stage::Batch, &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Summarize
// ---------------------------------------------------------------------------

/// Assembles the fetched resources of one article and summarizes them.
pub struct SummarizeHandler {
    queue: JobQueue,
    state: PipelineState,
    artifacts: Arc<dyn ArtifactStore>,
    summarizer: Summarizer,
}

impl SummarizeHandler {
    pub fn new(
        queue: JobQueue,
        state: PipelineState,
        artifacts: Arc<dyn ArtifactStore>,
        summarizer: Summarizer,
    ) -> Self {
        Self {
            queue,
            state,
            artifacts,
            summarizer,
        }
    }

    /// `### heading\n<text>\n\n\n` per distinct fetched resource, in
    /// submission order. Returns the content and the contributing addresses.
    async fn assemble(&self, outcomes: Vec<FetchOutcome>) -> Result<(String, Vec<String>)> {
        let mut seen = HashSet::new();
        let mut content = String::new();
        let mut sources = Vec::new();
        for outcome in outcomes {
            if !seen.insert(outcome.address.clone()) {
                continue;
            }
            let artifact = self
                .artifacts
                .get(&outcome.address)
                .await?
                .ok_or_else(|| RefeedError::NotFound(format!("artifact for {}", outcome.address)))?;
            let text = if artifact.readable.markdown.trim().is_empty() {
                &artifact.readable.text
            } else {
                &artifact.readable.markdown
            };
            content.push_str(&format!("### {}\n{}\n\n\n", outcome.heading, text.trim()));
            sources.push(outcome.address);
        }
        Ok((content, sources))
    }

    #[instrument(skip_all, fields(article_key = %job_data.article_key))]
    async fn run(&self, job: &Job, job_data: SummarizeJob) -> Result<Value> {
        let outcome = SummarizeOutcome {
            article_key: job_data.article_key.clone(),
        };
        if self.state.has_summary(&job_data.article_key).await? {
            debug!("summary already stored, skipping");
            return Ok(serde_json::to_value(outcome)?);
        }

        let outcomes = self
            .queue
            .children_values(&job.id)
            .await?
            .into_iter()
            .map(serde_json::from_value::<FetchOutcome>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let (content, sources) = self.assemble(outcomes).await?;
        if content.is_empty() {
            return Err(RefeedError::NotFound(format!(
                "no fetched resources for {}",
                job_data.address
            )));
        }

        let output = self
            .summarizer
            .summarize(&job_data.article.description, &content)
            .await?;
        let record = SummaryRecord {
            summary: output.summary,
            tags: output.tags,
            extra: job_data.article.extra.clone(),
            sources,
            created_at: Utc::now(),
        };
        self.state.put_summary(&job_data.article_key, &record).await?;
        info!(
            feed = %job_data.feed,
            tags = record.tags.len(),
            sources = record.sources.len(),
            "summary stored"
        );
        Ok(serde_json::to_value(outcome)?)
    }
}

#[async_trait]
impl StageHandler for SummarizeHandler {
    async fn handle(&self, job: &Job, payload: JobPayload) -> Result<Value> {
        match payload {
            JobPayload::Summarize(data) => self.run(job, data).await,
            other => Err(wrong_payload(Stage::Summarize, &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

pub struct FetchHandler {
    fetcher: Arc<ResourceFetcher>,
}

impl FetchHandler {
    pub fn new(fetcher: Arc<ResourceFetcher>) -> Self {
        Self { fetcher }
    }

    async fn run(&self, fetch: FetchJob) -> Result<Value> {
        // Serves the cached artifact when an earlier attempt got as far as DONE.
        self.fetcher.fetch(&fetch.address).await?;
        Ok(serde_json::to_value(FetchOutcome {
            address: fetch.address,
            heading: fetch.heading,
        })?)
    }
}

#[async_trait]
impl StageHandler for FetchHandler {
    async fn handle(&self, _job: &Job, payload: JobPayload) -> Result<Value> {
        match payload {
            JobPayload::Fetch(fetch) => self.run(fetch).await,
            other => Err(wrong_payload(Stage::Fetch, &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Embed / cluster
// ---------------------------------------------------------------------------

async fn output_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| RefeedError::io(path, e))
}

/// Runs the external embedding and clustering scripts.
pub struct ScriptHandler {
    scripts: ScriptRunner,
}

impl ScriptHandler {
    pub fn new(scripts: ScriptRunner) -> Self {
        Self { scripts }
    }

    #[instrument(skip_all, fields(digest = %embed.digest))]
    async fn embed(&self, embed: EmbedJob) -> Result<Value> {
        if output_exists(&embed.embeddings_file).await? {
            debug!(path = %embed.embeddings_file.display(), "embeddings already written");
        } else {
            self.scripts.embed(&embed.keys_file, &embed.embeddings_file).await?;
        }
        Ok(json!({ "digest": embed.digest, "embeddings_file": embed.embeddings_file }))
    }

    #[instrument(skip_all, fields(digest = %cluster.digest))]
    async fn cluster(&self, cluster: ClusterJob) -> Result<Value> {
        if output_exists(&cluster.clusters_file).await? {
            debug!(path = %cluster.clusters_file.display(), "clusters already written");
        } else {
            self.scripts
                .cluster(&cluster.embeddings_file, &cluster.clusters_file)
                .await?;
        }
        Ok(json!({ "digest": cluster.digest, "clusters_file": cluster.clusters_file }))
    }
}

#[async_trait]
impl StageHandler for ScriptHandler {
    async fn handle(&self, _job: &Job, payload: JobPayload) -> Result<Value> {
        match payload {
            JobPayload::Embed(embed) => self.embed(embed).await,
            JobPayload::Cluster(cluster) => self.cluster(cluster).await,
            other => Err(RefeedError::validation(format!(
                "script handler received a {} payload",
                other.stage()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// One theme from the clustering output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Cluster {
    pub theme: String,
    /// Article links belonging to the theme.
    pub posts: Vec<String>,
}

/// Writes one generated article per cluster into the digest's feed.
pub struct DigestHandler {
    state: PipelineState,
    summarizer: Summarizer,
    digests: BTreeMap<String, DigestSource>,
}

impl DigestHandler {
    pub fn new(state: PipelineState, summarizer: Summarizer, digests: &[DigestSource]) -> Self {
        Self {
            state,
            summarizer,
            digests: digests.iter().map(|d| (d.name.clone(), d.clone())).collect(),
        }
    }

    /// Summarized items of the digest's source feeds, by link.
    async fn source_items(&self, digest: &DigestSource) -> Result<HashMap<String, FeedItem>> {
        let publisher = ResultPublisher::new(self.state.clone());
        let mut items = HashMap::new();
        for source in &digest.sources {
            for item in publisher.feed_items(source).await? {
                items.insert(item.article.link.clone(), item);
            }
        }
        Ok(items)
    }

    async fn compose(
        &self,
        writer: &FeedWriter,
        index: String,
        cluster: Cluster,
        posts: Vec<FeedItem>,
    ) -> Result<()> {
        let digest_posts: Vec<DigestPost<'_>> = posts
            .iter()
            .map(|item| DigestPost {
                title: &item.article.title,
                link: &item.article.link,
                summary: &item.summary.summary,
            })
            .collect();
        let body = self.summarizer.digest_article(&cluster.theme, &digest_posts).await?;
        let title = self.summarizer.digest_title(&cluster.theme, &body).await?;
        writer
            .write_article(
                &index,
                &title,
                &cluster.posts[0],
                &body,
                cluster.posts.clone(),
                vec![Tag {
                    tag: cluster.theme.clone(),
                    confidence: 1.0,
                }],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(digest = %job_data.digest))]
    async fn run(&self, job_data: DigestJob) -> Result<Value> {
        let digest = self
            .digests
            .get(&job_data.digest)
            .ok_or_else(|| RefeedError::config(format!("unknown digest {:?}", job_data.digest)))?;

        let raw = tokio::fs::read(&job_data.clusters_file)
            .await
            .map_err(|e| RefeedError::io(&job_data.clusters_file, e))?;
        let clusters: Vec<Cluster> = serde_json::from_slice(&raw)?;
        let clusters: Vec<Cluster> = clusters.into_iter().filter(|c| !c.posts.is_empty()).collect();

        let items = self.source_items(digest).await?;
        // Every clustered link must resolve before anything is written.
        let mut resolved = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let missing: Vec<&str> = cluster
                .posts
                .iter()
                .filter(|link| !items.contains_key(link.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(RefeedError::NotFound(format!(
                    "not all posts of theme {:?} found: {} of {} missing: {}",
                    cluster.theme,
                    missing.len(),
                    cluster.posts.len(),
                    missing.join(", ")
                )));
            }
            let posts: Vec<FeedItem> = cluster
                .posts
                .iter()
                .filter_map(|l| items.get(l).cloned())
                .collect();
            resolved.push((cluster, posts));
        }

        let writer = FeedWriter::new(&digest.name, self.state.clone());
        writer.clear().await?;

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let written = resolved.len();
        let composing: Vec<BoxFuture<'_, Result<()>>> = resolved
            .into_iter()
            .enumerate()
            .map(|(i, (cluster, posts))| {
                self.compose(&writer, format!("{stamp}-{i}"), cluster, posts)
                    .boxed()
            })
            .collect();
        stream::iter(composing)
            .buffer_unordered(DIGEST_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        let title = if digest.title.is_empty() { &digest.name } else { &digest.title };
        writer.write_snapshot(title, &digest.description, Utc::now()).await?;

        for path in job_data.scratch_files.iter().chain([&job_data.clusters_file]) {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "scratch file not removed"),
            }
        }
        info!(articles = written, source_articles = job_data.article_count, "digest written");
        Ok(json!({ "digest": digest.name, "articles": written }))
    }
}

#[async_trait]
impl StageHandler for DigestHandler {
    async fn handle(&self, _job: &Job, payload: JobPayload) -> Result<Value> {
        match payload {
            JobPayload::Digest(data) => self.run(data).await,
            other => Err(wrong_payload(Stage::Digest, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use refeed_shared::{ArticleKey, ArticleRecord, ExtraData, ReadableText, ResourceArtifact};
    use refeed_storage::{FlowNode, JobStatus, MemoryStore, StateArtifactStore, Storage};

    use super::*;
    use crate::llm::LanguageModel;

    /// Answers summary prompts with a fixed text, tag prompts with JSON,
    /// and counts calls.
    pub(crate) struct CannedModel {
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl CannedModel {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn chat(&self, _model: Option<&str>, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if prompt.contains("wikipedia style news tags") {
                Ok(r#"[{"tag": "Technology", "confidence": 0.9}]"#.into())
            } else if prompt.starts_with("Provide a suitable title") {
                Ok("\"Digest title\"".into())
            } else {
                Ok("Generated text.".into())
            }
        }
    }

    async fn temp_queue() -> JobQueue {
        let path =
            std::env::temp_dir().join(format!("refeed_handlers_{}.db", uuid::Uuid::now_v7()));
        JobQueue::new(Storage::open(&path).await.unwrap())
    }

    fn article(feed: &str, guid: &str, link: &str) -> ArticleRecord {
        let published = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        ArticleRecord {
            key: ArticleKey::new(feed, published, guid),
            title: format!("Title {guid}"),
            link: link.into(),
            published,
            description: "<p>desc</p>".into(),
            guid: guid.into(),
            extra: ExtraData {
                links: vec![],
                votes: Some(3),
                comments: None,
            },
        }
    }

    fn artifact(address: &str, text: &str) -> ResourceArtifact {
        ResourceArtifact {
            address: address.into(),
            content: String::new(),
            links: vec![],
            media: vec![],
            readable: ReadableText {
                title: String::new(),
                text: text.into(),
                markdown: String::new(),
            },
            fetched_at: Utc::now(),
        }
    }

    /// Enqueue a summarize job with completed fetch children carrying `outcomes`.
    async fn summarize_job_with_children(
        queue: &JobQueue,
        data: &SummarizeJob,
        outcomes: &[FetchOutcome],
    ) -> Job {
        let payload = JobPayload::Summarize(data.clone()).to_value().unwrap();
        let mut node = FlowNode::new("summarize", "s", payload);
        for _ in outcomes {
            node = node.with_child(FlowNode::new("fetch", "f", json!({})));
        }
        let id = queue.enqueue_flow(&node).await.unwrap();
        let order: Vec<String> = queue
            .children(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        for _ in outcomes {
            let child = queue.claim("fetch", "t").await.unwrap().unwrap();
            let position = order.iter().position(|c| *c == child.id).unwrap();
            queue
                .complete(&child.id, &serde_json::to_value(&outcomes[position]).unwrap())
                .await
                .unwrap();
        }
        let job = queue.claim("summarize", "t").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        job
    }

    #[tokio::test]
    async fn summarize_assembles_distinct_resources_and_stores_summary() {
        let queue = temp_queue().await;
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(StateArtifactStore::new(state.store().clone()));
        artifacts.put("https://a/", &artifact("https://a/", "Body A")).await.unwrap();
        artifacts.put("https://c/", &artifact("https://c/", "Comments C")).await.unwrap();

        let model = CannedModel::new();
        let handler = SummarizeHandler::new(
            queue.clone(),
            state.clone(),
            artifacts,
            Summarizer::new(model.clone(), 0.7),
        );
        let record = article("tildes", "g1", "https://a/");
        let data = SummarizeJob {
            feed: "tildes".into(),
            article_key: record.key.clone(),
            address: record.link.clone(),
            article: record.clone(),
        };
        let outcomes = [
            FetchOutcome { address: "https://a/".into(), heading: "Article".into() },
            FetchOutcome { address: "https://c/".into(), heading: "Comments".into() },
            FetchOutcome { address: "https://a/".into(), heading: "Link".into() },
        ];
        let job = summarize_job_with_children(&queue, &data, &outcomes).await;

        let value = handler.handle(&job, JobPayload::Summarize(data.clone())).await.unwrap();
        let outcome: SummarizeOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(outcome.article_key, record.key);

        let summary = state.get_summary(&record.key).await.unwrap().unwrap();
        assert_eq!(summary.summary, "Generated text.");
        assert_eq!(summary.tags[0].tag, "Technology");
        assert_eq!(summary.extra.votes, Some(3));
        assert_eq!(summary.sources, vec!["https://a/", "https://c/"]);
        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("### Article\nBody A\n\n\n### Comments\nComments C\n\n\n"));

        // Re-delivery short-circuits without calling the model again.
        let calls = model.calls.load(Ordering::SeqCst);
        handler.handle(&job, JobPayload::Summarize(data)).await.unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn batch_marks_children_done() {
        let queue = temp_queue().await;
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let a = article("tildes", "g1", "https://a/");
        let batch = BatchJob { feed: "tildes".into(), chunk_index: 0, item_count: 1 };
        queue
            .enqueue_flow(
                &FlowNode::new("batch", "b", JobPayload::Batch(batch.clone()).to_value().unwrap())
                    .with_child(FlowNode::new("summarize", "s", json!({}))),
            )
            .await
            .unwrap();
        let child = queue.claim("summarize", "t").await.unwrap().unwrap();
        queue
            .complete(
                &child.id,
                &serde_json::to_value(SummarizeOutcome {
                    article_key: a.key.clone(),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        let job = queue.claim("batch", "t").await.unwrap().unwrap();

        let value = BatchHandler::new(queue.clone(), state.clone())
            .handle(&job, JobPayload::Batch(batch))
            .await
            .unwrap();
        assert_eq!(value["done"][0], a.key.to_string());
        assert!(state.is_done(&a.key).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_payload_is_not_retryable() {
        let queue = temp_queue().await;
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        let id = queue.enqueue_flow(&FlowNode::new("batch", "b", json!({}))).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        let err = BatchHandler::new(queue, state)
            .handle(
                &job,
                JobPayload::Embed(EmbedJob {
                    digest: "d".into(),
                    keys_file: PathBuf::from("k"),
                    embeddings_file: PathBuf::from("e"),
                }),
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cluster_retry_after_failed_attempt_reruns_the_script() {
        use std::time::Duration;

        let dir =
            std::env::temp_dir().join(format!("refeed_cluster_retry_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(crate::script::CLUSTER_SCRIPT),
            "if [ -f attempted ]; then echo '[]' > \"$2\"; exit 0; fi\n\
             touch attempted\n\
             echo '[{\"theme\": \"half' > \"$2\"\n\
             exit 3\n",
        )
        .unwrap();
        let handler = ScriptHandler::new(ScriptRunner::new("sh", &dir, Duration::from_secs(10)));
        let queue = temp_queue().await;
        let id = queue.enqueue_flow(&FlowNode::new("cluster", "c", json!({}))).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        let payload = || {
            JobPayload::Cluster(ClusterJob {
                digest: "ai-tech".into(),
                embeddings_file: dir.join("embeddings.csv"),
                clusters_file: dir.join("clusters.json"),
            })
        };

        assert!(handler.handle(&job, payload()).await.is_err());
        assert!(!dir.join("clusters.json").exists());
        handler.handle(&job, payload()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("clusters.json")).unwrap(), "[]\n");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn digest_runs_on_a_spawned_task() {
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        summarized(&state, "g1", "https://a/").await;
        let handler = Arc::new(DigestHandler::new(
            state.clone(),
            Summarizer::new(CannedModel::new(), 0.7),
            &[digest_source()],
        ));
        let path = clusters_file(r#"[{"theme": "Rust", "posts": ["https://a/"]}]"#);

        let task = {
            let handler = handler.clone();
            let job = digest_job(path);
            tokio::spawn(async move { handler.run(job).await })
        };
        let value = task.await.unwrap().unwrap();
        assert_eq!(value["articles"], 1);
    }

    fn digest_source() -> DigestSource {
        DigestSource {
            name: "ai-tech".into(),
            sources: vec!["tildes".into()],
            history_minutes: 60,
            schedule_minutes: 60,
            title: "AI Tech".into(),
            description: "Themes of the day".into(),
        }
    }

    async fn summarized(state: &PipelineState, guid: &str, link: &str) {
        let a = article("tildes", guid, link);
        state.put_article(&a).await.unwrap();
        state
            .put_summary(
                &a.key,
                &SummaryRecord {
                    summary: format!("Summary of {guid}"),
                    tags: vec![],
                    extra: ExtraData::default(),
                    sources: vec![link.into()],
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    fn clusters_file(body: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("refeed_clusters_{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn digest_job(path: PathBuf) -> DigestJob {
        DigestJob {
            digest: "ai-tech".into(),
            article_count: 2,
            clusters_file: path,
            scratch_files: vec![],
        }
    }

    #[tokio::test]
    async fn digest_writes_one_article_per_cluster_and_replaces_previous_run() {
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        summarized(&state, "g1", "https://a/").await;
        summarized(&state, "g2", "https://b/").await;
        let summarizer = Summarizer::new(CannedModel::new(), 0.7);
        let handler = DigestHandler::new(state.clone(), summarizer, &[digest_source()]);
        let body = r#"[
            {"theme": "Compilers", "posts": ["https://a/", "https://b/"]},
            {"theme": "Empty", "posts": []}
        ]"#;

        for _ in 0..2 {
            let path = clusters_file(body);
            let value = handler.run(digest_job(path.clone())).await.unwrap();
            assert_eq!(value["articles"], 1);
            assert!(!path.exists());
        }

        let publisher = ResultPublisher::new(state);
        let items = publisher.feed_items("ai-tech").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].article.title, "Digest title");
        assert_eq!(items[0].article.link, "https://a/");
        assert_eq!(items[0].summary.sources, vec!["https://a/", "https://b/"]);
        assert_eq!(items[0].summary.tags[0].tag, "Compilers");
        assert_eq!(publisher.snapshot("ai-tech").await.unwrap().title, "AI Tech");
    }

    #[tokio::test]
    async fn digest_with_unknown_link_fails_before_writing() {
        let state = PipelineState::new(Arc::new(MemoryStore::new()), None);
        summarized(&state, "g1", "https://a/").await;
        let model = CannedModel::new();
        let summarizer = Summarizer::new(model.clone(), 0.7);
        let handler = DigestHandler::new(state.clone(), summarizer, &[digest_source()]);
        let path = clusters_file(r#"[{"theme": "X", "posts": ["https://a/", "https://gone/"]}]"#);

        let err = handler.run(digest_job(path.clone())).await.unwrap_err();
        assert!(err.to_string().contains("https://gone/"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert!(state.get_feed_snapshot("ai-tech").await.unwrap().is_none());
        std::fs::remove_file(path).unwrap();
    }
}
