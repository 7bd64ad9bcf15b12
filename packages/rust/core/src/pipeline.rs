//! Process wiring: storage, queue, fetcher, and one worker pool per stage,
//! plus the scheduling loops behind `refeed run`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use refeed_crawler::{
    ChromeRenderer, DocumentConverter, FetchEvent, HttpRenderer, PandocConverter, Renderer,
    ResourceFetcher, sweep_stale,
};
use refeed_feeds::FeedClient;
use refeed_publisher::ResultPublisher;
use refeed_shared::{
    AppConfig, ArtifactBackend, DigestSource, FeedSource, LlmConfig, RefeedError, RendererKind,
    Result, api_key,
};
use refeed_storage::{
    ArtifactStore, FsArtifactStore, JobQueue, PipelineState, StateArtifactStore, StateStore,
    Storage,
};

use crate::digest::DigestScheduler;
use crate::handlers::{BatchHandler, DigestHandler, FetchHandler, ScriptHandler, SummarizeHandler};
use crate::ingest::{FeedIngester, PollReport};
use crate::jobs::Stage;
use crate::llm::{LanguageModel, OpenAiClient};
use crate::orchestrator::JobOrchestrator;
use crate::script::ScriptRunner;
use crate::summarize::Summarizer;
use crate::worker::{PoolSettings, StageHandler, WorkerPool};

const JANITOR_PERIOD: Duration = Duration::from_secs(3600);
/// Scratch entries younger than this may still belong to a queued flow.
const SCRATCH_MIN_AGE: Duration = Duration::from_secs(24 * 3600);

/// What one janitor pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    /// Jobs of completed flows past retention.
    pub pruned: u64,
    /// Expired state keys.
    pub purged: u64,
    /// Stale scratch files and directories.
    pub swept: u64,
}

/// Progress callback for operator-facing output.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    fn feed_polled(&self, report: &PollReport);
    fn feed_failed(&self, feed: &str, error: &RefeedError);
    /// `job_id` is `None` when there was nothing to digest.
    fn digest_submitted(&self, digest: &str, job_id: Option<&str>);
    fn fetch_event(&self, event: &FetchEvent);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn feed_polled(&self, _report: &PollReport) {}
    fn feed_failed(&self, _feed: &str, _error: &RefeedError) {}
    fn digest_submitted(&self, _digest: &str, _job_id: Option<&str>) {}
    fn fetch_event(&self, _event: &FetchEvent) {}
}

/// Language-model client for the configured endpoint. Only workers need one.
pub fn language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    let key = api_key(config)?;
    Ok(Arc::new(OpenAiClient::new(key, config)?))
}

/// Render budget for one fetch, kept inside the fetch stage's own timeout so
/// a hung render still ends in `ERROR`.
fn fetch_deadline(config: &AppConfig) -> Duration {
    let stage = Duration::from_secs(config.workers.for_stage(Stage::Fetch.as_str()).timeout_secs);
    let render = Duration::from_secs(config.renderer.navigation_timeout_secs.saturating_mul(2));
    render.min(stage.mul_f64(0.9))
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.max(1).saturating_mul(60))
}

fn ticker(first: Instant, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Wait for the next tick. `false` once shutdown has been requested.
async fn next_tick(ticker: &mut Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = ticker.tick() => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}

pub struct Pipeline {
    config: AppConfig,
    storage: Storage,
    state: PipelineState,
    orchestrator: JobOrchestrator,
    fetcher: Arc<ResourceFetcher>,
    ingester: FeedIngester,
    digests: DigestScheduler,
}

impl Pipeline {
    /// Open the database and build collaborators from `config`.
    #[instrument(skip_all)]
    pub async fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(&config.database_path()).await?;
        let store: Arc<dyn StateStore> = Arc::new(storage.clone());

        let artifacts: Arc<dyn ArtifactStore> = match config.storage.artifact_backend {
            ArtifactBackend::Filesystem => {
                Arc::new(FsArtifactStore::open(config.artifacts_path()).await?)
            }
            ArtifactBackend::State => Arc::new(StateArtifactStore::new(store)),
        };

        let scratch = config.scratch_path();
        let renderer: Arc<dyn Renderer> = match config.renderer.kind {
            RendererKind::Chrome => {
                Arc::new(ChromeRenderer::new(&config.renderer, scratch.clone()))
            }
            RendererKind::Http => Arc::new(HttpRenderer::new(&config.renderer)?),
        };
        let converter = config.renderer.pandoc_bin.as_ref().map(|bin| {
            Arc::new(PandocConverter::new(
                bin.clone(),
                scratch.clone(),
                Duration::from_secs(config.renderer.navigation_timeout_secs),
            )) as Arc<dyn DocumentConverter>
        });

        info!(
            database = %config.database_path().display(),
            renderer = ?config.renderer.kind,
            feeds = config.feeds.len(),
            digests = config.digests.len(),
            "pipeline opened"
        );
        Self::from_parts(config, storage, artifacts, renderer, converter)
    }

    /// Assemble a pipeline around explicit collaborators.
    pub fn from_parts(
        config: AppConfig,
        storage: Storage,
        artifacts: Arc<dyn ArtifactStore>,
        renderer: Arc<dyn Renderer>,
        converter: Option<Arc<dyn DocumentConverter>>,
    ) -> Result<Self> {
        let state = PipelineState::new(Arc::new(storage.clone()), config.defaults.busy_lock_ttl());
        let orchestrator = JobOrchestrator::new(JobQueue::new(storage.clone()));

        let deadline = fetch_deadline(&config);
        let mut fetcher = ResourceFetcher::new(state.clone(), artifacts, renderer, deadline);
        if let Some(converter) = converter {
            fetcher = fetcher.with_converter(converter);
        }

        let ingester = FeedIngester::new(
            FeedClient::new()?,
            state.clone(),
            orchestrator.clone(),
            config.defaults.chunk_size,
            config.defaults.max_articles_per_poll,
        );
        let digests =
            DigestScheduler::new(state.clone(), orchestrator.clone(), config.scratch_path());

        Ok(Self {
            config,
            storage,
            state,
            orchestrator,
            fetcher: Arc::new(fetcher),
            ingester,
            digests,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn queue(&self) -> &JobQueue {
        self.orchestrator.queue()
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    pub fn fetcher(&self) -> &Arc<ResourceFetcher> {
        &self.fetcher
    }

    pub fn ingester(&self) -> &FeedIngester {
        &self.ingester
    }

    pub fn publisher(&self) -> ResultPublisher {
        ResultPublisher::new(self.state.clone())
    }

    /// Resume jobs a crashed process left active.
    pub async fn recover(&self) -> Result<u64> {
        self.queue().recover().await
    }

    /// Poll one configured feed now.
    pub async fn poll_feed(&self, name: &str) -> Result<PollReport> {
        let source = self
            .config
            .feed(name)
            .ok_or_else(|| RefeedError::NotFound(format!("feed {name:?} is not configured")))?;
        self.ingester.poll(source).await
    }

    /// Submit one configured digest now.
    pub async fn submit_digest(&self, name: &str) -> Result<Option<String>> {
        let digest = self
            .config
            .digest(name)
            .ok_or_else(|| RefeedError::NotFound(format!("digest {name:?} is not configured")))?;
        self.digests.submit(digest, Utc::now()).await
    }

    /// Prune completed flows past retention, purge expired keys, and sweep
    /// scratch files left by flows that failed before cleaning up.
    pub async fn janitor_pass(&self) -> Result<JanitorReport> {
        let retention = Duration::from_secs(
            self.config
                .defaults
                .completed_job_retention_hours
                .saturating_mul(3600),
        );
        let report = JanitorReport {
            pruned: self.queue().prune_completed(retention).await?,
            purged: self.storage.purge_expired().await?,
            swept: sweep_stale(&self.config.scratch_path(), retention.max(SCRATCH_MIN_AGE))
                .await?,
        };
        info!(
            pruned = report.pruned,
            purged = report.purged,
            swept = report.swept,
            "janitor pass"
        );
        Ok(report)
    }

    /// Start one pool per stage. Each pool stops claiming when `shutdown`
    /// flips and finishes the jobs it is running.
    pub fn spawn_workers(
        &self,
        model: Arc<dyn LanguageModel>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let summarizer = Summarizer::new(model, self.config.llm.min_tag_confidence)
            .with_digest_model(self.config.llm.digest_model.clone());
        let scripts = Arc::new(ScriptHandler::new(ScriptRunner::from_config(
            &self.config.clusterer,
        )));
        let queue = self.queue().clone();
        let poll = Duration::from_millis(self.config.defaults.worker_poll_ms.max(1));

        Stage::ALL
            .iter()
            .map(|&stage| {
                let handler: Arc<dyn StageHandler> = match stage {
                    Stage::Batch => Arc::new(BatchHandler::new(queue.clone(), self.state.clone())),
                    Stage::Summarize => Arc::new(SummarizeHandler::new(
                        queue.clone(),
                        self.state.clone(),
                        self.fetcher.artifacts().clone(),
                        summarizer.clone(),
                    )),
                    Stage::Fetch => Arc::new(FetchHandler::new(self.fetcher.clone())),
                    Stage::Embed | Stage::Cluster => scripts.clone(),
                    Stage::Digest => Arc::new(DigestHandler::new(
                        self.state.clone(),
                        summarizer.clone(),
                        &self.config.digests,
                    )),
                };
                let worker = self.config.workers.for_stage(stage.as_str());
                let settings = PoolSettings::from_config(&worker, poll);
                let pool = Arc::new(WorkerPool::new(stage, queue.clone(), handler, settings));
                tokio::spawn(pool.run(shutdown.clone()))
            })
            .collect()
    }

    /// Recover, start the workers, and run the feed, digest, and janitor
    /// schedules until `shutdown` flips. Returns after the pools drain.
    pub async fn run(
        &self,
        model: Arc<dyn LanguageModel>,
        progress: &dyn ProgressReporter,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        progress.phase("Recovering");
        self.recover().await?;

        progress.phase("Starting workers");
        let workers = self.spawn_workers(model, shutdown.clone());

        progress.phase("Running");
        let mut loops: Vec<BoxFuture<'_, ()>> = Vec::new();
        for source in &self.config.feeds {
            loops.push(self.feed_loop(source, progress, shutdown.clone()).boxed());
        }
        for digest in &self.config.digests {
            loops.push(self.digest_loop(digest, progress, shutdown.clone()).boxed());
        }
        loops.push(self.janitor_loop(shutdown.clone()).boxed());
        loops.push(self.forward_events(progress, shutdown.clone()).boxed());
        join_all(loops).await;

        progress.phase("Draining workers");
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!(error = %e, "worker pool panicked");
            }
        }
        progress.phase("Stopped");
        Ok(())
    }

    async fn feed_loop(
        &self,
        source: &FeedSource,
        progress: &dyn ProgressReporter,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = minutes(
            source
                .schedule_minutes
                .unwrap_or(self.config.defaults.poll_interval_minutes),
        );
        let mut ticker = ticker(Instant::now(), period);
        debug!(feed = %source.name, period_secs = period.as_secs(), "feed schedule started");
        while next_tick(&mut ticker, &mut shutdown).await {
            match self.ingester.poll(source).await {
                Ok(report) => progress.feed_polled(&report),
                Err(e) => {
                    warn!(feed = %source.name, error = %e, "poll failed");
                    progress.feed_failed(&source.name, &e);
                }
            }
        }
    }

    async fn digest_loop(
        &self,
        digest: &DigestSource,
        progress: &dyn ProgressReporter,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = minutes(digest.schedule_minutes);
        let mut ticker = ticker(Instant::now() + period, period);
        while next_tick(&mut ticker, &mut shutdown).await {
            match self.digests.submit(digest, Utc::now()).await {
                Ok(id) => progress.digest_submitted(&digest.name, id.as_deref()),
                Err(e) => warn!(digest = %digest.name, error = %e, "digest submission failed"),
            }
        }
    }

    async fn janitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = ticker(Instant::now(), JANITOR_PERIOD);
        while next_tick(&mut ticker, &mut shutdown).await {
            if let Err(e) = self.janitor_pass().await {
                warn!(error = %e, "janitor pass failed");
            }
        }
    }

    async fn forward_events(
        &self,
        progress: &dyn ProgressReporter,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = self.fetcher.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => progress.fetch_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress fell behind")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}
