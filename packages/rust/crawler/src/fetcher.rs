//! Idempotent resource fetch.
//!
//! `fetch(address)` serves a cached artifact when the address is `DONE`.
//! Otherwise it marks the address `BUSY`, renders and extracts, persists the
//! artifact, and only then marks it `DONE`. Any failure marks it `ERROR` and
//! is returned to the caller unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use refeed_shared::{FetchState, RefeedError, ResourceArtifact, Result};
use refeed_storage::{ArtifactStore, PipelineState};

use crate::convert::DocumentConverter;
use crate::extract;
use crate::render::Renderer;

/// Operator notifications published by [`ResourceFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Served from the artifact store without rendering.
    CacheHit { address: String },
    /// Rendered, extracted, and stored.
    Fetched { address: String, elapsed_ms: u64 },
    /// Marked `ERROR`.
    Failed { address: String, error: String },
}

pub struct ResourceFetcher {
    state: PipelineState,
    artifacts: Arc<dyn ArtifactStore>,
    renderer: Arc<dyn Renderer>,
    converter: Option<Arc<dyn DocumentConverter>>,
    /// Wall-clock limit for render plus extraction, so a hang still ends in `ERROR`.
    deadline: Duration,
    events: broadcast::Sender<FetchEvent>,
}

impl ResourceFetcher {
    pub fn new(
        state: PipelineState,
        artifacts: Arc<dyn ArtifactStore>,
        renderer: Arc<dyn Renderer>,
        deadline: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state,
            artifacts,
            renderer,
            converter: None,
            deadline,
            events,
        }
    }

    /// Run rendered HTML through `converter` before readable-text extraction.
    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FetchEvent> {
        self.events.subscribe()
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    fn emit(&self, event: FetchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    #[instrument(skip_all, fields(address = %address))]
    pub async fn fetch(&self, address: &str) -> Result<ResourceArtifact> {
        match self.state.fetch_state(address).await? {
            FetchState::Done => {
                if let Some(artifact) = self.artifacts.get(address).await? {
                    info!(address, "cache hit");
                    self.emit(FetchEvent::CacheHit {
                        address: address.to_string(),
                    });
                    return Ok(artifact);
                }
                warn!(address, "marked DONE but artifact is missing, fetching again");
            }
            FetchState::Busy => {
                debug!(address, "previous attempt left BUSY, taking over");
            }
            FetchState::Error => debug!(address, "retrying after ERROR"),
            FetchState::Unknown => {}
        }

        self.state.set_fetch_state(address, FetchState::Busy).await?;
        let started = Instant::now();

        let outcome = match self.produce(address).await {
            Ok(artifact) => self
                .state
                .set_fetch_state(address, FetchState::Done)
                .await
                .map(|()| artifact),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(artifact) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(address, elapsed_ms, links = artifact.links.len(), "fetched");
                self.emit(FetchEvent::Fetched {
                    address: address.to_string(),
                    elapsed_ms,
                });
                Ok(artifact)
            }
            Err(e) => {
                let recorded = self.state.set_fetch_state(address, FetchState::Error).await;
                if let Err(state_err) = recorded {
                    warn!(address, error = %state_err, "could not record ERROR state");
                }
                warn!(address, error = %e, "fetch failed");
                self.emit(FetchEvent::Failed {
                    address: address.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Render, extract, and persist. The artifact is stored before returning.
    async fn produce(&self, address: &str) -> Result<ResourceArtifact> {
        let rendering = self.render_and_extract(address);
        let (artifact, preview) = tokio::time::timeout(self.deadline, rendering)
            .await
            .map_err(|_| RefeedError::Timeout {
                operation: format!("fetch {address}"),
                after: self.deadline,
            })??;

        self.artifacts.put(address, &artifact).await?;
        if let Some(bytes) = preview {
            self.artifacts.put_preview(address, &bytes).await?;
        }
        Ok(artifact)
    }

    async fn render_and_extract(
        &self,
        address: &str,
    ) -> Result<(ResourceArtifact, Option<Vec<u8>>)> {
        let page = self.renderer.render(address).await?;

        let readable_source = match &self.converter {
            Some(converter) => converter.normalize(address, &page.html).await?,
            None => page.html.clone(),
        };

        let artifact = ResourceArtifact {
            address: address.to_string(),
            links: extract::extract_links(&page.html, address),
            media: extract::extract_media(&page.html, address),
            readable: extract::extract_readable(&readable_source)?,
            content: page.html,
            fetched_at: Utc::now(),
        };
        Ok((artifact, page.screenshot))
    }
}
