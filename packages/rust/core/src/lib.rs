//! Pipeline orchestration and domain logic for refeed.
//!
//! This crate ties feeds, fetching, storage, and publishing together into
//! job flows: a feed poll becomes `batch ← summarize ← fetch` flows on the
//! durable queue, a digest becomes `digest ← cluster ← embed`, and one
//! bounded [`WorkerPool`] per stage executes them.

pub mod digest;
pub mod handlers;
pub mod ingest;
pub mod jobs;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod script;
pub mod summarize;
pub mod worker;

pub use digest::DigestScheduler;
pub use ingest::{FeedIngester, PollReport};
pub use jobs::{JobPayload, Stage};
pub use llm::{LanguageModel, OpenAiClient};
pub use orchestrator::JobOrchestrator;
pub use pipeline::{JanitorReport, Pipeline, ProgressReporter, SilentProgress, language_model};
pub use retry::{RetryDecision, RetryPolicy};
pub use summarize::Summarizer;
pub use worker::{PoolSettings, StageHandler, WorkerPool};
