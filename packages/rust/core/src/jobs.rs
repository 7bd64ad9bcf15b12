//! Stages and their typed job payloads.
//!
//! Every job row stores one [`JobPayload`] as JSON. The `stage` tag must
//! match the queue the job sits in; [`JobPayload::from_job`] checks that.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use refeed_shared::{ArticleKey, ArticleRecord, RefeedError, Result};
use refeed_storage::Job;

/// A pipeline stage. Each stage has its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// One feed-poll chunk; runs after all its summaries.
    Batch,
    Summarize,
    Fetch,
    Embed,
    Cluster,
    Digest,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Batch,
        Stage::Summarize,
        Stage::Fetch,
        Stage::Embed,
        Stage::Cluster,
        Stage::Digest,
    ];

    /// Queue name, also the `[workers.<stage>]` config key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Summarize => "summarize",
            Self::Fetch => "fetch",
            Self::Embed => "embed",
            Self::Cluster => "cluster",
            Self::Digest => "digest",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub feed: String,
    pub chunk_index: usize,
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeJob {
    pub feed: String,
    pub article: ArticleRecord,
    pub article_key: ArticleKey,
    /// Primary resource (the article link).
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchJob {
    pub feed: String,
    pub article: ArticleRecord,
    pub address: String,
    /// Section heading used when the resource is assembled into a prompt.
    pub heading: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedJob {
    pub digest: String,
    /// Newline-separated article keys.
    pub keys_file: PathBuf,
    pub embeddings_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterJob {
    pub digest: String,
    pub embeddings_file: PathBuf,
    pub clusters_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestJob {
    pub digest: String,
    /// Article keys that went into the keys file, for operator visibility.
    pub article_count: usize,
    pub clusters_file: PathBuf,
    /// Scratch files removed once the digest is written.
    #[serde(default)]
    pub scratch_files: Vec<PathBuf>,
}

/// Tagged payload of every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobPayload {
    Batch(BatchJob),
    Summarize(SummarizeJob),
    Fetch(FetchJob),
    Embed(EmbedJob),
    Cluster(ClusterJob),
    Digest(DigestJob),
}

impl JobPayload {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Batch(_) => Stage::Batch,
            Self::Summarize(_) => Stage::Summarize,
            Self::Fetch(_) => Stage::Fetch,
            Self::Embed(_) => Stage::Embed,
            Self::Cluster(_) => Stage::Cluster,
            Self::Digest(_) => Stage::Digest,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stored job, rejecting payloads filed under the wrong queue.
    pub fn from_job(job: &Job) -> Result<Self> {
        let payload: JobPayload = serde_json::from_value(job.payload.clone())?;
        if payload.stage().as_str() != job.queue {
            return Err(RefeedError::validation(format!(
                "job {} in queue {} carries a {} payload",
                job.id,
                job.queue,
                payload.stage()
            )));
        }
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Results passed from child to parent
// ---------------------------------------------------------------------------

/// Result of a fetch job, read by its summarize parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub address: String,
    pub heading: String,
}

/// Result of a summarize job, read by its batch parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeOutcome {
    pub article_key: ArticleKey,
}
