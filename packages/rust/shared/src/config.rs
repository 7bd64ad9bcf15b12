//! Application configuration for refeed.
//!
//! User config lives at `~/.refeed/refeed.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RefeedError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "refeed.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".refeed";

// ---------------------------------------------------------------------------
// Config structs (matching refeed.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Persistent state and artifact storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Page renderer settings.
    #[serde(default)]
    pub renderer: RendererConfig,

    /// Language-model API settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// External embedding/clustering scripts.
    #[serde(default)]
    pub clusterer: ClustererConfig,

    /// Per-stage worker settings, keyed by stage name.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Polled feed sources.
    #[serde(default)]
    pub feeds: Vec<FeedSource>,

    /// AI digest definitions.
    #[serde(default)]
    pub digests: Vec<DigestSource>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for the database, artifacts, and scratch files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Feed polling cadence when a source does not set its own.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_minutes: u64,

    /// Upper bound on items taken from one feed per poll.
    #[serde(default = "default_max_articles")]
    pub max_articles_per_poll: usize,

    /// Articles per batch flow.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Lifetime of an article busy-lock. `0` means the lock never expires.
    #[serde(default = "default_busy_lock_ttl")]
    pub busy_lock_ttl_minutes: u64,

    /// How long an idle worker sleeps before polling its queue again.
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,

    /// Completed flows older than this are pruned.
    #[serde(default = "default_retention")]
    pub completed_job_retention_hours: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poll_interval_minutes: default_poll_interval(),
            max_articles_per_poll: default_max_articles(),
            chunk_size: default_chunk_size(),
            busy_lock_ttl_minutes: default_busy_lock_ttl(),
            worker_poll_ms: default_worker_poll_ms(),
            completed_job_retention_hours: default_retention(),
        }
    }
}

impl DefaultsConfig {
    /// Busy-lock lifetime, `None` when locks never expire.
    pub fn busy_lock_ttl(&self) -> Option<Duration> {
        match self.busy_lock_ttl_minutes {
            0 => None,
            m => Some(Duration::from_secs(m * 60)),
        }
    }

    /// Data directory with a leading `~` expanded.
    pub fn data_dir_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

fn default_data_dir() -> String {
    "~/.refeed/data".into()
}
fn default_poll_interval() -> u64 {
    60
}
fn default_max_articles() -> usize {
    1000
}
fn default_chunk_size() -> usize {
    20
}
fn default_busy_lock_ttl() -> u64 {
    24 * 60
}
fn default_worker_poll_ms() -> u64 {
    500
}
fn default_retention() -> u64 {
    16
}

/// Where fetched artifacts are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackend {
    /// One JSON file plus one PNG per resource under `artifacts_dir`.
    #[default]
    Filesystem,
    /// `page:` / `screenshot:` entries in the state store.
    State,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file, relative paths resolve under `data_dir`.
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub artifact_backend: ArtifactBackend,

    /// Artifact directory for the filesystem backend, relative to `data_dir`.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            artifact_backend: ArtifactBackend::default(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

fn default_database() -> String {
    "refeed.db".into()
}
fn default_artifacts_dir() -> String {
    "artifacts".into()
}

/// Which renderer turns an address into HTML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Headless Chrome subprocess with screenshot capture.
    #[default]
    Chrome,
    /// Plain HTTP GET, no script execution and no preview.
    Http,
}

/// `[renderer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default)]
    pub kind: RendererKind,

    /// Chrome/Chromium executable.
    #[serde(default = "default_chrome_bin")]
    pub chrome_bin: String,

    /// Navigation timeout per render.
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout_secs: u64,

    /// Capture a preview image alongside the DOM.
    #[serde(default = "default_true")]
    pub screenshot: bool,

    /// Pandoc executable for the readable-text round trip. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pandoc_bin: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            kind: RendererKind::default(),
            chrome_bin: default_chrome_bin(),
            navigation_timeout_secs: default_navigation_timeout(),
            screenshot: true,
            pandoc_bin: None,
            user_agent: default_user_agent(),
        }
    }
}

fn default_chrome_bin() -> String {
    "chromium".into()
}
fn default_navigation_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_user_agent() -> String {
    format!("refeed/{}", env!("CARGO_PKG_VERSION"))
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for article summaries and tags.
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for digest articles.
    #[serde(default = "default_model")]
    pub digest_model: String,

    /// Hard wall-clock limit per completion call.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Prompts longer than this are cut from the end.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Tags below this confidence are dropped.
    #[serde(default = "default_tag_confidence")]
    pub min_tag_confidence: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            digest_model: default_model(),
            timeout_secs: default_llm_timeout(),
            max_prompt_chars: default_max_prompt_chars(),
            min_tag_confidence: default_tag_confidence(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_llm_timeout() -> u64 {
    90
}
fn default_max_prompt_chars() -> usize {
    // roughly 13k tokens
    52_000
}
fn default_tag_confidence() -> f64 {
    0.7
}

/// `[clusterer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClustererConfig {
    #[serde(default = "default_python")]
    pub python: String,

    /// Directory containing `embeddings.py` and `cluster.py`.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,

    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClustererConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            scripts_dir: default_scripts_dir(),
            timeout_secs: default_script_timeout(),
        }
    }
}

fn default_python() -> String {
    "python3".into()
}
fn default_scripts_dir() -> String {
    "~/.refeed/scripts".into()
}
fn default_script_timeout() -> u64 {
    900
}

/// `[workers.<stage>]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Maximum jobs of this stage running at once.
    pub concurrency: usize,
    /// Total attempts including the first.
    pub attempts: u32,
    /// Base delay for exponential backoff.
    pub backoff_ms: u64,
    /// Per-attempt wall-clock limit.
    pub timeout_secs: u64,
}

impl WorkerConfig {
    const fn new(concurrency: usize, attempts: u32, backoff_ms: u64, timeout_secs: u64) -> Self {
        Self {
            concurrency,
            attempts,
            backoff_ms,
            timeout_secs,
        }
    }
}

/// `[workers]` section. Missing stages fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkersConfig(pub BTreeMap<String, WorkerConfig>);

impl WorkersConfig {
    /// Settings for `stage`, falling back to the built-in table.
    pub fn for_stage(&self, stage: &str) -> WorkerConfig {
        self.0
            .get(stage)
            .cloned()
            .unwrap_or_else(|| default_worker(stage))
    }
}

/// Built-in per-stage worker defaults.
pub fn default_worker(stage: &str) -> WorkerConfig {
    match stage {
        "fetch" => WorkerConfig::new(6, 5, 1200, 180),
        "summarize" => WorkerConfig::new(10, 5, 1200, 300),
        "batch" => WorkerConfig::new(1, 3, 1000, 60),
        "embed" | "cluster" => WorkerConfig::new(1, 1, 1000, 1800),
        "digest" => WorkerConfig::new(1, 1, 1000, 3600),
        _ => WorkerConfig::new(1, 1, 1000, 300),
    }
}

/// `[[feeds]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    /// Short identifier used in keys (`article:<name>:...`).
    pub name: String,
    /// Feed document address.
    pub url: String,
    /// Polling cadence; falls back to `defaults.poll_interval_minutes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_minutes: Option<u64>,
    /// Items newer than this are left for a later poll.
    #[serde(default)]
    pub min_age_minutes: u64,
    /// Cap on items taken per poll; falls back to `defaults.max_articles_per_poll`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_articles: Option<usize>,
}

/// `[[digests]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSource {
    /// Output feed name.
    pub name: String,
    /// Feed names whose summarized articles feed the digest.
    pub sources: Vec<String>,
    /// Only articles published within this window are considered.
    #[serde(default = "default_history")]
    pub history_minutes: u64,
    #[serde(default = "default_digest_schedule")]
    pub schedule_minutes: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

fn default_history() -> u64 {
    24 * 60
}
fn default_digest_schedule() -> u64 {
    12 * 60
}

impl AppConfig {
    /// Look up a feed source by name.
    pub fn feed(&self, name: &str) -> Option<&FeedSource> {
        self.feeds.iter().find(|f| f.name == name)
    }

    /// Look up a digest definition by name.
    pub fn digest(&self, name: &str) -> Option<&DigestSource> {
        self.digests.iter().find(|d| d.name == name)
    }

    /// Resolved database file path.
    pub fn database_path(&self) -> PathBuf {
        resolve_under(&self.defaults.data_dir_path(), &self.storage.database)
    }

    /// Resolved artifact directory.
    pub fn artifacts_path(&self) -> PathBuf {
        resolve_under(&self.defaults.data_dir_path(), &self.storage.artifacts_dir)
    }

    /// Directory for conversion and digest scratch files.
    pub fn scratch_path(&self) -> PathBuf {
        self.defaults.data_dir_path().join("scratch")
    }

    /// Check cross-references and value ranges.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for feed in &self.feeds {
            if feed.name.is_empty() || feed.name.contains(':') {
                return Err(RefeedError::config(format!(
                    "feed name {:?} must be non-empty and must not contain ':'",
                    feed.name
                )));
            }
            if !seen.insert(feed.name.as_str()) {
                return Err(RefeedError::config(format!(
                    "duplicate feed name {:?}",
                    feed.name
                )));
            }
            url::Url::parse(&feed.url).map_err(|e| {
                RefeedError::config(format!("feed {:?} has invalid url: {e}", feed.name))
            })?;
        }
        for digest in &self.digests {
            if !seen.insert(digest.name.as_str()) {
                return Err(RefeedError::config(format!(
                    "digest name {:?} clashes with another feed",
                    digest.name
                )));
            }
            if let Some(missing) = digest.sources.iter().find(|s| self.feed(s).is_none()) {
                return Err(RefeedError::config(format!(
                    "digest {:?} references unknown feed {missing:?}",
                    digest.name
                )));
            }
        }
        if self.defaults.chunk_size == 0 {
            return Err(RefeedError::config("defaults.chunk_size must be at least 1"));
        }
        for (stage, worker) in &self.workers.0 {
            if worker.concurrency == 0 || worker.attempts == 0 {
                return Err(RefeedError::config(format!(
                    "workers.{stage} needs concurrency and attempts of at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn resolve_under(root: &Path, value: &str) -> PathBuf {
    let path = expand_home(value);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.refeed/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RefeedError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.refeed/refeed.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RefeedError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| RefeedError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| RefeedError::io(dir, e))?;
    }

    let path = path.to_path_buf();
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RefeedError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RefeedError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the language-model API key from the configured env var.
pub fn api_key(config: &LlmConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(RefeedError::config(format!(
            "language model API key not found. Set the {var_name} environment variable."
        ))),
    }
}
