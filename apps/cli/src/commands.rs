//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use refeed_core::{Pipeline, PollReport, ProgressReporter, language_model};
use refeed_crawler::FetchEvent;
use refeed_shared::{
    AppConfig, ArticleKey, RefeedError, config_file_path, init_config_at, load_config,
    load_config_from,
};
use refeed_storage::{Job, JobStatus};
use tokio::sync::watch;
use tracing::{info, warn};

const WAIT_POLL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// refeed: summarized feeds and AI digests from the feeds you read.
#[derive(Parser)]
#[command(
    name = "refeed",
    version,
    about = "Poll feeds, fetch and summarize their articles, and publish the results.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.refeed/refeed.toml).
    #[arg(long, global = true, env = "REFEED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run workers plus the feed, digest, and retention schedules until Ctrl-C.
    Run,

    /// Poll feeds once and submit their new articles.
    Poll {
        /// Only this feed (defaults to every configured feed).
        #[arg(long)]
        feed: Option<String>,

        /// Run workers until the submitted batches settle.
        #[arg(long)]
        wait: bool,
    },

    /// Fetch one address through the cache and show what was extracted.
    Fetch {
        url: String,
    },

    /// Show job counts per stage and status.
    Status {
        /// List failed jobs with their errors.
        #[arg(long)]
        failed: bool,

        /// Maximum failed jobs to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Drop the busy-lock of an article so the next poll can take it again.
    Release {
        /// Article key, `<feed>:<index>`.
        key: String,
    },

    /// Reset an address stuck in ERROR so it can be fetched again.
    ClearError {
        url: String,
    },

    /// Write a feed's summaries as an Atom document.
    Publish {
        feed: String,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Value for the feed's id and self link.
        #[arg(long)]
        self_link: Option<String>,
    },

    /// Submit a digest now.
    Digest {
        name: String,

        /// Run workers until the digest settles.
        #[arg(long)]
        wait: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "refeed=info",
        1 => "refeed=debug",
        _ => "refeed=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.as_deref();
    match cli.command {
        Command::Run => cmd_run(&open(path).await?).await,
        Command::Poll { feed, wait } => cmd_poll(&open(path).await?, feed.as_deref(), wait).await,
        Command::Fetch { url } => cmd_fetch(&open(path).await?, &url).await,
        Command::Status { failed, limit } => cmd_status(&open(path).await?, failed, limit).await,
        Command::Release { key } => cmd_release(&open(path).await?, &key).await,
        Command::ClearError { url } => cmd_clear_error(&open(path).await?, &url).await,
        Command::Publish { feed, out, self_link } => {
            cmd_publish(&open(path).await?, &feed, out.as_deref(), self_link.as_deref()).await
        }
        Command::Digest { name, wait } => cmd_digest(&open(path).await?, &name, wait).await,
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(path, force),
            ConfigAction::Show => cmd_config_show(path),
        },
    }
}

async fn open(path: Option<&Path>) -> Result<Pipeline> {
    Ok(Pipeline::open(load(path)?).await?)
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn feed_polled(&self, report: &PollReport) {
        self.spinner.println(format!(
            "  {}: {} entries, {} accepted, {} batches",
            report.feed,
            report.entries,
            report.accepted,
            report.batches.len()
        ));
    }

    fn feed_failed(&self, feed: &str, error: &RefeedError) {
        self.spinner.println(format!("  {feed}: poll failed: {error}"));
    }

    fn digest_submitted(&self, digest: &str, job_id: Option<&str>) {
        match job_id {
            Some(id) => self.spinner.println(format!("  {digest}: digest submitted ({id})")),
            None => self.spinner.println(format!("  {digest}: nothing recent to digest")),
        }
    }

    fn fetch_event(&self, event: &FetchEvent) {
        match event {
            FetchEvent::CacheHit { address } => {
                self.spinner.set_message(format!("Cached {address}"))
            }
            FetchEvent::Fetched { address, elapsed_ms } => {
                self.spinner.set_message(format!("Fetched {address} in {elapsed_ms}ms"))
            }
            FetchEvent::Failed { address, error } => {
                self.spinner.println(format!("  fetch failed: {address}: {error}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(pipeline: &Pipeline) -> Result<()> {
    let model = language_model(&pipeline.config().llm)?;
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, draining workers");
            let _ = stop.send(true);
        }
    });

    info!(
        feeds = pipeline.config().feeds.len(),
        digests = pipeline.config().digests.len(),
        "starting refeed"
    );
    let progress = CliProgress::new();
    let outcome = pipeline.run(model, &progress, shutdown).await;
    progress.finish();
    outcome?;
    Ok(())
}

/// Run every worker pool until `job_ids` settle or Ctrl-C.
async fn run_until_settled(
    pipeline: &Pipeline,
    job_ids: &[String],
    progress: &CliProgress,
) -> Result<Vec<Job>> {
    let model = language_model(&pipeline.config().llm)?;
    pipeline.recover().await?;
    let (stop, shutdown) = watch::channel(false);
    let workers = pipeline.spawn_workers(model, shutdown);

    let waiting = async {
        let mut settled = Vec::with_capacity(job_ids.len());
        for (i, id) in job_ids.iter().enumerate() {
            progress.phase(&format!("Waiting for job {}/{} ({id})", i + 1, job_ids.len()));
            settled.push(pipeline.orchestrator().wait_for(id, WAIT_POLL).await?);
        }
        Ok::<_, RefeedError>(settled)
    };
    let outcome = tokio::select! {
        settled = waiting => settled.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            Err(eyre!("interrupted; unfinished jobs resume on the next run"))
        }
    };

    progress.phase("Draining workers");
    let _ = stop.send(true);
    for handle in workers {
        handle.await?;
    }
    outcome
}

async fn cmd_poll(pipeline: &Pipeline, feed: Option<&str>, wait: bool) -> Result<()> {
    let names: Vec<String> = match feed {
        Some(name) => vec![name.to_string()],
        None => pipeline.config().feeds.iter().map(|f| f.name.clone()).collect(),
    };
    if names.is_empty() {
        return Err(eyre!("no feeds configured; add [[feeds]] entries to the config"));
    }

    let progress = CliProgress::new();
    let mut batches = Vec::new();
    for name in &names {
        progress.phase(&format!("Polling {name}"));
        match pipeline.poll_feed(name).await {
            Ok(report) => {
                progress.feed_polled(&report);
                batches.extend(report.batches);
            }
            Err(e) => {
                warn!(feed = %name, error = %e, "poll failed");
                progress.feed_failed(name, &e);
            }
        }
    }

    if wait && !batches.is_empty() {
        run_until_settled(pipeline, &batches, &progress).await?;
        progress.finish();
        println!();
        for id in &batches {
            let report = pipeline.orchestrator().batch_report(id).await?;
            println!(
                "  batch {id}: {} ({} ok, {} failed)",
                report.status,
                report.completed.len(),
                report.failed.len()
            );
            for failed in &report.failed {
                println!("    {}: {}", failed.name, failed.error);
            }
        }
    } else {
        progress.finish();
        println!("  {} batches submitted", batches.len());
    }
    Ok(())
}

async fn cmd_fetch(pipeline: &Pipeline, url: &str) -> Result<()> {
    let progress = CliProgress::new();
    progress.phase(&format!("Fetching {url}"));
    let outcome = pipeline.fetcher().fetch(url).await;
    progress.finish();
    let artifact = outcome?;

    println!();
    println!("  Address: {}", artifact.address);
    println!("  Title:   {}", artifact.readable.title);
    println!("  Text:    {} chars", artifact.readable.text.chars().count());
    println!("  Links:   {}", artifact.links.len());
    println!("  Media:   {}", artifact.media.len());
    println!("  Fetched: {}", artifact.fetched_at.to_rfc3339());
    println!("  State:   {}", pipeline.state().fetch_state(url).await?);
    println!();
    Ok(())
}

async fn cmd_status(pipeline: &Pipeline, failed: bool, limit: u32) -> Result<()> {
    let counts = pipeline.queue().counts().await?;
    if counts.is_empty() {
        println!("  no jobs");
    }
    for count in &counts {
        println!("  {:<10} {:<17} {:>6}", count.queue, count.status.as_str(), count.count);
    }

    if failed {
        println!();
        let jobs = pipeline.queue().list(None, Some(JobStatus::Failed), limit).await?;
        if jobs.is_empty() {
            println!("  no failed jobs");
        }
        for job in jobs {
            println!(
                "  {} {:<9} {} (attempts {}): {}",
                job.id,
                job.queue,
                job.name,
                job.attempts,
                job.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn cmd_release(pipeline: &Pipeline, key: &str) -> Result<()> {
    let key: ArticleKey = key.parse()?;
    if pipeline.state().release(&key).await? {
        println!("  released {key}");
    } else {
        println!("  {key} was not claimed");
    }
    Ok(())
}

async fn cmd_clear_error(pipeline: &Pipeline, url: &str) -> Result<()> {
    if pipeline.state().clear_error(url).await? {
        println!("  cleared ERROR for {url}");
    } else {
        println!("  {url} is {}, nothing to clear", pipeline.state().fetch_state(url).await?);
    }
    Ok(())
}

async fn cmd_publish(
    pipeline: &Pipeline,
    feed: &str,
    out: Option<&Path>,
    self_link: Option<&str>,
) -> Result<()> {
    let self_link = self_link.map(str::to_string).unwrap_or_else(|| format!("urn:refeed:{feed}"));
    let xml = pipeline.publisher().render(feed, &self_link).await?;
    match out {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, xml)?;
            info!(feed, path = %path.display(), "feed written");
            println!("  wrote {}", path.display());
        }
        None => println!("{xml}"),
    }
    Ok(())
}

async fn cmd_digest(pipeline: &Pipeline, name: &str, wait: bool) -> Result<()> {
    let Some(id) = pipeline.submit_digest(name).await? else {
        println!("  {name}: nothing recent to digest");
        return Ok(());
    };
    println!("  {name}: digest submitted ({id})");

    if wait {
        let progress = CliProgress::new();
        let settled = run_until_settled(pipeline, std::slice::from_ref(&id), &progress).await?;
        progress.finish();
        for job in settled {
            match job.status {
                JobStatus::Completed => println!("  {name}: {}", job.result.unwrap_or_default()),
                _ => println!("  {name}: {} {}", job.status, job.error.unwrap_or_default()),
            }
        }
    }
    Ok(())
}

fn cmd_config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    if path.exists() && !force {
        return Err(eyre!("{} already exists; pass --force to overwrite", path.display()));
    }
    let path = init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = load(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
