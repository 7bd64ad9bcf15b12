//! Renderers turn a resource address into a DOM snapshot and optional preview.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use refeed_shared::{RefeedError, RendererConfig, Result};

use crate::scratch::{ScratchDir, ScratchFile};

/// Output of one render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub html: String,
    /// PNG bytes, when the renderer captures previews.
    pub screenshot: Option<Vec<u8>>,
}

/// The heavyweight collaborator behind a fetch.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, address: &str) -> Result<RenderedPage>;
}

/// Parse `address` and reject anything that is not http(s).
fn parse_address(address: &str) -> Result<Url> {
    let url = Url::parse(address)
        .map_err(|e| RefeedError::permanent(format!("invalid address {address:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RefeedError::permanent(format!(
            "only http/https addresses can be fetched, got {other}: {address}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// HTTP renderer
// ---------------------------------------------------------------------------

/// Plain GET renderer. No scripts run and no preview is captured.
pub struct HttpRenderer {
    client: Client,
    /// Allow localhost/private IPs (for tests against mock servers).
    allow_private: bool,
}

impl HttpRenderer {
    pub fn new(config: &RendererConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.navigation_timeout_secs))
            .build()
            .map_err(|e| RefeedError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_private: false,
        })
    }

    /// Allow fetching localhost/private IPs.
    pub fn allow_private(mut self) -> Self {
        self.allow_private = true;
        self
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, address: &str) -> Result<RenderedPage> {
        let url = parse_address(address)?;
        if !self.allow_private && is_private_target(&url) {
            return Err(RefeedError::permanent(format!(
                "refusing to fetch private address {address}"
            )));
        }
        debug!(address, "http render");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RefeedError::transient(address, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {status}");
            // Client errors other than throttling will not fix themselves.
            return Err(
                if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 {
                    RefeedError::permanent(format!("{address}: {message}"))
                } else {
                    RefeedError::transient(address, message)
                },
            );
        }

        let html = response
            .text()
            .await
            .map_err(|e| RefeedError::transient(address, format!("body read failed: {e}")))?;

        Ok(RenderedPage {
            html,
            screenshot: None,
        })
    }
}

/// Whether a URL targets loopback, private, or local-only hosts.
fn is_private_target(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return is_private_ip(&ip);
    }
    host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Last `max` characters of `s`.
pub fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s.trim();
    }
    let start = s
        .char_indices()
        .nth(count - max)
        .map(|(i, _)| i)
        .unwrap_or(0);
    s[start..].trim()
}

// ---------------------------------------------------------------------------
// Headless Chrome renderer
// ---------------------------------------------------------------------------

/// Renders with a headless Chrome subprocess per call.
///
/// The DOM comes from `--dump-dom`; the preview from a second `--screenshot`
/// run. Each run gets its own throwaway profile directory, and the child is
/// killed if the navigation timeout fires.
pub struct ChromeRenderer {
    bin: String,
    timeout: Duration,
    screenshot: bool,
    scratch_dir: PathBuf,
}

impl ChromeRenderer {
    pub fn new(config: &RendererConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: config.chrome_bin.clone(),
            timeout: Duration::from_secs(config.navigation_timeout_secs),
            screenshot: config.screenshot,
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn run(&self, address: &str, extra: &[String]) -> Result<Vec<u8>> {
        let profile = ScratchDir::create(&self.scratch_dir, address).await?;
        let mut command = tokio::process::Command::new(&self.bin);
        command
            .args([
                "--headless",
                "--no-sandbox",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--hide-scrollbars",
            ])
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .args(extra)
            .arg(address)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                RefeedError::transient(
                    address,
                    format!("navigation timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| {
                RefeedError::transient(address, format!("failed to run {}: {e}", self.bin))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RefeedError::transient(
                address,
                format!("chrome exited with {}: {}", output.status, tail(&stderr, 400)),
            ));
        }
        Ok(output.stdout)
    }

    async fn capture_preview(&self, address: &str) -> Result<Vec<u8>> {
        let shot = ScratchFile::reserve(&self.scratch_dir, address, "png");
        self.run(
            address,
            &[
                format!("--screenshot={}", shot.path().display()),
                "--window-size=1280,2000".to_string(),
            ],
        )
        .await?;
        shot.read().await
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&self, address: &str) -> Result<RenderedPage> {
        parse_address(address)?;
        debug!(address, bin = %self.bin, "chrome render");

        let dom = self.run(address, &["--dump-dom".to_string()]).await?;
        if dom.is_empty() {
            return Err(RefeedError::transient(address, "chrome returned an empty DOM"));
        }
        let html = String::from_utf8_lossy(&dom).into_owned();

        let screenshot = if self.screenshot {
            match self.capture_preview(address).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(address, error = %e, "preview capture failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(RenderedPage { html, screenshot })
    }
}
