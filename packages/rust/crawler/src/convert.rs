//! External document converter used to normalize markup before extraction.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use refeed_shared::{RefeedError, Result};

use crate::render::tail;
use crate::scratch::ScratchFile;

/// Rewrites a rendered document into a cleaner HTML document.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn normalize(&self, address: &str, html: &str) -> Result<String>;
}

/// Pandoc round trip: HTML to GitHub-flavored Markdown without raw HTML,
/// fenced-div lines dropped, then back to HTML.
pub struct PandocConverter {
    bin: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl PandocConverter {
    pub fn new(bin: impl Into<String>, scratch_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            scratch_dir: scratch_dir.into(),
            timeout,
        }
    }

    async fn pandoc(
        &self,
        from: &str,
        to: &str,
        input: &ScratchFile,
        output: &ScratchFile,
    ) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.bin);
        command
            .args(["-f", from, "-t", to, "-o"])
            .arg(output.path())
            .arg(input.path())
            .kill_on_drop(true);

        let out = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| RefeedError::Timeout {
                operation: format!("{} {from} -> {to}", self.bin),
                after: self.timeout,
            })?
            .map_err(|e| RefeedError::Conversion(format!("failed to run {}: {e}", self.bin)))?;

        if !out.status.success() {
            return Err(RefeedError::Conversion(format!(
                "{} {from} -> {to} exited with {}: {}",
                self.bin,
                out.status,
                tail(&String::from_utf8_lossy(&out.stderr), 400)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentConverter for PandocConverter {
    async fn normalize(&self, address: &str, html: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| RefeedError::io(&self.scratch_dir, e))?;

        // Every scratch file is removed when this scope ends, on any path.
        let source = ScratchFile::reserve(&self.scratch_dir, address, "html");
        let markdown = ScratchFile::reserve(&self.scratch_dir, address, "md");
        let rebuilt = ScratchFile::reserve(&self.scratch_dir, address, "out.html");

        source.write(html).await?;
        self.pandoc("html", "gfm-raw_html", &source, &markdown).await?;

        let md = strip_fenced_divs(&markdown.read_to_string().await?);
        markdown.write(&md).await?;
        self.pandoc("gfm", "html", &markdown, &rebuilt).await?;

        let out = rebuilt.read_to_string().await?;
        debug!(address, before = html.len(), after = out.len(), "pandoc round trip");
        Ok(out)
    }
}

/// Drop `:::` fenced-div marker lines left over from the HTML conversion.
pub fn strip_fenced_divs(md: &str) -> String {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^:::.*(\r?\n|$)").expect("valid regex"));
    FENCE_RE.replace_all(md, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_div_lines_are_removed() {
        let md = "::: {.post}\n# Title\n\nBody text\n:::\n::: footer\nmore\n:::";
        assert_eq!(strip_fenced_divs(md), "# Title\n\nBody text\nmore\n");
    }

    #[test]
    fn colons_inside_lines_survive() {
        let md = "time: 10:30 ::: not a fence\n";
        assert_eq!(strip_fenced_divs(md), md);
    }

    #[tokio::test]
    async fn failed_conversion_cleans_up_scratch_files() {
        let scratch = std::env::temp_dir().join(format!("refeed_pandoc_{}", uuid::Uuid::now_v7()));
        let converter = PandocConverter::new(
            "/nonexistent/refeed-pandoc",
            &scratch,
            Duration::from_secs(5),
        );
        let err = converter
            .normalize("https://example.com/a", "<p>hello</p>")
            .await
            .unwrap_err();
        assert!(matches!(err, RefeedError::Conversion(_)));
        assert!(err.is_retryable());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
