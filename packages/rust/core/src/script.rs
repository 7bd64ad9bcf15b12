//! External clustering scripts.
//!
//! The embed and cluster stages shell out to Python:
//! `embeddings.py <keys file> <embeddings file>` and
//! `cluster.py <embeddings file> <clusters file>`, run from the scripts
//! directory. Both are opaque; only exit status and output files matter.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use refeed_crawler::{ScratchFile, tail};
use refeed_shared::{ClustererConfig, RefeedError, Result, expand_home};

pub const EMBEDDINGS_SCRIPT: &str = "embeddings.py";
pub const CLUSTER_SCRIPT: &str = "cluster.py";

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: String,
    scripts_dir: PathBuf,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(
        interpreter: impl Into<String>,
        scripts_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            scripts_dir: scripts_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ClustererConfig) -> Self {
        Self::new(
            &config.python,
            expand_home(&config.scripts_dir),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Run `script input <scratch>` and move the scratch file to `output`
    /// once the script exits cleanly. A failed or timed-out run never leaves
    /// anything at `output`.
    #[instrument(skip_all, fields(script = %script))]
    pub async fn run(&self, script: &str, input: &Path, output: &Path) -> Result<()> {
        let started = Instant::now();
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = output
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".into());
        let partial = ScratchFile::reserve(dir, &name, &ext);

        let mut command = tokio::process::Command::new(&self.interpreter);
        command
            .arg(script)
            .arg(input)
            .arg(partial.path())
            .current_dir(&self.scripts_dir)
            .kill_on_drop(true);

        let out = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| RefeedError::Timeout {
                operation: format!("{} {script}", self.interpreter),
                after: self.timeout,
            })?
            .map_err(|e| {
                RefeedError::Conversion(format!("failed to run {} {script}: {e}", self.interpreter))
            })?;

        let stdout = String::from_utf8_lossy(&out.stdout);
        debug!(stdout = tail(&stdout, 400), "script output");
        if !out.status.success() {
            return Err(RefeedError::Conversion(format!(
                "{script} exited with {}: {} {}",
                out.status,
                tail(&String::from_utf8_lossy(&out.stderr), 400),
                tail(&stdout, 200),
            )));
        }
        let written = tokio::fs::try_exists(partial.path())
            .await
            .map_err(|e| RefeedError::io(partial.path(), e))?;
        if !written {
            return Err(RefeedError::Conversion(format!(
                "{script} succeeded but wrote no {}",
                output.display()
            )));
        }
        partial.persist(output).await?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "script finished");
        Ok(())
    }

    pub async fn embed(&self, keys_file: &Path, embeddings_file: &Path) -> Result<()> {
        self.run(EMBEDDINGS_SCRIPT, keys_file, embeddings_file).await
    }

    pub async fn cluster(&self, embeddings_file: &Path, clusters_file: &Path) -> Result<()> {
        self.run(CLUSTER_SCRIPT, embeddings_file, clusters_file).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("refeed_scripts_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    // `sh` stands in for python; the "scripts" are shell files.
    fn runner(dir: &Path, timeout: Duration) -> ScriptRunner {
        ScriptRunner::new("sh", dir, timeout)
    }

    #[tokio::test]
    async fn runs_in_the_scripts_dir_with_input_and_output() {
        let dir = scratch();
        std::fs::write(dir.join(EMBEDDINGS_SCRIPT), "tr a-z A-Z < \"$1\" > \"$2\"\n").unwrap();
        let input = dir.join("in.keys");
        let output = dir.join("out.csv");
        std::fs::write(&input, "tildes:a\n").unwrap();

        runner(&dir, Duration::from_secs(10)).embed(&input, &output).await.unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "TILDES:A\n");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let dir = scratch();
        let script = "echo 'no module named sklearn' >&2\nexit 3\n";
        std::fs::write(dir.join(CLUSTER_SCRIPT), script).unwrap();

        let err = runner(&dir, Duration::from_secs(10))
            .cluster(&dir.join("a"), &dir.join("b"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("no module named sklearn"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn failed_run_leaves_no_partial_output() {
        let dir = scratch();
        let script = "echo '[{\"theme\": \"half' > \"$2\"\nexit 3\n";
        std::fs::write(dir.join(CLUSTER_SCRIPT), script).unwrap();
        let output = dir.join("clusters.json");

        runner(&dir, Duration::from_secs(10))
            .cluster(&dir.join("a"), &output)
            .await
            .unwrap_err();
        assert!(!output.exists());
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != CLUSTER_SCRIPT)
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let dir = scratch();
        std::fs::write(dir.join(CLUSTER_SCRIPT), "exit 0\n").unwrap();
        let err = runner(&dir, Duration::from_secs(10))
            .cluster(&dir.join("a"), &dir.join("b"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("wrote no"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let dir = scratch();
        std::fs::write(dir.join(CLUSTER_SCRIPT), "sleep 5\n").unwrap();
        let err = runner(&dir, Duration::from_millis(100))
            .cluster(&dir.join("a"), &dir.join("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, RefeedError::Timeout { .. }));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
