//! Scratch files and directories that remove themselves on drop.
//!
//! Names come from [`ResourceKey::scratch`], so two concurrent fetches of
//! the same address never share a file.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use refeed_shared::{RefeedError, ResourceKey, Result};

/// A scratch file path, deleted (if present) when dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Reserve a unique name under `dir` for `address`. Nothing is created yet.
    pub fn reserve(dir: &Path, address: &str, ext: &str) -> Self {
        Self {
            path: dir.join(format!("{}.{ext}", ResourceKey::scratch(address))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, bytes: impl AsRef<[u8]>) -> Result<()> {
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| RefeedError::io(&self.path, e))
    }

    pub async fn read_to_string(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RefeedError::io(&self.path, e))
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| RefeedError::io(&self.path, e))
    }

    /// Move the file to `dest`. Same-directory renames replace `dest` atomically.
    pub async fn persist(self, dest: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, dest)
            .await
            .map_err(|e| RefeedError::io(dest, e))
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "scratch file not removed")
            }
        }
    }
}

/// A scratch directory, removed recursively when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(parent: &Path, address: &str) -> Result<Self> {
        let path = parent.join(ResourceKey::scratch(address).as_str());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| RefeedError::io(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "scratch dir not removed");
            }
        }
    }
}

/// Remove entries directly under `dir` last modified more than `older_than`
/// ago, for leftovers of flows that never reached their cleanup step.
/// Returns how many were removed. A missing `dir` sweeps nothing.
pub async fn sweep_stale(dir: &Path, older_than: Duration) -> Result<u64> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(RefeedError::io(dir, e)),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(|e| RefeedError::io(dir, e))? {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else { continue };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }
        let outcome = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "stale scratch entry not removed"
            ),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("refeed_scratch_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn file_is_removed_on_drop() {
        let root = temp_root();
        let path = {
            let file = ScratchFile::reserve(&root, "https://example.com/a", "html");
            file.write("<p>x</p>").await.unwrap();
            assert!(file.path().exists());
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dir_is_removed_on_drop_even_with_contents() {
        let root = temp_root();
        let path = {
            let dir = ScratchDir::create(&root, "https://example.com/a").await.unwrap();
            std::fs::write(dir.path().join("Cookies"), b"x").unwrap();
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn persisted_file_survives_drop() {
        let root = temp_root();
        let dest = root.join("clusters.json");
        let file = ScratchFile::reserve(&root, "clusters.json", "json");
        file.write("[]").await.unwrap();
        let reserved = file.path().to_path_buf();
        file.persist(&dest).await.unwrap();
        assert!(!reserved.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "[]");
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_only_old_entries() {
        let root = temp_root();
        std::fs::write(root.join("digest.keys"), "tildes:a").unwrap();
        std::fs::create_dir_all(root.join("profile")).unwrap();
        std::fs::write(root.join("profile").join("Cookies"), b"x").unwrap();

        assert_eq!(sweep_stale(&root, Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sweep_stale(&root, Duration::from_millis(10)).await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
        assert_eq!(sweep_stale(&root.join("missing"), Duration::ZERO).await.unwrap(), 0);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn reserved_names_are_unique() {
        let root = std::env::temp_dir();
        let a = ScratchFile::reserve(&root, "https://example.com/a", "md");
        let b = ScratchFile::reserve(&root, "https://example.com/a", "md");
        assert_ne!(a.path(), b.path());
    }
}
