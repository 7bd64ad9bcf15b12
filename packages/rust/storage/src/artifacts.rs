//! Durable storage of fetched-resource artifacts and preview images.
//!
//! Writes are last-writer-wins and never partially visible. A storage
//! failure is always an error, never a miss.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use refeed_shared::{RefeedError, ResourceArtifact, ResourceKey, Result, space};

use crate::state::StateStore;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, address: &str, artifact: &ResourceArtifact) -> Result<()>;

    /// `None` when no artifact was ever stored for `address`.
    async fn get(&self, address: &str) -> Result<Option<ResourceArtifact>>;

    async fn put_preview(&self, address: &str, bytes: &[u8]) -> Result<()>;

    async fn get_preview(&self, address: &str) -> Result<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Stores `<key>.json` and `<key>.png` under a root directory, where `key`
/// is the durable [`ResourceKey`] of the address.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(".tmp"))
            .await
            .map_err(|e| RefeedError::io(&root, e))?;
        Ok(Self { root })
    }

    fn path_for(&self, address: &str, ext: &str) -> PathBuf {
        self.root
            .join(format!("{}.{ext}", ResourceKey::durable(address)))
    }

    /// Write to a scratch file then rename over the target.
    async fn write_atomic(&self, address: &str, target: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self
            .root
            .join(".tmp")
            .join(ResourceKey::scratch(address).as_str());
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(RefeedError::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(RefeedError::io(target, e));
        }
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RefeedError::io(path, e)),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, address: &str, artifact: &ResourceArtifact) -> Result<()> {
        let bytes = serde_json::to_vec(artifact)?;
        let target = self.path_for(address, "json");
        self.write_atomic(address, &target, &bytes).await?;
        tracing::debug!(address, path = %target.display(), "stored artifact");
        Ok(())
    }

    async fn get(&self, address: &str) -> Result<Option<ResourceArtifact>> {
        let path = self.path_for(address, "json");
        match Self::read_optional(&path).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                RefeedError::Storage(format!("corrupt artifact {}: {e}", path.display()))
            }),
            None => Ok(None),
        }
    }

    async fn put_preview(&self, address: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path_for(address, "png");
        self.write_atomic(address, &target, bytes).await
    }

    async fn get_preview(&self, address: &str) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.path_for(address, "png")).await
    }
}

// ---------------------------------------------------------------------------
// State-store backend
// ---------------------------------------------------------------------------

/// Stores artifacts as `page:<address>` and previews as `screenshot:<address>`.
pub struct StateArtifactStore {
    store: Arc<dyn StateStore>,
}

impl StateArtifactStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArtifactStore for StateArtifactStore {
    async fn put(&self, address: &str, artifact: &ResourceArtifact) -> Result<()> {
        let bytes = serde_json::to_vec(artifact)?;
        self.store.set(&space::page(address), &bytes, None).await
    }

    async fn get(&self, address: &str) -> Result<Option<ResourceArtifact>> {
        match self.store.get(&space::page(address)).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                RefeedError::Storage(format!("corrupt artifact for {address}: {e}"))
            }),
            None => Ok(None),
        }
    }

    async fn put_preview(&self, address: &str, bytes: &[u8]) -> Result<()> {
        self.store.set(&space::screenshot(address), bytes, None).await
    }

    async fn get_preview(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(&space::screenshot(address)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use refeed_shared::ReadableText;

    use super::*;
    use crate::state::MemoryStore;

    fn artifact(address: &str, body: &str) -> ResourceArtifact {
        ResourceArtifact {
            address: address.into(),
            content: body.into(),
            links: vec![],
            media: vec![],
            readable: ReadableText {
                title: "t".into(),
                text: body.into(),
                markdown: body.into(),
            },
            fetched_at: Utc::now(),
        }
    }

    async fn exercise(store: &dyn ArtifactStore) {
        let addr = "https://example.com/post?id=1";
        assert!(store.get(addr).await.unwrap().is_none());
        assert!(store.get_preview(addr).await.unwrap().is_none());

        store.put(addr, &artifact(addr, "first")).await.unwrap();
        store.put(addr, &artifact(addr, "second")).await.unwrap();
        let got = store.get(addr).await.unwrap().expect("stored");
        assert_eq!(got.content, "second");

        store.put_preview(addr, &[0x89, b'P', b'N', b'G']).await.unwrap();
        assert_eq!(
            store.get_preview(addr).await.unwrap(),
            Some(vec![0x89, b'P', b'N', b'G'])
        );
    }

    #[tokio::test]
    async fn filesystem_backend() {
        let root = std::env::temp_dir().join(format!("refeed_artifacts_{}", uuid::Uuid::now_v7()));
        let store = FsArtifactStore::open(&root).await.unwrap();
        exercise(&store).await;

        let mut leftovers = tokio::fs::read_dir(root.join(".tmp")).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none(), "scratch files left behind");
    }

    #[tokio::test]
    async fn state_backend_uses_page_keys() {
        let mem = Arc::new(MemoryStore::new());
        let store = StateArtifactStore::new(mem.clone());
        exercise(&store).await;
        assert!(mem.exists("page:https://example.com/post?id=1").await.unwrap());
        assert!(
            mem.exists("screenshot:https://example.com/post?id=1")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_a_miss() {
        let root = std::env::temp_dir().join(format!("refeed_artifacts_{}", uuid::Uuid::now_v7()));
        let store = FsArtifactStore::open(&root).await.unwrap();
        let addr = "https://example.com/broken";
        tokio::fs::write(store.path_for(addr, "json"), b"{not json")
            .await
            .unwrap();
        assert!(matches!(store.get(addr).await, Err(RefeedError::Storage(_))));
    }
}
