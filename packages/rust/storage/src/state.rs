//! The shared key-value store.
//!
//! Every operation touches a single key and is atomic on its own. Expired
//! entries behave exactly like absent ones.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libsql::params;
use refeed_shared::Result;
use tokio::sync::Mutex;

use crate::{Storage, db_err, now_millis};

/// Single-key operations on the shared state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional write. `ttl` of `None` keeps the entry forever.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Write only if `key` is absent (or expired). Returns whether it wrote.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_millis() + i64::try_from(t.as_millis()).unwrap_or(i64::MAX / 2))
}

// ---------------------------------------------------------------------------
// libSQL-backed store
// ---------------------------------------------------------------------------

#[async_trait]
impl StateStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock().await;
        let mut rows = conn
            .query(
                "SELECT value FROM kv WHERE key = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<Vec<u8>>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               expires_at = excluded.expires_at",
            params![key, value.to_vec(), expiry(ttl)],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let conn = self.lock().await;
        // The upsert only overwrites an expired row; a live one leaves zero changes.
        let changed = conn
            .execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at
                 WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4",
                params![key, value.to_vec(), expiry(ttl), now_millis()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM kv WHERE key = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.lock().await;
        let mut rows = conn
            .query(
                "DELETE FROM kv WHERE key = ?1 RETURNING expires_at",
                params![key],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let expires_at = row.get::<Option<i64>>(0).map_err(db_err)?;
                Ok(expires_at.is_none_or(|at| at > now_millis()))
            }
            None => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.lock().await;
        let mut rows = conn
            .query(
                "SELECT key FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
                params![prefix, now_millis()],
            )
            .await
            .map_err(db_err)?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            keys.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local [`StateStore`], for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live(deadline: &Option<Instant>) -> bool {
    deadline.is_none_or(|at| at > Instant::now())
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, deadline)| live(deadline))
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|t| Instant::now() + t);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|(_, deadline)| live(deadline)) {
            return Ok(false);
        }
        let deadline = ttl.map(|t| Instant::now() + t);
        entries.insert(key.to_string(), (value.to_vec(), deadline));
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.is_some_and(|(_, deadline)| live(&deadline)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, (_, deadline))| key.starts_with(prefix) && live(deadline))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_storage;

    async fn exercise(store: &dyn StateStore) {
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", b"v1", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v1"[..]));

        assert!(!store.set_if_absent("k", b"v2", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v1"[..]));

        assert!(store.set_if_absent("other", b"x", None).await.unwrap());
        store.set("article:tildes:1", b"a", None).await.unwrap();
        store.set("article:tildes:2", b"b", None).await.unwrap();
        store.set("article:lobsters:1", b"c", None).await.unwrap();
        assert_eq!(
            store.keys_with_prefix("article:tildes:").await.unwrap(),
            vec!["article:tildes:1", "article:tildes:2"]
        );

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn libsql_store_contract() {
        let storage = test_storage().await;
        exercise(&storage).await;
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn expired_entries_are_absent_and_reclaimable() {
        let storage = test_storage().await;
        let ttl = Some(Duration::from_millis(20));
        assert!(storage.set_if_absent("busy:x", b"1", ttl).await.unwrap());
        assert!(!storage.set_if_absent("busy:x", b"1", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!storage.exists("busy:x").await.unwrap());
        assert!(storage.set_if_absent("busy:x", b"2", None).await.unwrap());
        assert_eq!(
            storage.get("busy:x").await.unwrap().as_deref(),
            Some(&b"2"[..])
        );
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_has_one_winner() {
        let storage = Arc::new(test_storage().await);
        let mut handles = Vec::new();
        for i in 0..32u8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.set_if_absent("busy:race", &[i], None).await.unwrap()
            }));
        }
        let wins = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);
    }
}
