//! libSQL storage layer for refeed.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the shared
//! key-value state ([`StateStore`]) and the durable job queue ([`JobQueue`]).
//! All access goes through one connection guarded by an async mutex, so every
//! single statement is atomic and multi-statement updates run in a transaction.

mod artifacts;
mod migrations;
mod queue;
mod state;
mod tracker;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use libsql::{Connection, Database, Transaction, params};
use refeed_shared::{RefeedError, Result};
use tokio::sync::{Mutex, MutexGuard};

pub use artifacts::{ArtifactStore, FsArtifactStore, StateArtifactStore};
pub use queue::{BatchReport, FailedChild, FlowNode, Job, JobQueue, JobStatus, QueueCount};
pub use state::{MemoryStore, StateStore};
pub use tracker::PipelineState;

/// Primary storage handle wrapping a libSQL database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RefeedError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .await
            .map_err(db_err)?;

        let storage = Self {
            db: Arc::new(db),
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;
        let conn = self.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    RefeedError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let conn = self.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Delete every expired key. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let conn = self.lock().await;
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_millis()],
        )
        .await
        .map_err(db_err)
    }
}

pub(crate) fn db_err(e: libsql::Error) -> RefeedError {
    RefeedError::Storage(e.to_string())
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Commit on success, roll back on failure, and hand back the outcome.
pub(crate) async fn finish<T>(tx: Transaction, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await.map_err(db_err)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("refeed_test_{}.db", uuid::Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}
