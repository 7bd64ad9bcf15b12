//! SQL migration definitions for the refeed database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: kv state store, jobs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Shared key-value state (fetch states, locks, markers, records)
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at) WHERE expires_at IS NOT NULL;

-- Durable job queue; a flow is a tree linked through parent_id
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    queue       TEXT NOT NULL,
    name        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    parent_id   TEXT REFERENCES jobs(id) ON DELETE CASCADE,
    status      TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    run_at      INTEGER NOT NULL,
    result      TEXT,
    error       TEXT,
    worker_id   TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    finished_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, status, run_at);
CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index finished root jobs for retention pruning",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_jobs_finished_roots
    ON jobs(status, finished_at) WHERE parent_id IS NULL;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
