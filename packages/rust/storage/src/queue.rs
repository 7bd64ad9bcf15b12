//! Durable job queue with parent/child flows.
//!
//! A flow is a tree of jobs recorded in one transaction. Leaves are
//! runnable immediately; a parent waits until every child has completed,
//! then becomes runnable and can read its children's results. A parent
//! whose children have all settled with at least one failure is failed
//! without running, and the failure keeps climbing toward the root.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use libsql::{Connection, params};
use refeed_shared::{RefeedError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Storage, db_err, finish, now_millis};

const JOB_COLUMNS: &str = "id, queue, name, payload, parent_id, status, attempts, run_at, \
                           result, error, created_at, finished_at";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Has children that have not all completed.
    WaitingChildren,
    /// Runnable once `run_at` has passed.
    Waiting,
    /// Claimed by a worker.
    Active,
    Completed,
    /// Terminal failure, never retried automatically.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingChildren => "waiting_children",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "waiting_children" => Self::WaitingChildren,
            "waiting" => Self::Waiting,
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => {
                return Err(RefeedError::Storage(format!("unknown job status {other:?}")));
            }
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job to submit, with the children that must finish before it.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
            payload,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: FlowNode) -> Self {
        self.children.push(child);
        self
    }

    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FlowNode::node_count).sum::<usize>()
    }
}

/// A stored job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub parent_id: Option<String>,
    pub status: JobStatus,
    /// Attempts started so far, including the current one when active.
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Count of jobs per queue and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCount {
    pub queue: String,
    pub status: JobStatus,
    pub count: u64,
}

/// A child that ended in terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChild {
    pub job_id: String,
    pub name: String,
    pub error: String,
}

/// Outcome of a flow's direct children, as seen from the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: String,
    pub status: JobStatus,
    /// Results of completed children, in submission order.
    pub completed: Vec<Value>,
    pub failed: Vec<FailedChild>,
    /// Children still waiting or running.
    pub pending: usize,
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| RefeedError::Storage(format!("corrupt job json: {e}")))
}

fn row_to_job(row: &libsql::Row) -> Result<Job> {
    let payload: String = row.get(3).map_err(db_err)?;
    let status: String = row.get(5).map_err(db_err)?;
    let result: Option<String> = row.get(8).map_err(db_err)?;
    Ok(Job {
        id: row.get(0).map_err(db_err)?,
        queue: row.get(1).map_err(db_err)?,
        name: row.get(2).map_err(db_err)?,
        payload: parse_json(&payload)?,
        parent_id: row.get(4).map_err(db_err)?,
        status: JobStatus::parse(&status)?,
        attempts: row.get(6).map_err(db_err)?,
        run_at: millis_to_datetime(row.get(7).map_err(db_err)?),
        result: result.as_deref().map(parse_json).transpose()?,
        error: row.get(9).map_err(db_err)?,
        created_at: millis_to_datetime(row.get(10).map_err(db_err)?),
        finished_at: row
            .get::<Option<i64>>(11)
            .map_err(db_err)?
            .map(millis_to_datetime),
    })
}

async fn collect_jobs(mut rows: libsql::Rows) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Durable queue over [`Storage`]. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    storage: Storage,
}

impl JobQueue {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Record a whole flow atomically and return the root job id. Does not
    /// wait for anything to run.
    pub async fn enqueue_flow(&self, root: &FlowNode) -> Result<String> {
        let now = now_millis();
        let mut rows = Vec::with_capacity(root.node_count());
        let root_id = flatten(root, None, &mut rows);

        let conn = self.storage.lock().await;
        let tx = conn.transaction().await.map_err(db_err)?;
        let outcome = async {
            for (id, parent_id, node) in &rows {
                let status = if node.children.is_empty() {
                    JobStatus::Waiting
                } else {
                    JobStatus::WaitingChildren
                };
                tx.execute(
                    "INSERT INTO jobs (id, queue, name, payload, parent_id, status, attempts,
                                       run_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7, ?7)",
                    params![
                        id.as_str(),
                        node.queue.as_str(),
                        node.name.as_str(),
                        node.payload.to_string(),
                        parent_id.as_deref(),
                        status.as_str(),
                        now,
                    ],
                )
                .await
                .map_err(db_err)?;
            }
            Ok::<(), RefeedError>(())
        }
        .await;
        finish(tx, outcome).await?;

        tracing::debug!(root_id, jobs = rows.len(), queue = %root.queue, "flow enqueued");
        Ok(root_id)
    }

    /// Move the oldest runnable job of `queue` to active and count the attempt.
    pub async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Job>> {
        let now = now_millis();
        let conn = self.storage.lock().await;
        let rows = conn
            .query(
                &format!(
                    "UPDATE jobs SET status = 'active', attempts = attempts + 1,
                                     worker_id = ?3, updated_at = ?2
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE queue = ?1 AND status = 'waiting' AND run_at <= ?2
                         ORDER BY run_at, created_at, id
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![queue, now, worker_id],
            )
            .await
            .map_err(db_err)?;
        Ok(collect_jobs(rows).await?.into_iter().next())
    }

    /// Store the result of an active job and settle its parent.
    pub async fn complete(&self, id: &str, result: &Value) -> Result<()> {
        let now = now_millis();
        let conn = self.storage.lock().await;
        let tx = conn.transaction().await.map_err(db_err)?;
        let outcome = async {
            let parent = finish_active(&tx, id, "completed", Some(result.to_string()), None, now)
                .await?;
            if let Some(parent_id) = parent {
                settle(&tx, parent_id, now).await?;
            }
            Ok::<(), RefeedError>(())
        }
        .await;
        finish(tx, outcome).await
    }

    /// Put an active job back to waiting until `run_at`.
    pub async fn retry(&self, id: &str, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.storage.lock().await;
        let changed = conn
            .execute(
                "UPDATE jobs SET status = 'waiting', error = ?2, run_at = ?3,
                                 worker_id = NULL, updated_at = ?4
                 WHERE id = ?1 AND status = 'active'",
                params![id, error, run_at.timestamp_millis(), now_millis()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RefeedError::Storage(format!("job {id} is not active")));
        }
        Ok(())
    }

    /// Fail an active job permanently and settle its parent.
    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        let now = now_millis();
        let conn = self.storage.lock().await;
        let tx = conn.transaction().await.map_err(db_err)?;
        let outcome = async {
            let parent =
                finish_active(&tx, id, "failed", None, Some(error.to_string()), now).await?;
            if let Some(parent_id) = parent {
                settle(&tx, parent_id, now).await?;
            }
            Ok::<(), RefeedError>(())
        }
        .await;
        finish(tx, outcome).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.storage.lock().await;
        let rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        Ok(collect_jobs(rows).await?.into_iter().next())
    }

    /// Direct children of `id`, in submission order.
    pub async fn children(&self, id: &str) -> Result<Vec<Job>> {
        let conn = self.storage.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ?1
                     ORDER BY created_at, rowid"
                ),
                params![id],
            )
            .await
            .map_err(db_err)?;
        collect_jobs(rows).await
    }

    /// Results of the completed children of `id`, in submission order.
    pub async fn children_values(&self, id: &str) -> Result<Vec<Value>> {
        Ok(self
            .children(id)
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Completed)
            .filter_map(|job| job.result)
            .collect())
    }

    /// Completed and failed children of `id`, for operator visibility.
    pub async fn batch_report(&self, id: &str) -> Result<BatchReport> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| RefeedError::NotFound(format!("job {id}")))?;
        let mut report = BatchReport {
            job_id: job.id,
            status: job.status,
            completed: Vec::new(),
            failed: Vec::new(),
            pending: 0,
        };
        for child in self.children(id).await? {
            match child.status {
                JobStatus::Completed => report.completed.push(child.result.unwrap_or(Value::Null)),
                JobStatus::Failed => report.failed.push(FailedChild {
                    job_id: child.id,
                    name: child.name,
                    error: child.error.unwrap_or_default(),
                }),
                _ => report.pending += 1,
            }
        }
        Ok(report)
    }

    /// Jobs filtered by queue and status, newest first.
    pub async fn list(
        &self,
        queue: Option<&str>,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>> {
        let conn = self.storage.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE (?1 IS NULL OR queue = ?1) AND (?2 IS NULL OR status = ?2)
                     ORDER BY updated_at DESC, rowid DESC
                     LIMIT ?3"
                ),
                params![queue, status.map(|s| s.as_str()), limit],
            )
            .await
            .map_err(db_err)?;
        collect_jobs(rows).await
    }

    pub async fn counts(&self) -> Result<Vec<QueueCount>> {
        let conn = self.storage.lock().await;
        let mut rows = conn
            .query(
                "SELECT queue, status, COUNT(*) FROM jobs GROUP BY queue, status
                 ORDER BY queue, status",
                params![],
            )
            .await
            .map_err(db_err)?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: String = row.get(1).map_err(db_err)?;
            counts.push(QueueCount {
                queue: row.get(0).map_err(db_err)?,
                status: JobStatus::parse(&status)?,
                count: row.get::<i64>(2).map_err(db_err)?.max(0) as u64,
            });
        }
        Ok(counts)
    }

    /// Return jobs left active by a crashed process to waiting, then settle
    /// every parent still waiting on children. Returns the number resumed.
    pub async fn recover(&self) -> Result<u64> {
        let now = now_millis();
        let conn = self.storage.lock().await;
        let tx = conn.transaction().await.map_err(db_err)?;
        let outcome = async {
            let resumed = tx
                .execute(
                    "UPDATE jobs SET status = 'waiting', worker_id = NULL, updated_at = ?1
                     WHERE status = 'active'",
                    params![now],
                )
                .await
                .map_err(db_err)?;

            let mut rows = tx
                .query(
                    "SELECT id FROM jobs WHERE status = 'waiting_children'",
                    params![],
                )
                .await
                .map_err(db_err)?;
            let mut parents = Vec::new();
            while let Some(row) = rows.next().await.map_err(db_err)? {
                parents.push(row.get::<String>(0).map_err(db_err)?);
            }
            for parent_id in parents {
                settle(&tx, parent_id, now).await?;
            }
            Ok::<u64, RefeedError>(resumed)
        }
        .await;
        let resumed = finish(tx, outcome).await?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed jobs interrupted by a previous run");
        }
        Ok(resumed)
    }

    /// Delete completed root flows finished before `older_than` ago, with
    /// all their descendants. Returns the number of jobs removed.
    pub async fn prune_completed(&self, older_than: Duration) -> Result<u64> {
        const DOOMED: &str = "WITH RECURSIVE doomed(id) AS (
                 SELECT id FROM jobs
                 WHERE parent_id IS NULL AND status = 'completed' AND finished_at < ?1
                 UNION ALL
                 SELECT j.id FROM jobs j JOIN doomed d ON j.parent_id = d.id
             )";
        let cutoff = now_millis() - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX / 2);
        let conn = self.storage.lock().await;
        let tx = conn.transaction().await.map_err(db_err)?;
        let outcome = async {
            // Cascaded child deletes are not reported by the change count.
            let mut rows = tx
                .query(&format!("{DOOMED} SELECT COUNT(*) FROM doomed"), params![cutoff])
                .await
                .map_err(db_err)?;
            let doomed = match rows.next().await.map_err(db_err)? {
                Some(row) => row.get::<i64>(0).map_err(db_err)?.max(0) as u64,
                None => 0,
            };
            if doomed > 0 {
                tx.execute(
                    &format!("{DOOMED} DELETE FROM jobs WHERE id IN (SELECT id FROM doomed)"),
                    params![cutoff],
                )
                .await
                .map_err(db_err)?;
            }
            Ok::<u64, RefeedError>(doomed)
        }
        .await;
        finish(tx, outcome).await
    }
}

/// Pre-order flatten with fresh ids; returns the id assigned to `node`.
fn flatten<'a>(
    node: &'a FlowNode,
    parent_id: Option<String>,
    out: &mut Vec<(String, Option<String>, &'a FlowNode)>,
) -> String {
    let id = Uuid::now_v7().to_string();
    out.push((id.clone(), parent_id, node));
    for child in &node.children {
        flatten(child, Some(id.clone()), out);
    }
    id
}

/// Mark an active job finished. Returns its parent id.
async fn finish_active(
    conn: &Connection,
    id: &str,
    status: &str,
    result: Option<String>,
    error: Option<String>,
    now: i64,
) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "UPDATE jobs SET status = ?2, result = ?3, error = COALESCE(?4, error),
                             finished_at = ?5, updated_at = ?5, worker_id = NULL
             WHERE id = ?1 AND status = 'active'
             RETURNING parent_id",
            params![id, status, result, error, now],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(row.get::<Option<String>>(0).map_err(db_err)?),
        None => Err(RefeedError::Storage(format!("job {id} is not active"))),
    }
}

/// Promote or fail `parent_id` once all of its children have settled,
/// walking up while parents get failed.
async fn settle(conn: &Connection, parent_id: String, now: i64) -> Result<()> {
    let mut next = Some(parent_id);
    while let Some(parent_id) = next.take() {
        let mut rows = conn
            .query(
                "SELECT id, name, status, error FROM jobs WHERE parent_id = ?1",
                params![parent_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut total = 0usize;
        let mut completed = 0usize;
        let mut failed = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            total += 1;
            let status: String = row.get(2).map_err(db_err)?;
            match JobStatus::parse(&status)? {
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed.push(FailedChild {
                    job_id: row.get(0).map_err(db_err)?,
                    name: row.get(1).map_err(db_err)?,
                    error: row.get::<Option<String>>(3).map_err(db_err)?.unwrap_or_default(),
                }),
                _ => {}
            }
        }

        if completed == total {
            conn.execute(
                "UPDATE jobs SET status = 'waiting', run_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'waiting_children'",
                params![parent_id.as_str(), now],
            )
            .await
            .map_err(db_err)?;
        } else if !failed.is_empty() && completed + failed.len() == total {
            let report = serde_json::json!({
                "completed": completed,
                "failed": failed,
            });
            let message = format!("{} of {total} children failed: {report}", failed.len());
            let mut rows = conn
                .query(
                    "UPDATE jobs SET status = 'failed', error = ?2, finished_at = ?3,
                                     updated_at = ?3
                     WHERE id = ?1 AND status = 'waiting_children'
                     RETURNING parent_id",
                    params![parent_id.as_str(), message, now],
                )
                .await
                .map_err(db_err)?;
            if let Some(row) = rows.next().await.map_err(db_err)? {
                tracing::warn!(
                    job_id = %parent_id,
                    failed = failed.len(),
                    "flow parent failed by children"
                );
                next = row.get::<Option<String>>(0).map_err(db_err)?;
            }
        }
    }
    Ok(())
}
