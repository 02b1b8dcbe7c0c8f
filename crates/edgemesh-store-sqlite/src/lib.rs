//! SQLite implementation of the EdgeMesh coordinator's `Store` trait.
//!
//! This crate owns the transactional writer discipline described in the
//! core crate's `store` module: every mutating operation runs under a
//! single in-process write lock and a single sqlite transaction, so the
//! pull/submit/recover sequences observe and mutate a consistent snapshot.
//! Reads go straight to the pool and may run concurrently with each other.
//!
//! # Schema
//!
//! Four tables — `nodes`, `jobs`, `tasks`, `results` — applied by the
//! idempotent, versioned migrations in [`migrations`]. Node sub-records
//! (capabilities/metrics/policy) and task payload/result output are stored
//! as JSON text columns; everything else is a plain scalar column,
//! including the job's derived aggregates, which are cached on the job
//! row and rewritten by [`refresh_job_aggregates`] on every task-driven
//! transaction rather than recomputed on every read.
//!
//! # Usage
//!
//! ```rust,ignore
//! use edgemesh_store_sqlite::SqliteStore;
//!
//! let store = SqliteStore::connect("sqlite://./coordinator.db").await?;
//! ```

mod codec;
mod error;
mod migrations;

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use edgemesh_core::domain::{
    Job, Node, NodeCapabilities, NodeIdentity, NodeMetrics, NodePolicy, Task, TaskResult,
};
use edgemesh_core::enums::{JobStatus, NodeStatus, TaskStatus, TaskType};
use edgemesh_core::error::{CoreError, CoreResult};
use edgemesh_core::scheduler;
use edgemesh_core::store::{ClusterSummary, ExecutionMetrics, JobFilter, Store, TaskFilter};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqlitePool, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::map_sqlx_error;

type Tx<'a> = Transaction<'a, sqlx::Sqlite>;

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..12])
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct NodeRow {
    node_id: String,
    display_name: String,
    ip: String,
    port: i64,
    capabilities: String,
    metrics: String,
    policy: String,
    status: String,
    last_seen: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    payload_ref: Option<String>,
    assigned_node_id: Option<String>,
    attempts: i64,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    total_tasks: i64,
    queued_tasks: i64,
    running_tasks: i64,
    completed_tasks: i64,
    failed_tasks: i64,
    total_retries: i64,
    assigned_nodes: String,
    avg_task_duration_ms: Option<f64>,
    throughput_tasks_per_minute: Option<f64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    id: String,
    job_id: String,
    task_type: String,
    payload: String,
    status: String,
    assigned_node_id: Option<String>,
    retries: i64,
    max_retries: i64,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
#[allow(dead_code)]
struct ResultRow {
    id: String,
    task_id: String,
    node_id: String,
    success: i64,
    output: Option<String>,
    duration_ms: i64,
    created_at: DateTime<Utc>,
}

fn row_to_node(row: NodeRow) -> CoreResult<Node> {
    let capabilities: NodeCapabilities =
        serde_json::from_str(&row.capabilities).map_err(|e| CoreError::Internal(e.to_string()))?;
    let metrics: NodeMetrics =
        serde_json::from_str(&row.metrics).map_err(|e| CoreError::Internal(e.to_string()))?;
    let policy: NodePolicy =
        serde_json::from_str(&row.policy).map_err(|e| CoreError::Internal(e.to_string()))?;

    Ok(Node {
        identity: NodeIdentity {
            node_id: row.node_id,
            display_name: row.display_name,
            ip: row.ip,
            port: row.port as u16,
        },
        capabilities,
        metrics,
        policy,
        status: codec::node_status_from_str(&row.status)?,
        last_seen: row.last_seen,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn row_to_job(row: JobRow) -> CoreResult<Job> {
    let assigned_nodes: Vec<String> = serde_json::from_str(&row.assigned_nodes).unwrap_or_default();
    Ok(Job {
        id: row.id,
        r#type: codec::task_type_from_str(&row.job_type)?,
        status: codec::job_status_from_str(&row.status)?,
        payload_ref: row.payload_ref,
        assigned_node_id: row.assigned_node_id,
        attempts: row.attempts.max(0) as u32,
        error: row.error,
        created_at: row.created_at,
        updated_at: row.updated_at,
        started_at: row.started_at,
        completed_at: row.completed_at,
        total_tasks: row.total_tasks.max(0) as u32,
        queued_tasks: row.queued_tasks.max(0) as u32,
        running_tasks: row.running_tasks.max(0) as u32,
        completed_tasks: row.completed_tasks.max(0) as u32,
        failed_tasks: row.failed_tasks.max(0) as u32,
        total_retries: row.total_retries.max(0) as u32,
        assigned_nodes,
        avg_task_duration_ms: row.avg_task_duration_ms,
        throughput_tasks_per_minute: row.throughput_tasks_per_minute,
    })
}

fn row_to_task(row: TaskRow) -> CoreResult<Task> {
    let payload: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&row.payload).map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(Task {
        id: row.id,
        job_id: row.job_id,
        r#type: codec::task_type_from_str(&row.task_type)?,
        payload,
        status: codec::task_status_from_str(&row.status)?,
        assigned_node_id: row.assigned_node_id,
        retries: row.retries.max(0) as u32,
        max_retries: row.max_retries.max(0) as u32,
        lease_expires_at: row.lease_expires_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
        started_at: row.started_at,
        completed_at: row.completed_at,
        error: row.error,
    })
}

/// Inserts a lazily-created node with every sub-record defaulted, if one
/// isn't already present (spec §3 Lifecycle). No-op otherwise.
async fn ensure_node_row(tx: &mut Tx<'_>, node_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
    let exists: Option<(String,)> = sqlx::query_as("SELECT node_id FROM nodes WHERE node_id = ?")
        .bind(node_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
    if exists.is_some() {
        return Ok(());
    }

    let default = Node::new_default(node_id, now);
    let capabilities_json =
        serde_json::to_string(&default.capabilities).map_err(|e| CoreError::Internal(e.to_string()))?;
    let metrics_json =
        serde_json::to_string(&default.metrics).map_err(|e| CoreError::Internal(e.to_string()))?;
    let policy_json =
        serde_json::to_string(&default.policy).map_err(|e| CoreError::Internal(e.to_string()))?;

    sqlx::query(
        "INSERT INTO nodes (node_id, display_name, ip, port, capabilities, metrics, policy, status, last_seen, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(node_id)
    .bind(&default.identity.display_name)
    .bind(&default.identity.ip)
    .bind(default.identity.port as i64)
    .bind(capabilities_json)
    .bind(metrics_json)
    .bind(policy_json)
    .bind(codec::node_status_to_str(default.status))
    .bind(default.last_seen)
    .bind(default.created_at)
    .bind(default.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

/// Recomputes a job's derived aggregates from its tasks/results and writes
/// them back onto the job row (spec §4.1). Returns `None` if the job
/// doesn't exist. Mirrors `_refresh_job_state_locked` in the original
/// implementation, including its quirk of overwriting `attempts` with the
/// summed task retry count on every task-driven refresh (manual FSM
/// transitions, which do not call this function, are the only place
/// `attempts` otherwise advances).
async fn refresh_job_aggregates(tx: &mut Tx<'_>, job_id: &str, now: DateTime<Utc>) -> CoreResult<Option<JobRow>> {
    let job_row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
    let Some(mut job_row) = job_row else {
        return Ok(None);
    };

    let task_rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE job_id = ? ORDER BY created_at ASC")
        .bind(job_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

    let result_rows: Vec<ResultRow> = sqlx::query_as(
        "SELECT results.* FROM results JOIN tasks ON tasks.id = results.task_id WHERE tasks.job_id = ?",
    )
    .bind(job_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    let total_tasks = task_rows.len() as i64;
    let queued_tasks = task_rows.iter().filter(|t| t.status == "QUEUED").count() as i64;
    let running_tasks = task_rows.iter().filter(|t| t.status == "RUNNING").count() as i64;
    let completed_tasks = task_rows.iter().filter(|t| t.status == "COMPLETED").count() as i64;
    let failed_tasks = task_rows.iter().filter(|t| t.status == "FAILED").count() as i64;
    let total_retries: i64 = task_rows.iter().map(|t| t.retries).sum();

    let assigned_nodes: Vec<String> = task_rows
        .iter()
        .filter_map(|t| t.assigned_node_id.clone())
        .filter(|id| !id.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let avg_task_duration_ms = if result_rows.is_empty() {
        None
    } else {
        let sum: f64 = result_rows.iter().map(|r| r.duration_ms as f64).sum();
        Some(round3(sum / result_rows.len() as f64))
    };

    let started_values: Vec<DateTime<Utc>> = task_rows.iter().filter_map(|t| t.started_at).collect();
    let completed_values: Vec<DateTime<Utc>> = task_rows.iter().filter_map(|t| t.completed_at).collect();

    let throughput_tasks_per_minute = if completed_tasks > 0 {
        started_values.iter().min().map(|earliest| {
            let elapsed_minutes = (now - *earliest).num_milliseconds() as f64 / 60_000.0;
            round3(completed_tasks as f64 / elapsed_minutes.max(1e-6))
        })
    } else {
        None
    };

    let mut status = codec::job_status_from_str(&job_row.status)?;
    if total_tasks > 0 {
        status = if completed_tasks == total_tasks {
            JobStatus::Completed
        } else if failed_tasks > 0 && queued_tasks == 0 && running_tasks == 0 {
            JobStatus::Failed
        } else if running_tasks > 0 || completed_tasks > 0 || failed_tasks > 0 {
            JobStatus::Running
        } else {
            JobStatus::Queued
        };
    }

    job_row.status = codec::job_status_to_str(status).to_string();
    job_row.updated_at = now;
    job_row.attempts = total_retries;
    job_row.assigned_node_id = assigned_nodes.first().cloned();
    job_row.total_tasks = total_tasks;
    job_row.queued_tasks = queued_tasks;
    job_row.running_tasks = running_tasks;
    job_row.completed_tasks = completed_tasks;
    job_row.failed_tasks = failed_tasks;
    job_row.total_retries = total_retries;
    job_row.assigned_nodes =
        serde_json::to_string(&assigned_nodes).map_err(|e| CoreError::Internal(e.to_string()))?;
    job_row.avg_task_duration_ms = avg_task_duration_ms;
    job_row.throughput_tasks_per_minute = throughput_tasks_per_minute;

    if job_row.started_at.is_none() {
        job_row.started_at = started_values.into_iter().min();
    }

    if matches!(status, JobStatus::Completed | JobStatus::Failed) {
        if let Some(max_completed) = completed_values.into_iter().max() {
            job_row.completed_at = Some(max_completed);
        }
    } else {
        job_row.completed_at = None;
    }

    if status == JobStatus::Failed && failed_tasks > 0 {
        job_row.error = Some(format!("{failed_tasks} tasks failed"));
    } else if status == JobStatus::Completed {
        job_row.error = None;
    }

    sqlx::query(
        "UPDATE jobs SET status=?, updated_at=?, attempts=?, assigned_node_id=?, started_at=?, completed_at=?, \
         error=?, total_tasks=?, queued_tasks=?, running_tasks=?, completed_tasks=?, failed_tasks=?, \
         total_retries=?, assigned_nodes=?, avg_task_duration_ms=?, throughput_tasks_per_minute=? WHERE id=?",
    )
    .bind(&job_row.status)
    .bind(job_row.updated_at)
    .bind(job_row.attempts)
    .bind(&job_row.assigned_node_id)
    .bind(job_row.started_at)
    .bind(job_row.completed_at)
    .bind(&job_row.error)
    .bind(job_row.total_tasks)
    .bind(job_row.queued_tasks)
    .bind(job_row.running_tasks)
    .bind(job_row.completed_tasks)
    .bind(job_row.failed_tasks)
    .bind(job_row.total_retries)
    .bind(&job_row.assigned_nodes)
    .bind(job_row.avg_task_duration_ms)
    .bind(job_row.throughput_tasks_per_minute)
    .bind(&job_row.id)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    Ok(Some(job_row))
}

/// Expires leases on RUNNING tasks whose `lease_expires_at` has passed
/// (spec §4.4), applying the same retry/fail branch as a failed result,
/// and refreshes every job it touched.
async fn recover_stale_tasks_locked(tx: &mut Tx<'_>, now: DateTime<Utc>) -> CoreResult<Vec<TaskRow>> {
    let stale: Vec<TaskRow> = sqlx::query_as(
        "SELECT * FROM tasks WHERE status = ? AND lease_expires_at IS NOT NULL AND lease_expires_at < ?",
    )
    .bind(codec::task_status_to_str(TaskStatus::Running))
    .bind(now)
    .fetch_all(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    let mut touched_jobs = BTreeSet::new();
    let mut recovered = Vec::with_capacity(stale.len());

    for mut row in stale {
        row.retries += 1;
        row.lease_expires_at = None;
        row.updated_at = now;
        row.error = Some("Task lease expired".to_string());

        if row.retries > row.max_retries {
            row.status = codec::task_status_to_str(TaskStatus::Failed).to_string();
            row.completed_at = Some(now);
        } else {
            row.status = codec::task_status_to_str(TaskStatus::Queued).to_string();
            row.assigned_node_id = None;
        }

        sqlx::query(
            "UPDATE tasks SET status=?, assigned_node_id=?, retries=?, lease_expires_at=?, updated_at=?, \
             completed_at=?, error=? WHERE id=?",
        )
        .bind(&row.status)
        .bind(&row.assigned_node_id)
        .bind(row.retries)
        .bind(row.lease_expires_at)
        .bind(row.updated_at)
        .bind(row.completed_at)
        .bind(&row.error)
        .bind(&row.id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(task_id = %row.id, job_id = %row.job_id, "task lease expired");
        touched_jobs.insert(row.job_id.clone());
        recovered.push(row);
    }

    for job_id in touched_jobs {
        refresh_job_aggregates(tx, &job_id, now).await?;
    }

    Ok(recovered)
}

/// Durable `Store` for the coordinator, backed by a single sqlite
/// database. Mutating operations are serialized under `write_lock`; the
/// sqlite connection pool itself permits concurrent reads.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Opens (creating if necessary) the sqlite database at `db_url` and
    /// applies pending migrations before returning.
    pub async fn connect(db_url: &str) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(map_sqlx_error)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        migrations::apply_migrations(&pool).await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Wraps an already-open pool, applying migrations first. Useful in
    /// tests that share a pool across assertions.
    pub async fn from_pool(pool: SqlitePool) -> CoreResult<Self> {
        migrations::apply_migrations(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_node_identity(
        &self,
        node_id: &str,
        display_name: &str,
        ip: &str,
        port: u16,
    ) -> CoreResult<Node> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        ensure_node_row(&mut tx, node_id, now).await?;

        sqlx::query("UPDATE nodes SET display_name=?, ip=?, port=?, updated_at=? WHERE node_id=?")
            .bind(display_name)
            .bind(ip)
            .bind(port as i64)
            .bind(now)
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let row: NodeRow = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        row_to_node(row)
    }

    async fn upsert_node_capabilities(&self, node_id: &str, caps: NodeCapabilities) -> CoreResult<Node> {
        edgemesh_core::validation::validate_capabilities(&caps)?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let normalized = caps.normalize();
        let capabilities_json =
            serde_json::to_string(&normalized).map_err(|e| CoreError::Internal(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        ensure_node_row(&mut tx, node_id, now).await?;

        sqlx::query("UPDATE nodes SET capabilities=?, updated_at=? WHERE node_id=?")
            .bind(capabilities_json)
            .bind(now)
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let row: NodeRow = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        row_to_node(row)
    }

    async fn update_node_metrics(&self, node_id: &str, metrics: NodeMetrics) -> CoreResult<Node> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let metrics_json = serde_json::to_string(&metrics).map_err(|e| CoreError::Internal(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        ensure_node_row(&mut tx, node_id, now).await?;

        sqlx::query("UPDATE nodes SET metrics=?, status=?, last_seen=?, updated_at=? WHERE node_id=?")
            .bind(metrics_json)
            .bind(codec::node_status_to_str(NodeStatus::Online))
            .bind(metrics.heartbeat_ts)
            .bind(now)
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let row: NodeRow = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        row_to_node(row)
    }

    async fn update_node_policy(&self, node_id: &str, policy: NodePolicy) -> CoreResult<Node> {
        edgemesh_core::validation::validate_policy(&policy)?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let policy_json = serde_json::to_string(&policy).map_err(|e| CoreError::Internal(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        ensure_node_row(&mut tx, node_id, now).await?;

        sqlx::query("UPDATE nodes SET policy=?, updated_at=? WHERE node_id=?")
            .bind(policy_json)
            .bind(now)
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let row: NodeRow = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        row_to_node(row)
    }

    async fn get_node(&self, node_id: &str) -> CoreResult<Node> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row_to_node(row.ok_or_else(|| CoreError::not_found("node", node_id))?)
    }

    async fn list_nodes(&self) -> CoreResult<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as("SELECT * FROM nodes ORDER BY node_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(row_to_node).collect()
    }

    async fn mark_offline_if_stale(&self, cutoff_seconds: i64) -> CoreResult<Vec<Node>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(cutoff_seconds);

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let rows: Vec<NodeRow> = sqlx::query_as("SELECT * FROM nodes WHERE last_seen < ? AND status != ?")
            .bind(cutoff)
            .bind(codec::node_status_to_str(NodeStatus::Offline))
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut transitioned = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.status = codec::node_status_to_str(NodeStatus::Offline).to_string();
            row.updated_at = now;
            sqlx::query("UPDATE nodes SET status=?, updated_at=? WHERE node_id=?")
                .bind(&row.status)
                .bind(row.updated_at)
                .bind(&row.node_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            tracing::info!(node_id = %row.node_id, "node marked offline after staleness cutoff");
            transitioned.push(row_to_node(row)?);
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(transitioned)
    }

    async fn create_job(&self, job: Job) -> CoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, payload_ref, assigned_node_id, attempts, error, \
             created_at, updated_at, started_at, completed_at, total_tasks, queued_tasks, running_tasks, \
             completed_tasks, failed_tasks, total_retries, assigned_nodes, avg_task_duration_ms, \
             throughput_tasks_per_minute) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0, 0, 0, '[]', NULL, NULL)",
        )
        .bind(&job.id)
        .bind(codec::task_type_to_str(job.r#type))
        .bind(codec::job_status_to_str(job.status))
        .bind(&job.payload_ref)
        .bind(&job.assigned_node_id)
        .bind(job.attempts as i64)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.get_job(&job.id).await
    }

    async fn list_jobs(&self, filter: JobFilter) -> CoreResult<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.task_type.is_some() {
            sql.push_str(" AND job_type = ?");
        }
        if filter.node_id.is_some() {
            sql.push_str(" AND (assigned_node_id = ? OR id IN (SELECT job_id FROM tasks WHERE assigned_node_id = ?))");
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC");

        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(codec::job_status_to_str(status));
        }
        if let Some(task_type) = filter.task_type {
            query = query.bind(codec::task_type_to_str(task_type));
        }
        if let Some(node_id) = &filter.node_id {
            query = query.bind(node_id).bind(node_id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn get_job(&self, job_id: &str) -> CoreResult<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row_to_job(row.ok_or_else(|| CoreError::not_found("job", job_id))?)
    }

    async fn assign_job(&self, job_id: &str, node_id: Option<&str>) -> CoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let result = sqlx::query("UPDATE jobs SET assigned_node_id=?, updated_at=? WHERE id=?")
            .bind(node_id)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("job", job_id));
        }
        self.get_job(job_id).await
    }

    async fn transition_job_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        error: Option<&str>,
    ) -> CoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| CoreError::not_found("job", job_id))?;

        let current_status = codec::job_status_from_str(&row.status)?;

        if current_status == new_status {
            if let Some(error) = error {
                row.error = Some(error.to_string());
                row.updated_at = now;
            }
        } else {
            let allowed = matches!(
                (current_status, new_status),
                (JobStatus::Queued, JobStatus::Running)
                    | (JobStatus::Running, JobStatus::Completed)
                    | (JobStatus::Running, JobStatus::Failed)
            );
            if !allowed {
                return Err(CoreError::InvalidTransition {
                    from: codec::job_status_to_str(current_status).to_string(),
                    to: codec::job_status_to_str(new_status).to_string(),
                });
            }

            row.status = codec::job_status_to_str(new_status).to_string();
            row.updated_at = now;

            match new_status {
                JobStatus::Running => {
                    row.started_at = row.started_at.or(Some(now));
                    row.attempts += 1;
                    row.error = None;
                }
                JobStatus::Completed => {
                    row.completed_at = Some(now);
                    row.error = None;
                }
                JobStatus::Failed => {
                    row.completed_at = Some(now);
                    row.error = Some(
                        error
                            .map(str::to_string)
                            .or_else(|| row.error.clone())
                            .unwrap_or_else(|| "Job failed".to_string()),
                    );
                }
                _ => {}
            }
        }

        sqlx::query(
            "UPDATE jobs SET status=?, updated_at=?, attempts=?, started_at=?, completed_at=?, error=? WHERE id=?",
        )
        .bind(&row.status)
        .bind(row.updated_at)
        .bind(row.attempts)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(&row.error)
        .bind(&row.id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        row_to_job(row)
    }

    async fn create_tasks(
        &self,
        job_id: &str,
        task_type: TaskType,
        payloads: Vec<serde_json::Map<String, serde_json::Value>>,
        max_retries: u32,
    ) -> CoreResult<Vec<Task>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        if exists.is_none() {
            return Err(CoreError::not_found("job", job_id));
        }

        let mut created = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let task_id = new_id("task");
            let payload_json = serde_json::to_string(&payload).map_err(|e| CoreError::Internal(e.to_string()))?;

            sqlx::query(
                "INSERT INTO tasks (id, job_id, task_type, payload, status, assigned_node_id, retries, \
                 max_retries, lease_expires_at, created_at, updated_at, started_at, completed_at, error) \
                 VALUES (?, ?, ?, ?, ?, NULL, 0, ?, NULL, ?, ?, NULL, NULL, NULL)",
            )
            .bind(&task_id)
            .bind(job_id)
            .bind(codec::task_type_to_str(task_type))
            .bind(&payload_json)
            .bind(codec::task_status_to_str(TaskStatus::Queued))
            .bind(max_retries as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            created.push(Task::new(task_id, job_id, task_type, payload, max_retries, now));
        }

        refresh_job_aggregates(&mut tx, job_id, now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(created)
    }

    async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        if filter.job_id.is_some() {
            sql.push_str(" AND job_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.node_id.is_some() {
            sql.push_str(" AND assigned_node_id = ?");
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(job_id) = &filter.job_id {
            query = query.bind(job_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(codec::task_status_to_str(status));
        }
        if let Some(node_id) = &filter.node_id {
            query = query.bind(node_id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row_to_task(row.ok_or_else(|| CoreError::not_found("task", task_id))?)
    }

    #[tracing::instrument(skip(self))]
    async fn pull_task_for_node(&self, node_id: &str, lease_seconds: i64) -> CoreResult<Option<Task>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let lease_expires_at = now + ChronoDuration::seconds(lease_seconds);

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        recover_stale_tasks_locked(&mut tx, now).await?;

        let node_row: Option<NodeRow> = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let Some(node_row) = node_row else {
            tx.commit().await.map_err(map_sqlx_error)?;
            return Ok(None);
        };
        let node = row_to_node(node_row)?;

        let queued_rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC")
            .bind(codec::task_status_to_str(TaskStatus::Queued))
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut selected: Option<(TaskRow, f64)> = None;
        for row in queued_rows {
            let task_type = codec::task_type_from_str(&row.task_type)?;
            let (eligible, _reasons) = scheduler::evaluate_node_eligibility(&node, task_type);
            if !eligible {
                continue;
            }

            let base_score = scheduler::score_node(&node, task_type);
            let age_seconds = (now - row.created_at).num_milliseconds() as f64 / 1000.0;
            let weighted = base_score + (age_seconds / 30.0).max(0.0);

            let better = match &selected {
                None => true,
                Some((_, best)) => weighted > *best,
            };
            if better {
                selected = Some((row, weighted));
            }
        }

        let Some((mut task_row, _)) = selected else {
            tx.commit().await.map_err(map_sqlx_error)?;
            return Ok(None);
        };

        task_row.status = codec::task_status_to_str(TaskStatus::Running).to_string();
        task_row.assigned_node_id = Some(node_id.to_string());
        task_row.lease_expires_at = Some(lease_expires_at);
        task_row.started_at = task_row.started_at.or(Some(now));
        task_row.updated_at = now;

        sqlx::query(
            "UPDATE tasks SET status=?, assigned_node_id=?, lease_expires_at=?, started_at=?, updated_at=? WHERE id=?",
        )
        .bind(&task_row.status)
        .bind(&task_row.assigned_node_id)
        .bind(task_row.lease_expires_at)
        .bind(task_row.started_at)
        .bind(task_row.updated_at)
        .bind(&task_row.id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("UPDATE jobs SET status=?, assigned_node_id=?, started_at=COALESCE(started_at, ?), updated_at=? WHERE id=?")
            .bind(codec::job_status_to_str(JobStatus::Running))
            .bind(node_id)
            .bind(now)
            .bind(now)
            .bind(&task_row.job_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        refresh_job_aggregates(&mut tx, &task_row.job_id, now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::info!(task_id = %task_row.id, node_id, "leased task to node");
        row_to_task(task_row).map(Some)
    }

    #[tracing::instrument(skip(self, result), fields(task_id = %result.task_id, node_id = %result.node_id))]
    async fn submit_task_result(&self, result: TaskResult) -> CoreResult<(Task, Job)> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut task_row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(&result.task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| CoreError::not_found("task", result.task_id.clone()))?;

        if let Some(assigned_to) = task_row.assigned_node_id.clone() {
            if assigned_to != result.node_id {
                return Err(CoreError::AssignmentMismatch {
                    task_id: result.task_id.clone(),
                    assigned_to,
                    submitted_by: result.node_id.clone(),
                });
            }
        }

        if !matches!(task_row.status.as_str(), "RUNNING" | "QUEUED") {
            return Err(CoreError::NotExecutable {
                task_id: result.task_id.clone(),
                status: task_row.status.clone(),
            });
        }

        let output_json = result
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        sqlx::query(
            "INSERT INTO results (id, task_id, node_id, success, output, duration_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id("result"))
        .bind(&result.task_id)
        .bind(&result.node_id)
        .bind(result.success as i64)
        .bind(output_json)
        .bind(result.duration_ms as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        task_row.lease_expires_at = None;
        task_row.updated_at = now;

        if result.success {
            task_row.status = codec::task_status_to_str(TaskStatus::Completed).to_string();
            task_row.completed_at = Some(now);
            task_row.error = None;
        } else {
            task_row.retries += 1;
            if task_row.retries > task_row.max_retries {
                task_row.status = codec::task_status_to_str(TaskStatus::Failed).to_string();
                task_row.completed_at = Some(now);
                task_row.error = Some("Task failed after max retries".to_string());
            } else {
                task_row.status = codec::task_status_to_str(TaskStatus::Queued).to_string();
                task_row.assigned_node_id = None;
                task_row.error = Some("Task execution failed; requeued".to_string());
            }
        }

        sqlx::query(
            "UPDATE tasks SET status=?, assigned_node_id=?, retries=?, lease_expires_at=?, updated_at=?, \
             completed_at=?, error=? WHERE id=?",
        )
        .bind(&task_row.status)
        .bind(&task_row.assigned_node_id)
        .bind(task_row.retries)
        .bind(task_row.lease_expires_at)
        .bind(task_row.updated_at)
        .bind(task_row.completed_at)
        .bind(&task_row.error)
        .bind(&task_row.id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let job_row = refresh_job_aggregates(&mut tx, &task_row.job_id, now)
            .await?
            .ok_or_else(|| CoreError::not_found("job", task_row.job_id.clone()))?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok((row_to_task(task_row)?, row_to_job(job_row)?))
    }

    async fn recover_stale_tasks(&self) -> CoreResult<Vec<Task>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let rows = recover_stale_tasks_locked(&mut tx, now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn get_execution_metrics(&self) -> CoreResult<ExecutionMetrics> {
        let now = Utc::now();
        let five_minutes_ago = now - ChronoDuration::minutes(5);

        let total_results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let success_results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE success = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let failed_results = total_results - success_results;

        let avg_duration_ms: Option<f64> = sqlx::query_scalar("SELECT AVG(duration_ms) FROM results")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let recent_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE created_at >= ?")
            .bind(five_minutes_ago)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let node_rows: Vec<(String, i64, Option<i64>)> = sqlx::query_as(
            "SELECT node_id, COUNT(*) as total, SUM(success) as success FROM results GROUP BY node_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut node_reliability = std::collections::HashMap::new();
        for (node_id, total, success) in node_rows {
            if total <= 0 {
                continue;
            }
            node_reliability.insert(node_id, round3(success.unwrap_or(0) as f64 / total as f64));
        }

        Ok(ExecutionMetrics {
            total_results: total_results.max(0) as u64,
            success_results: success_results.max(0) as u64,
            failed_results: failed_results.max(0) as u64,
            avg_duration_ms: avg_duration_ms.map(round3),
            throughput_tasks_per_minute: round3(recent_count as f64 / 5.0),
            node_reliability,
        })
    }

    async fn cluster_summary(&self) -> CoreResult<ClusterSummary> {
        let nodes = self.list_nodes().await?;
        let mut summary = ClusterSummary::default();

        for node in &nodes {
            if !node.policy.enabled || node.status != NodeStatus::Online {
                continue;
            }
            let capacity = scheduler::compute_effective_capacity(node);
            summary.total_cpu_threads += capacity.cpu_threads;
            summary.total_ram_gb += capacity.ram_gb;
            summary.total_vram_gb += capacity.vram_gb.unwrap_or(0.0);
            summary.node_count += 1;
        }

        summary.total_cpu_threads = round3(summary.total_cpu_threads);
        summary.total_ram_gb = round3(summary.total_ram_gb);
        summary.total_vram_gb = round3(summary.total_vram_gb);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.expect("in-memory sqlite store")
    }

    #[tokio::test]
    async fn lazily_creates_a_node_on_first_heartbeat() {
        let store = test_store().await;
        let node = store
            .update_node_metrics(
                "node-1",
                NodeMetrics {
                    cpu_percent: 12.0,
                    ..NodeMetrics::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.identity.node_id, "node-1");
    }

    #[tokio::test]
    async fn s3_pull_and_result_round_trip() {
        let store = test_store().await;
        store
            .upsert_node_identity("node-1", "Node One", "10.0.0.5", 9000)
            .await
            .unwrap();
        store
            .update_node_metrics("node-1", NodeMetrics::default())
            .await
            .unwrap();

        let job = Job::new("job-1", TaskType::Embeddings, None, Utc::now());
        store.create_job(job).await.unwrap();
        store
            .create_tasks(
                "job-1",
                TaskType::Embeddings,
                vec![serde_json::Map::new(), serde_json::Map::new()],
                2,
            )
            .await
            .unwrap();

        let first = store.pull_task_for_node("node-1", 30).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Running);

        let (task, job) = store
            .submit_task_result(TaskResult {
                task_id: first.id.clone(),
                node_id: "node-1".to_string(),
                success: true,
                output: None,
                duration_ms: 120,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(job.completed_tasks, 1);

        let second = store.pull_task_for_node("node-1", 30).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn s4_retry_then_fail_on_repeated_failure() {
        let store = test_store().await;
        store
            .upsert_node_identity("node-1", "Node One", "10.0.0.5", 9000)
            .await
            .unwrap();
        store
            .update_node_metrics("node-1", NodeMetrics::default())
            .await
            .unwrap();

        let job = Job::new("job-1", TaskType::Inference, None, Utc::now());
        store.create_job(job).await.unwrap();
        store
            .create_tasks("job-1", TaskType::Inference, vec![serde_json::Map::new()], 1)
            .await
            .unwrap();

        let task = store.pull_task_for_node("node-1", 30).await.unwrap().unwrap();

        let (task, _) = store
            .submit_task_result(TaskResult {
                task_id: task.id.clone(),
                node_id: "node-1".to_string(),
                success: false,
                output: None,
                duration_ms: 10,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retries, 1);
        assert_eq!(task.error.as_deref(), Some("Task execution failed; requeued"));

        let task = store.pull_task_for_node("node-1", 30).await.unwrap().unwrap();
        let (task, _) = store
            .submit_task_result(TaskResult {
                task_id: task.id.clone(),
                node_id: "node-1".to_string(),
                success: false,
                output: None,
                duration_ms: 10,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 2);
        assert_eq!(task.error.as_deref(), Some("Task failed after max retries"));
    }

    #[tokio::test]
    async fn s5_lease_expiry_requeues_the_task() {
        let store = test_store().await;
        store
            .upsert_node_identity("node-1", "Node One", "10.0.0.5", 9000)
            .await
            .unwrap();
        store
            .update_node_metrics("node-1", NodeMetrics::default())
            .await
            .unwrap();

        let job = Job::new("job-1", TaskType::Tokenize, None, Utc::now());
        store.create_job(job).await.unwrap();
        store
            .create_tasks("job-1", TaskType::Tokenize, vec![serde_json::Map::new()], 1)
            .await
            .unwrap();

        let leased = store.pull_task_for_node("node-1", 0).await.unwrap().unwrap();
        assert_eq!(leased.status, TaskStatus::Running);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let recovered = store.recover_stale_tasks().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, TaskStatus::Queued);
        assert_eq!(recovered[0].retries, 1);
        assert_eq!(recovered[0].error.as_deref(), Some("Task lease expired"));
    }

    #[tokio::test]
    async fn s6_job_fsm_rejects_invalid_transition() {
        let store = test_store().await;
        let job = Job::new("job-1", TaskType::Preprocess, None, Utc::now());
        store.create_job(job).await.unwrap();

        let err = store
            .transition_job_status("job-1", JobStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let running = store
            .transition_job_status("job-1", JobStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.attempts, 1);
        assert!(running.started_at.is_some());
    }

    #[tokio::test]
    async fn mark_offline_if_stale_transitions_silent_nodes() {
        let store = test_store().await;
        store
            .update_node_metrics("node-1", NodeMetrics::default())
            .await
            .unwrap();

        // heartbeat just happened, so nothing should move yet.
        let transitioned = store.mark_offline_if_stale(15).await.unwrap();
        assert!(transitioned.is_empty());

        sqlx::query("UPDATE nodes SET last_seen = datetime('now', '-1 hour') WHERE node_id = ?")
            .bind("node-1")
            .execute(&store.pool)
            .await
            .unwrap();

        let transitioned = store.mark_offline_if_stale(15).await.unwrap();
        assert_eq!(transitioned.len(), 1);
        assert_eq!(transitioned[0].status, NodeStatus::Offline);
    }
}
