//! The persistence seam (spec §4.1). `Store` generalizes the teacher's
//! `JobStore` trait (`claim_ready`/`mark_succeeded`/`mark_failed`/`heartbeat`)
//! to four entities and a richer lifecycle; implementors own the
//! transactional discipline described in §5 and §9 — every mutating method
//! here is a single serialized transaction from the caller's point of view.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Job, Node, NodeCapabilities, NodeMetrics, NodePolicy, Task, TaskResult};
use crate::enums::{JobStatus, TaskType};
use crate::error::CoreResult;

/// Optional filters accepted by `list_jobs` (spec §4.1, §11).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub task_type: Option<TaskType>,
    pub node_id: Option<String>,
}

/// Optional filters accepted by `list_tasks` (spec §11).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub job_id: Option<String>,
    pub status: Option<crate::enums::TaskStatus>,
    pub node_id: Option<String>,
}

/// Aggregate effective capacity across the enabled, online fleet (spec §11
/// cluster summary).
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ClusterSummary {
    pub total_cpu_threads: f64,
    pub total_ram_gb: f64,
    pub total_vram_gb: f64,
    pub node_count: u64,
}

/// Aggregate over the result table (spec §4.5).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecutionMetrics {
    pub total_results: u64,
    pub success_results: u64,
    pub failed_results: u64,
    pub avg_duration_ms: Option<f64>,
    pub throughput_tasks_per_minute: f64,
    pub node_reliability: std::collections::HashMap<String, f64>,
}

/// Durable, transactionally consistent persistence of nodes, jobs, tasks and
/// results, with derived job statistics (spec §4.1).
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_node_identity(
        &self,
        node_id: &str,
        display_name: &str,
        ip: &str,
        port: u16,
    ) -> CoreResult<Node>;

    async fn upsert_node_capabilities(&self, node_id: &str, caps: NodeCapabilities) -> CoreResult<Node>;

    async fn update_node_metrics(&self, node_id: &str, metrics: NodeMetrics) -> CoreResult<Node>;

    async fn update_node_policy(&self, node_id: &str, policy: NodePolicy) -> CoreResult<Node>;

    async fn get_node(&self, node_id: &str) -> CoreResult<Node>;

    async fn list_nodes(&self) -> CoreResult<Vec<Node>>;

    /// Transitions every node with `last_seen < now - cutoff_seconds` and
    /// `status != OFFLINE` to OFFLINE; returns the transitioned nodes.
    async fn mark_offline_if_stale(&self, cutoff_seconds: i64) -> CoreResult<Vec<Node>>;

    async fn create_job(&self, job: Job) -> CoreResult<Job>;

    async fn list_jobs(&self, filter: JobFilter) -> CoreResult<Vec<Job>>;

    async fn get_job(&self, job_id: &str) -> CoreResult<Job>;

    /// A thin direct setter, distinct from the FSM in `transition_job_status`
    /// (spec §11 — the original exposes it as an un-gated field write).
    async fn assign_job(&self, job_id: &str, node_id: Option<&str>) -> CoreResult<Job>;

    /// Enforces the job FSM (spec §4.3); yields `InvalidTransition` on a
    /// disallowed edge.
    async fn transition_job_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        error: Option<&str>,
    ) -> CoreResult<Job>;

    /// Atomically inserts `payloads.len()` QUEUED tasks, then refreshes the
    /// parent job's derived aggregates.
    async fn create_tasks(
        &self,
        job_id: &str,
        task_type: TaskType,
        payloads: Vec<serde_json::Map<String, serde_json::Value>>,
        max_retries: u32,
    ) -> CoreResult<Vec<Task>>;

    async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<Task>>;

    async fn get_task(&self, task_id: &str) -> CoreResult<Task>;

    /// The scheduler entry point (spec §4.2, §4.4). `None` when no eligible
    /// queued task exists for this node.
    async fn pull_task_for_node(&self, node_id: &str, lease_seconds: i64) -> CoreResult<Option<Task>>;

    /// Validates assignment match, appends the result row, advances task
    /// status, and refreshes the parent job.
    async fn submit_task_result(&self, result: TaskResult) -> CoreResult<(Task, Job)>;

    /// Expires leases on RUNNING tasks whose `lease_expires_at` has passed
    /// (spec §4.4); returns the tasks it touched.
    async fn recover_stale_tasks(&self) -> CoreResult<Vec<Task>>;

    async fn get_execution_metrics(&self) -> CoreResult<ExecutionMetrics>;

    async fn cluster_summary(&self) -> CoreResult<ClusterSummary>;
}

/// Monotonic clock seam so tests can control "now" without sleeping; the
/// real implementation is `Utc::now`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
