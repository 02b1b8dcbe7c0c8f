//! Fluent fixture builders. Defaults produce an eligible, idle, online node
//! and a freshly-queued job — tests override only the fields that matter to
//! the scenario at hand.

use chrono::Utc;
use edgemesh_core::domain::{Node, NodeCapabilities, NodeIdentity, NodeMetrics, NodePolicy, Task};
use edgemesh_core::{domain::Job, JobStatus, NodeStatus, TaskType};

/// Builds a [`Node`] with sane, eligible-by-default capabilities/metrics/policy.
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let node_id = node_id.into();
        Self {
            node: Node {
                identity: NodeIdentity {
                    node_id: node_id.clone(),
                    display_name: node_id,
                    ip: "127.0.0.1".to_string(),
                    port: 9000,
                },
                capabilities: NodeCapabilities {
                    cpu_cores: Some(8),
                    cpu_threads: Some(16),
                    ram_total_gb: Some(32.0),
                    ram_gb: Some(32.0),
                    ..NodeCapabilities::default()
                }
                .normalize(),
                metrics: NodeMetrics::default(),
                policy: NodePolicy::default(),
                status: NodeStatus::Online,
                last_seen: now,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.node.status = status;
        self
    }

    pub fn capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.node.capabilities = capabilities.normalize();
        self
    }

    pub fn metrics(mut self, metrics: NodeMetrics) -> Self {
        self.node.metrics = metrics;
        self
    }

    pub fn policy(mut self, policy: NodePolicy) -> Self {
        self.node.policy = policy;
        self
    }

    pub fn has_gpu(mut self, vram_gb: f64) -> Self {
        self.node.capabilities.has_gpu = true;
        self.node.capabilities.vram_total_gb = Some(vram_gb);
        self
    }

    pub fn last_seen(mut self, last_seen: chrono::DateTime<Utc>) -> Self {
        self.node.last_seen = last_seen;
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

/// Builds a [`Job`] plus `n` unstarted [`Task`]s sharing its type, the shape
/// `create_job`/`create_tasks` callers assemble in practice.
pub struct JobBuilder {
    job: Job,
    task_count: usize,
    max_retries: u32,
}

impl JobBuilder {
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            job: Job::new(id, task_type, None, now),
            task_count: 0,
            max_retries: 2,
        }
    }

    pub fn payload_ref(mut self, payload_ref: impl Into<String>) -> Self {
        self.job.payload_ref = Some(payload_ref.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn with_tasks(mut self, count: usize) -> Self {
        self.task_count = count;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builds the job and its unattached tasks. Callers persist the job via
    /// `Store::create_job` then the tasks via `Store::create_tasks` (or feed
    /// them straight into a [`crate::MemoryStore`] fixture).
    pub fn build(self) -> (Job, Vec<Task>) {
        let now = Utc::now();
        let tasks = (0..self.task_count)
            .map(|i| {
                Task::new(
                    format!("{}-task-{i}", self.job.id),
                    self.job.id.clone(),
                    self.job.r#type,
                    serde_json::Map::new(),
                    self.max_retries,
                    now,
                )
            })
            .collect();
        (self.job, tasks)
    }
}
