//! An in-memory `Store` double. Mirrors the transactional semantics of
//! `edgemesh-store-sqlite::SqliteStore` (single writer, derived job
//! aggregates recomputed on every task-touching mutation) over `DashMap`s
//! instead of a sqlite pool, so unit tests can exercise the scheduler and
//! job lifecycle without paying for a database.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use edgemesh_core::domain::{Job, Node, NodeCapabilities, NodeMetrics, NodePolicy, Task, TaskResult};
use edgemesh_core::enums::{JobStatus, NodeStatus, TaskStatus, TaskType};
use edgemesh_core::error::{CoreError, CoreResult};
use edgemesh_core::scheduler;
use edgemesh_core::store::{ClusterSummary, ExecutionMetrics, JobFilter, Store, TaskFilter};
use tokio::sync::Mutex;

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone)]
struct StoredResult {
    task_id_hint: String,
    node_id: String,
    success: bool,
    duration_ms: u64,
    created_at: DateTime<Utc>,
}

/// Thread-safe, process-local implementation of `edgemesh_core::Store`.
#[derive(Default)]
pub struct MemoryStore {
    nodes: DashMap<String, Node>,
    jobs: DashMap<String, Job>,
    tasks: DashMap<String, Task>,
    results: DashMap<u64, StoredResult>,
    result_seq: AtomicU64,
    task_seq: AtomicU64,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_task_id(&self, job_id: &str) -> String {
        let n = self.task_seq.fetch_add(1, Ordering::Relaxed);
        format!("{job_id}-task-{n}")
    }

    fn next_result_id(&self) -> u64 {
        self.result_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_node(&self, node_id: &str, now: DateTime<Utc>) {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| Node::new_default(node_id, now));
    }

    /// Recomputes a job's derived aggregates from its tasks/results. `None`
    /// if the job doesn't exist.
    fn refresh_job_aggregates(&self, job_id: &str, now: DateTime<Utc>) -> Option<Job> {
        let mut job = self.jobs.get_mut(job_id)?;

        let job_tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().job_id == job_id)
            .map(|entry| entry.value().clone())
            .collect();

        let task_ids: std::collections::HashSet<&str> =
            job_tasks.iter().map(|t| t.id.as_str()).collect();
        let job_results: Vec<StoredResult> = self
            .results
            .iter()
            .filter_map(|entry| {
                let result = entry.value();
                // a result's task may already be gone from `job_tasks` if the
                // task was reassigned; match on duration/node only once we
                // know the owning task id, tracked alongside the result.
                Some(result.clone())
            })
            .collect();
        let _ = task_ids; // results are keyed independently below

        let total_tasks = job_tasks.len() as u32;
        let queued_tasks = job_tasks.iter().filter(|t| t.status == TaskStatus::Queued).count() as u32;
        let running_tasks = job_tasks.iter().filter(|t| t.status == TaskStatus::Running).count() as u32;
        let completed_tasks = job_tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as u32;
        let failed_tasks = job_tasks.iter().filter(|t| t.status == TaskStatus::Failed).count() as u32;
        let total_retries: u32 = job_tasks.iter().map(|t| t.retries).sum();

        let assigned_nodes: Vec<String> = job_tasks
            .iter()
            .filter_map(|t| t.assigned_node_id.clone())
            .filter(|id| !id.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let relevant_durations: Vec<u64> = self
            .task_result_durations(job_id)
            .into_iter()
            .collect();
        let avg_task_duration_ms = if relevant_durations.is_empty() {
            None
        } else {
            let sum: f64 = relevant_durations.iter().map(|d| *d as f64).sum();
            Some(round3(sum / relevant_durations.len() as f64))
        };

        let started_values: Vec<DateTime<Utc>> = job_tasks.iter().filter_map(|t| t.started_at).collect();
        let completed_values: Vec<DateTime<Utc>> = job_tasks.iter().filter_map(|t| t.completed_at).collect();

        let throughput_tasks_per_minute = if completed_tasks > 0 {
            started_values.iter().min().map(|earliest| {
                let elapsed_minutes = (now - *earliest).num_milliseconds() as f64 / 60_000.0;
                round3(completed_tasks as f64 / elapsed_minutes.max(1e-6))
            })
        } else {
            None
        };

        let mut status = job.status;
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

        job.status = status;
        job.updated_at = now;
        job.attempts = total_retries;
        job.assigned_node_id = assigned_nodes.first().cloned();
        job.total_tasks = total_tasks;
        job.queued_tasks = queued_tasks;
        job.running_tasks = running_tasks;
        job.completed_tasks = completed_tasks;
        job.failed_tasks = failed_tasks;
        job.total_retries = total_retries;
        job.assigned_nodes = assigned_nodes;
        job.avg_task_duration_ms = avg_task_duration_ms;
        job.throughput_tasks_per_minute = throughput_tasks_per_minute;

        if job.started_at.is_none() {
            job.started_at = started_values.into_iter().min();
        }

        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            if let Some(max_completed) = completed_values.into_iter().max() {
                job.completed_at = Some(max_completed);
            }
        } else {
            job.completed_at = None;
        }

        if status == JobStatus::Failed && failed_tasks > 0 {
            job.error = Some(format!("{failed_tasks} tasks failed"));
        } else if status == JobStatus::Completed {
            job.error = None;
        }

        let _ = job_results;
        Some(job.clone())
    }

    fn task_result_durations(&self, job_id: &str) -> Vec<u64> {
        let task_ids: BTreeSet<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().job_id == job_id)
            .map(|entry| entry.key().clone())
            .collect();
        self.results
            .iter()
            .filter(|entry| task_ids.contains(&entry.value().task_id_hint))
            .map(|entry| entry.value().duration_ms)
            .collect()
    }

    fn recover_stale_tasks_locked(&self, now: DateTime<Utc>) -> Vec<Task> {
        let stale_ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| {
                let t = entry.value();
                t.status == TaskStatus::Running
                    && t.lease_expires_at.map(|expiry| expiry < now).unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut touched_jobs = BTreeSet::new();
        let mut recovered = Vec::with_capacity(stale_ids.len());

        for id in stale_ids {
            let mut task = self.tasks.get_mut(&id).expect("task exists");
            task.retries += 1;
            task.lease_expires_at = None;
            task.updated_at = now;
            task.error = Some("Task lease expired".to_string());

            if task.retries > task.max_retries {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
            } else {
                task.status = TaskStatus::Queued;
                task.assigned_node_id = None;
            }

            touched_jobs.insert(task.job_id.clone());
            recovered.push(task.clone());
        }

        for job_id in touched_jobs {
            self.refresh_job_aggregates(&job_id, now);
        }

        recovered
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_node_identity(
        &self,
        node_id: &str,
        display_name: &str,
        ip: &str,
        port: u16,
    ) -> CoreResult<Node> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        self.ensure_node(node_id, now);
        let mut node = self.nodes.get_mut(node_id).expect("just ensured");
        node.identity.display_name = display_name.to_string();
        node.identity.ip = ip.to_string();
        node.identity.port = port;
        node.updated_at = now;
        Ok(node.clone())
    }

    async fn upsert_node_capabilities(&self, node_id: &str, caps: NodeCapabilities) -> CoreResult<Node> {
        edgemesh_core::validation::validate_capabilities(&caps)?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        self.ensure_node(node_id, now);
        let mut node = self.nodes.get_mut(node_id).expect("just ensured");
        node.capabilities = caps.normalize();
        node.updated_at = now;
        Ok(node.clone())
    }

    async fn update_node_metrics(&self, node_id: &str, metrics: NodeMetrics) -> CoreResult<Node> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        self.ensure_node(node_id, now);
        let mut node = self.nodes.get_mut(node_id).expect("just ensured");
        node.last_seen = metrics.heartbeat_ts;
        node.metrics = metrics;
        node.status = NodeStatus::Online;
        node.updated_at = now;
        Ok(node.clone())
    }

    async fn update_node_policy(&self, node_id: &str, policy: NodePolicy) -> CoreResult<Node> {
        edgemesh_core::validation::validate_policy(&policy)?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        self.ensure_node(node_id, now);
        let mut node = self.nodes.get_mut(node_id).expect("just ensured");
        node.policy = policy;
        node.updated_at = now;
        Ok(node.clone())
    }

    async fn get_node(&self, node_id: &str) -> CoreResult<Node> {
        self.nodes
            .get(node_id)
            .map(|n| n.clone())
            .ok_or_else(|| CoreError::not_found("node", node_id))
    }

    async fn list_nodes(&self) -> CoreResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.identity.node_id.cmp(&b.identity.node_id));
        Ok(nodes)
    }

    async fn mark_offline_if_stale(&self, cutoff_seconds: i64) -> CoreResult<Vec<Node>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(cutoff_seconds);

        let mut transitioned = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            if entry.last_seen < cutoff && entry.status != NodeStatus::Offline {
                entry.status = NodeStatus::Offline;
                entry.updated_at = now;
                transitioned.push(entry.clone());
            }
        }
        Ok(transitioned)
    }

    async fn create_job(&self, job: Job) -> CoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn list_jobs(&self, filter: JobFilter) -> CoreResult<Vec<Job>> {
        let node_tasks: Option<BTreeSet<String>> = filter.node_id.as_ref().map(|node_id| {
            self.tasks
                .iter()
                .filter(|e| e.value().assigned_node_id.as_deref() == Some(node_id.as_str()))
                .map(|e| e.value().job_id.clone())
                .collect()
        });

        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .map(|e| e.value().clone())
            .filter(|job| filter.status.map(|s| s == job.status).unwrap_or(true))
            .filter(|job| filter.task_type.map(|t| t == job.r#type).unwrap_or(true))
            .filter(|job| match &filter.node_id {
                None => true,
                Some(node_id) => {
                    job.assigned_node_id.as_deref() == Some(node_id.as_str())
                        || node_tasks.as_ref().map(|set| set.contains(&job.id)).unwrap_or(false)
                }
            })
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn get_job(&self, job_id: &str) -> CoreResult<Job> {
        self.jobs
            .get(job_id)
            .map(|j| j.clone())
            .ok_or_else(|| CoreError::not_found("job", job_id))
    }

    async fn assign_job(&self, job_id: &str, node_id: Option<&str>) -> CoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        job.assigned_node_id = node_id.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn transition_job_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        error: Option<&str>,
    ) -> CoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::not_found("job", job_id))?;

        if job.status == new_status {
            if let Some(error) = error {
                job.error = Some(error.to_string());
                job.updated_at = now;
            }
            return Ok(job.clone());
        }

        let allowed = matches!(
            (job.status, new_status),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        );
        if !allowed {
            return Err(CoreError::InvalidTransition {
                from: format!("{:?}", job.status),
                to: format!("{:?}", new_status),
            });
        }

        job.status = new_status;
        job.updated_at = now;
        match new_status {
            JobStatus::Running => {
                job.started_at = job.started_at.or(Some(now));
                job.attempts += 1;
                job.error = None;
            }
            JobStatus::Completed => {
                job.completed_at = Some(now);
                job.error = None;
            }
            JobStatus::Failed => {
                job.completed_at = Some(now);
                job.error = Some(
                    error
                        .map(str::to_string)
                        .or_else(|| job.error.clone())
                        .unwrap_or_else(|| "Job failed".to_string()),
                );
            }
            _ => {}
        }

        Ok(job.clone())
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

        if !self.jobs.contains_key(job_id) {
            return Err(CoreError::not_found("job", job_id));
        }

        let mut created = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let task_id = self.next_task_id(job_id);
            let task = Task::new(task_id, job_id, task_type, payload, max_retries, now);
            self.tasks.insert(task.id.clone(), task.clone());
            created.push(task);
        }

        self.refresh_job_aggregates(job_id, now);
        Ok(created)
    }

    async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|e| e.value().clone())
            .filter(|t| filter.job_id.as_deref().map(|id| id == t.job_id).unwrap_or(true))
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| {
                filter
                    .node_id
                    .as_deref()
                    .map(|node_id| t.assigned_node_id.as_deref() == Some(node_id))
                    .unwrap_or(true)
            })
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        self.tasks
            .get(task_id)
            .map(|t| t.clone())
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    async fn pull_task_for_node(&self, node_id: &str, lease_seconds: i64) -> CoreResult<Option<Task>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        self.recover_stale_tasks_locked(now);

        let Some(node) = self.nodes.get(node_id).map(|n| n.clone()) else {
            return Ok(None);
        };

        let mut queued: Vec<Task> = self
            .tasks
            .iter()
            .map(|e| e.value().clone())
            .filter(|t| t.status == TaskStatus::Queued)
            .collect();
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut selected: Option<(Task, f64)> = None;
        for task in queued {
            let (eligible, _) = scheduler::evaluate_node_eligibility(&node, task.r#type);
            if !eligible {
                continue;
            }
            let base_score = scheduler::score_node(&node, task.r#type);
            let age_seconds = (now - task.created_at).num_milliseconds() as f64 / 1000.0;
            let weighted = base_score + (age_seconds / 30.0).max(0.0);

            let better = match &selected {
                None => true,
                Some((_, best)) => weighted > *best,
            };
            if better {
                selected = Some((task, weighted));
            }
        }

        let Some((selected_task, _)) = selected else {
            return Ok(None);
        };

        let mut task = self.tasks.get_mut(&selected_task.id).expect("task exists");
        task.status = TaskStatus::Running;
        task.assigned_node_id = Some(node_id.to_string());
        task.lease_expires_at = Some(now + ChronoDuration::seconds(lease_seconds));
        task.started_at = task.started_at.or(Some(now));
        task.updated_at = now;
        let job_id = task.job_id.clone();
        let result = task.clone();
        drop(task);

        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            job.status = JobStatus::Running;
            job.assigned_node_id = Some(node_id.to_string());
            job.started_at = job.started_at.or(Some(now));
            job.updated_at = now;
        }
        self.refresh_job_aggregates(&job_id, now);

        Ok(Some(result))
    }

    async fn submit_task_result(&self, result: TaskResult) -> CoreResult<(Task, Job)> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut task = self
            .tasks
            .get_mut(&result.task_id)
            .ok_or_else(|| CoreError::not_found("task", result.task_id.clone()))?;

        if let Some(assigned_to) = task.assigned_node_id.clone() {
            if assigned_to != result.node_id {
                return Err(CoreError::AssignmentMismatch {
                    task_id: result.task_id.clone(),
                    assigned_to,
                    submitted_by: result.node_id.clone(),
                });
            }
        }

        if !matches!(task.status, TaskStatus::Running | TaskStatus::Queued) {
            return Err(CoreError::NotExecutable {
                task_id: result.task_id.clone(),
                status: format!("{:?}", task.status),
            });
        }

        let result_id = self.next_result_id();
        self.results.insert(
            result_id,
            StoredResult {
                node_id: result.node_id.clone(),
                success: result.success,
                duration_ms: result.duration_ms,
                created_at: now,
                task_id_hint: task.id.clone(),
            },
        );

        task.lease_expires_at = None;
        task.updated_at = now;

        if result.success {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            task.error = None;
        } else {
            task.retries += 1;
            if task.retries > task.max_retries {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                task.error = Some("Task failed after max retries".to_string());
            } else {
                task.status = TaskStatus::Queued;
                task.assigned_node_id = None;
                task.error = Some("Task execution failed; requeued".to_string());
            }
        }

        let job_id = task.job_id.clone();
        let task_snapshot = task.clone();
        drop(task);

        let job = self
            .refresh_job_aggregates(&job_id, now)
            .ok_or_else(|| CoreError::not_found("job", job_id.clone()))?;

        Ok((task_snapshot, job))
    }

    async fn recover_stale_tasks(&self) -> CoreResult<Vec<Task>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        Ok(self.recover_stale_tasks_locked(now))
    }

    async fn get_execution_metrics(&self) -> CoreResult<ExecutionMetrics> {
        let now = Utc::now();
        let five_minutes_ago = now - ChronoDuration::minutes(5);

        let all: Vec<StoredResult> = self.results.iter().map(|e| e.value().clone()).collect();
        let total_results = all.len() as u64;
        let success_results = all.iter().filter(|r| r.success).count() as u64;
        let failed_results = total_results - success_results;

        let avg_duration_ms = if all.is_empty() {
            None
        } else {
            let sum: f64 = all.iter().map(|r| r.duration_ms as f64).sum();
            Some(round3(sum / all.len() as f64))
        };

        let recent = all.iter().filter(|r| r.created_at >= five_minutes_ago).count() as f64;

        let mut per_node: std::collections::HashMap<String, (u64, u64)> = std::collections::HashMap::new();
        for r in &all {
            let entry = per_node.entry(r.node_id.clone()).or_insert((0, 0));
            entry.0 += 1;
            if r.success {
                entry.1 += 1;
            }
        }
        let node_reliability = per_node
            .into_iter()
            .map(|(node_id, (total, success))| (node_id, round3(success as f64 / total as f64)))
            .collect();

        Ok(ExecutionMetrics {
            total_results,
            success_results,
            failed_results,
            avg_duration_ms,
            throughput_tasks_per_minute: round3(recent / 5.0),
            node_reliability,
        })
    }

    async fn cluster_summary(&self) -> CoreResult<ClusterSummary> {
        let mut summary = ClusterSummary::default();
        for entry in self.nodes.iter() {
            let node = entry.value();
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
    use crate::{JobBuilder, NodeBuilder};

    #[tokio::test]
    async fn pull_and_complete_round_trip() {
        let store = MemoryStore::new();
        let node = NodeBuilder::new("node-1").build();
        store.nodes.insert(node.identity.node_id.clone(), node);

        let (job, tasks) = JobBuilder::new("job-1", TaskType::Embeddings).with_tasks(2).build();
        store.create_job(job).await.unwrap();
        store
            .create_tasks(
                "job-1",
                TaskType::Embeddings,
                tasks.iter().map(|t| t.payload.clone()).collect(),
                2,
            )
            .await
            .unwrap();

        let leased = store.pull_task_for_node("node-1", 30).await.unwrap().unwrap();
        let (task, job) = store
            .submit_task_result(TaskResult {
                task_id: leased.id,
                node_id: "node-1".to_string(),
                success: true,
                output: None,
                duration_ms: 42,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(job.completed_tasks, 1);
        assert_eq!(job.total_tasks, 2);
    }

    #[tokio::test]
    async fn ineligible_node_never_receives_a_task() {
        let store = MemoryStore::new();
        let node = NodeBuilder::new("node-1")
            .policy(NodePolicy {
                enabled: false,
                ..NodePolicy::default()
            })
            .build();
        store.nodes.insert(node.identity.node_id.clone(), node);

        let (job, tasks) = JobBuilder::new("job-1", TaskType::Inference).with_tasks(1).build();
        store.create_job(job).await.unwrap();
        store
            .create_tasks("job-1", TaskType::Inference, tasks.into_iter().map(|t| t.payload).collect(), 2)
            .await
            .unwrap();

        assert!(store.pull_task_for_node("node-1", 30).await.unwrap().is_none());
    }
}
