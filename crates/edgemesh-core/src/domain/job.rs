use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{JobStatus, TaskType};

/// A job plus its derived aggregates (spec §3). Derived fields are always a
/// fresh recomputation over the job's tasks/results — never stored
/// authoritatively (see `edgemesh_store_sqlite::refresh_job_aggregates`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub r#type: TaskType,
    pub status: JobStatus,
    pub payload_ref: Option<String>,
    pub assigned_node_id: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub total_tasks: u32,
    pub queued_tasks: u32,
    pub running_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub total_retries: u32,
    pub assigned_nodes: Vec<String>,
    pub avg_task_duration_ms: Option<f64>,
    pub throughput_tasks_per_minute: Option<f64>,
}

impl Job {
    /// A freshly created job before any tasks are attached.
    pub fn new(id: impl Into<String>, r#type: TaskType, payload_ref: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            r#type,
            status: JobStatus::Queued,
            payload_ref,
            assigned_node_id: None,
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            total_tasks: 0,
            queued_tasks: 0,
            running_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_retries: 0,
            assigned_nodes: Vec::new(),
            avg_task_duration_ms: None,
            throughput_tasks_per_minute: None,
        }
    }
}

/// Structured event published on job changes (spec §4.7, §11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdateEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub updated_at: DateTime<Utc>,
}
