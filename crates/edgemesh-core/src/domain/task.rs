use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::enums::{TaskStatus, TaskType};

/// An atomic executable unit owned by a job (spec §3). `payload` is an
/// opaque key→value map (spec §9 "dynamic payload maps") — modeled as a
/// JSON object rather than a closed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub r#type: TaskType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub status: TaskStatus,
    pub assigned_node_id: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        job_id: impl Into<String>,
        r#type: TaskType,
        payload: Map<String, Value>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            r#type,
            payload,
            status: TaskStatus::Queued,
            assigned_node_id: None,
            retries: 0,
            max_retries,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// An append-only execution result (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub node_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Option<Map<String, Value>>,
    pub duration_ms: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}
