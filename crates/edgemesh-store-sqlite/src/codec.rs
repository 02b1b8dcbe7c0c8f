//! Plain string codecs for the enum columns used in `WHERE`/index
//! predicates. Kept separate from `serde_json` (used for the JSON blob
//! columns) because a bare `TEXT` column needs `'QUEUED'`, not `'"QUEUED"'`.

use edgemesh_core::{CoreError, JobStatus, NodeStatus, TaskStatus, TaskType};

pub fn job_status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUEUED",
        JobStatus::Running => "RUNNING",
        JobStatus::Completed => "COMPLETED",
        JobStatus::Failed => "FAILED",
        JobStatus::Cancelled => "CANCELLED",
    }
}

pub fn job_status_from_str(value: &str) -> Result<JobStatus, CoreError> {
    match value {
        "QUEUED" => Ok(JobStatus::Queued),
        "RUNNING" => Ok(JobStatus::Running),
        "COMPLETED" => Ok(JobStatus::Completed),
        "FAILED" => Ok(JobStatus::Failed),
        "CANCELLED" => Ok(JobStatus::Cancelled),
        other => Err(CoreError::Internal(format!("unknown job status '{other}' in storage"))),
    }
}

pub fn task_status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "QUEUED",
        TaskStatus::Running => "RUNNING",
        TaskStatus::Completed => "COMPLETED",
        TaskStatus::Failed => "FAILED",
    }
}

pub fn task_status_from_str(value: &str) -> Result<TaskStatus, CoreError> {
    match value {
        "QUEUED" => Ok(TaskStatus::Queued),
        "RUNNING" => Ok(TaskStatus::Running),
        "COMPLETED" => Ok(TaskStatus::Completed),
        "FAILED" => Ok(TaskStatus::Failed),
        other => Err(CoreError::Internal(format!("unknown task status '{other}' in storage"))),
    }
}

pub fn node_status_to_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Unknown => "UNKNOWN",
        NodeStatus::Online => "ONLINE",
        NodeStatus::Offline => "OFFLINE",
    }
}

pub fn node_status_from_str(value: &str) -> Result<NodeStatus, CoreError> {
    match value {
        "UNKNOWN" => Ok(NodeStatus::Unknown),
        "ONLINE" => Ok(NodeStatus::Online),
        "OFFLINE" => Ok(NodeStatus::Offline),
        other => Err(CoreError::Internal(format!("unknown node status '{other}' in storage"))),
    }
}

pub fn task_type_to_str(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Inference => "INFERENCE",
        TaskType::Embeddings => "EMBEDDINGS",
        TaskType::Index => "INDEX",
        TaskType::Tokenize => "TOKENIZE",
        TaskType::Preprocess => "PREPROCESS",
    }
}

pub fn task_type_from_str(value: &str) -> Result<TaskType, CoreError> {
    match value {
        "INFERENCE" => Ok(TaskType::Inference),
        "EMBEDDINGS" => Ok(TaskType::Embeddings),
        "INDEX" => Ok(TaskType::Index),
        "TOKENIZE" => Ok(TaskType::Tokenize),
        "PREPROCESS" => Ok(TaskType::Preprocess),
        other => Err(CoreError::Internal(format!("unknown task type '{other}' in storage"))),
    }
}
