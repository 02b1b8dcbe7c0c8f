use serde::{Deserialize, Serialize};

/// The kind of work a task (and the job it belongs to) performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Inference,
    Embeddings,
    Index,
    Tokenize,
    Preprocess,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::Inference,
        TaskType::Embeddings,
        TaskType::Index,
        TaskType::Tokenize,
        TaskType::Preprocess,
    ];

    /// Only inference currently benefits from / is constrained by a GPU.
    pub fn requires_gpu_signal(self) -> bool {
        matches!(self, TaskType::Inference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolePreference {
    Auto,
    PreferInference,
    PreferEmbeddings,
    PreferPreprocess,
}

impl Default for RolePreference {
    fn default() -> Self {
        RolePreference::Auto
    }
}
