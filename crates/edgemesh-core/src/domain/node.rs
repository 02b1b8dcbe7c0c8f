use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{NodeStatus, RolePreference, TaskType};

/// Stable identity fields mutated by `upsert_node_identity` (spec §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub display_name: String,
    pub ip: String,
    pub port: u16,
}

/// Raw hardware capability, normalized by [`NodeCapabilities::normalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub task_types: Vec<TaskType>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub has_gpu: bool,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub cpu_threads: Option<u32>,
    #[serde(default)]
    pub ram_total_gb: Option<f64>,
    #[serde(default)]
    pub ram_gb: Option<f64>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub vram_total_gb: Option<f64>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            task_types: Vec::new(),
            labels: Vec::new(),
            has_gpu: false,
            cpu_cores: None,
            cpu_threads: None,
            ram_total_gb: None,
            ram_gb: None,
            gpu_name: None,
            vram_total_gb: None,
            os: None,
            arch: None,
        }
    }
}

impl NodeCapabilities {
    /// Applies the ram mirroring and `has_gpu` derivation rules from spec §3,
    /// and defaults an empty `task_types` to every known type (§11).
    pub fn normalize(mut self) -> Self {
        match (self.ram_total_gb, self.ram_gb) {
            (Some(v), None) => self.ram_gb = Some(v),
            (None, Some(v)) => self.ram_total_gb = Some(v),
            _ => {}
        }
        if self.gpu_name.is_some() || self.vram_total_gb.is_some() {
            self.has_gpu = true;
        }
        if self.task_types.is_empty() {
            self.task_types = TaskType::ALL.to_vec();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub ram_used_gb: f64,
    #[serde(default)]
    pub ram_percent: f64,
    #[serde(default)]
    pub gpu_percent: Option<f64>,
    #[serde(default)]
    pub vram_used_gb: Option<f64>,
    #[serde(default)]
    pub running_jobs: u32,
    #[serde(default = "Utc::now")]
    pub heartbeat_ts: DateTime<Utc>,
    #[serde(default)]
    pub extra: HashMap<String, f64>,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            ram_used_gb: 0.0,
            ram_percent: 0.0,
            gpu_percent: None,
            vram_used_gb: None,
            running_jobs: 0,
            heartbeat_ts: Utc::now(),
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cap")]
    pub cpu_cap_percent: u8,
    #[serde(default)]
    pub gpu_cap_percent: Option<u8>,
    #[serde(default = "default_cap")]
    pub ram_cap_percent: u8,
    #[serde(default = "all_task_types")]
    pub task_allowlist: Vec<TaskType>,
    #[serde(default)]
    pub role_preference: RolePreference,
}

fn default_true() -> bool {
    true
}

fn default_cap() -> u8 {
    100
}

fn all_task_types() -> Vec<TaskType> {
    TaskType::ALL.to_vec()
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_cap_percent: 100,
            gpu_cap_percent: None,
            ram_cap_percent: 100,
            task_allowlist: TaskType::ALL.to_vec(),
            role_preference: RolePreference::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub identity: NodeIdentity,
    pub capabilities: NodeCapabilities,
    pub metrics: NodeMetrics,
    pub policy: NodePolicy,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A node created lazily on first mention by `node_id` (spec §3 Lifecycle).
    pub fn new_default(node_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let node_id = node_id.into();
        Self {
            identity: NodeIdentity {
                node_id,
                display_name: String::new(),
                ip: "0.0.0.0".to_string(),
                port: 0,
            },
            capabilities: NodeCapabilities::default(),
            metrics: NodeMetrics::default(),
            policy: NodePolicy::default(),
            status: NodeStatus::Unknown,
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Structured event published on node changes (spec §4.7, §11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUpdateEvent {
    pub node_id: String,
    pub status: NodeStatus,
    pub metrics: NodeMetrics,
    pub updated_at: DateTime<Utc>,
}
