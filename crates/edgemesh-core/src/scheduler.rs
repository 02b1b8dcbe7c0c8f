//! Eligibility + scoring scheduler (spec §4.2). Pure functions over a node
//! and a task type; no I/O, no hidden state — grounded line-for-line on
//! `original_source/edgemesh/coordinator/scheduler/core.py`.

use crate::domain::Node;
use crate::enums::{NodeStatus, RolePreference, TaskType};

/// Raw capability scaled by policy caps (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveCapacity {
    pub cpu_threads: f64,
    pub ram_gb: f64,
    pub vram_gb: Option<f64>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// `compute_effective_capacity` (spec §4.2, scenario S1).
pub fn compute_effective_capacity(node: &Node) -> EffectiveCapacity {
    let cpu_threads = node
        .capabilities
        .cpu_threads
        .or(node.capabilities.cpu_cores)
        .unwrap_or(0) as f64;
    let ram_total = node
        .capabilities
        .ram_total_gb
        .or(node.capabilities.ram_gb)
        .unwrap_or(0.0);

    let effective_cpu_threads = round3(cpu_threads * (node.policy.cpu_cap_percent as f64 / 100.0));
    let effective_ram_gb = round3(ram_total * (node.policy.ram_cap_percent as f64 / 100.0));

    let effective_vram_gb = node.capabilities.vram_total_gb.map(|vram_total| {
        let gpu_cap = node.policy.gpu_cap_percent.unwrap_or(100) as f64;
        round3(vram_total * (gpu_cap / 100.0))
    });

    EffectiveCapacity {
        cpu_threads: effective_cpu_threads,
        ram_gb: effective_ram_gb,
        vram_gb: effective_vram_gb,
    }
}

/// Reason codes accumulated by [`evaluate_node_eligibility`] (spec §4.2).
pub const REASON_POLICY_DISABLED: &str = "policy_disabled";
pub const REASON_NODE_NOT_ONLINE: &str = "node_not_online";
pub const REASON_TASK_NOT_ALLOWED: &str = "task_not_allowed";
pub const REASON_CPU_OVER_CAP: &str = "cpu_over_cap";
pub const REASON_RAM_OVER_CAP: &str = "ram_over_cap";
pub const REASON_GPU_OVER_CAP: &str = "gpu_over_cap";

/// `evaluate_node_eligibility` (spec §4.2, scenario S2). GPU caps are only
/// checked when a live GPU signal exists; absence is "no signal", not
/// "violation".
pub fn evaluate_node_eligibility(node: &Node, task_type: TaskType) -> (bool, Vec<&'static str>) {
    let mut reasons = Vec::new();

    if !node.policy.enabled {
        reasons.push(REASON_POLICY_DISABLED);
    }
    if node.status != NodeStatus::Online {
        reasons.push(REASON_NODE_NOT_ONLINE);
    }
    if !node.policy.task_allowlist.contains(&task_type) {
        reasons.push(REASON_TASK_NOT_ALLOWED);
    }
    if node.metrics.cpu_percent > node.policy.cpu_cap_percent as f64 {
        reasons.push(REASON_CPU_OVER_CAP);
    }
    if node.metrics.ram_percent > node.policy.ram_cap_percent as f64 {
        reasons.push(REASON_RAM_OVER_CAP);
    }

    if task_type.requires_gpu_signal() {
        if let Some(gpu_percent) = node.metrics.gpu_percent {
            let gpu_cap = node.policy.gpu_cap_percent.unwrap_or(100) as f64;
            if gpu_percent > gpu_cap {
                reasons.push(REASON_GPU_OVER_CAP);
            }
        }
    }

    (reasons.is_empty(), reasons)
}

pub fn is_node_eligible(node: &Node, task_type: TaskType) -> bool {
    evaluate_node_eligibility(node, task_type).0
}

/// `score_node` (spec §4.2). Higher is better; non-eligible nodes are still
/// scored (for diagnostic endpoints) but never selected by the pull path.
pub fn score_node(node: &Node, task_type: TaskType) -> f64 {
    let cpu_cap = (node.policy.cpu_cap_percent as f64).max(1.0);
    let ram_cap = (node.policy.ram_cap_percent as f64).max(1.0);

    let cpu_ratio = (node.metrics.cpu_percent / cpu_cap).min(2.0);
    let ram_ratio = (node.metrics.ram_percent / ram_cap).min(2.0);

    let mut score = 100.0 - (cpu_ratio * 50.0 + ram_ratio * 40.0);

    if task_type == TaskType::Inference && node.capabilities.has_gpu {
        if matches!(
            node.policy.role_preference,
            RolePreference::Auto | RolePreference::PreferInference
        ) {
            score += 10.0;
        }
    }

    let role_matches = matches!(
        (node.policy.role_preference, task_type),
        (RolePreference::PreferInference, TaskType::Inference)
            | (RolePreference::PreferEmbeddings, TaskType::Embeddings)
            | (RolePreference::PreferPreprocess, TaskType::Preprocess)
    );
    if role_matches {
        score += 15.0;
    }

    if task_type == TaskType::Inference {
        if let Some(gpu_percent) = node.metrics.gpu_percent {
            let gpu_cap = node.policy.gpu_cap_percent.unwrap_or(100).max(1) as f64;
            let gpu_ratio = (gpu_percent / gpu_cap).min(2.0);
            score -= gpu_ratio * 10.0;
        }
    }

    round3(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeCapabilities, NodeIdentity, NodeMetrics, NodePolicy};
    use chrono::Utc;

    fn node_with(
        capabilities: NodeCapabilities,
        metrics: NodeMetrics,
        policy: NodePolicy,
    ) -> Node {
        let now = Utc::now();
        Node {
            identity: NodeIdentity {
                node_id: "n1".into(),
                display_name: "n1".into(),
                ip: "10.0.0.1".into(),
                port: 9000,
            },
            capabilities,
            metrics,
            policy,
            status: NodeStatus::Online,
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn s1_effective_capacity() {
        let node = node_with(
            NodeCapabilities {
                cpu_threads: Some(16),
                ram_total_gb: Some(32.0),
                vram_total_gb: Some(24.0),
                ..NodeCapabilities::default()
            },
            NodeMetrics::default(),
            NodePolicy {
                cpu_cap_percent: 50,
                ram_cap_percent: 80,
                gpu_cap_percent: Some(75),
                ..NodePolicy::default()
            },
        );

        let capacity = compute_effective_capacity(&node);
        assert_eq!(capacity.cpu_threads, 8.0);
        assert_eq!(capacity.ram_gb, 25.6);
        assert_eq!(capacity.vram_gb, Some(18.0));
    }

    #[test]
    fn s2_cap_filter_ineligibility() {
        let node = node_with(
            NodeCapabilities::default(),
            NodeMetrics {
                cpu_percent: 9.0,
                ..NodeMetrics::default()
            },
            NodePolicy {
                cpu_cap_percent: 1,
                ..NodePolicy::default()
            },
        );

        let (eligible, reasons) = evaluate_node_eligibility(&node, TaskType::Inference);
        assert!(!eligible);
        assert!(reasons.contains(&REASON_CPU_OVER_CAP));
    }

    #[test]
    fn gpu_cap_ignored_without_signal() {
        let node = node_with(
            NodeCapabilities {
                has_gpu: true,
                ..NodeCapabilities::default()
            },
            NodeMetrics::default(),
            NodePolicy {
                gpu_cap_percent: Some(10),
                ..NodePolicy::default()
            },
        );

        let (eligible, reasons) = evaluate_node_eligibility(&node, TaskType::Inference);
        assert!(eligible);
        assert!(reasons.is_empty());
    }

    #[test]
    fn eligibility_monotonicity() {
        let metrics = NodeMetrics {
            cpu_percent: 40.0,
            ..NodeMetrics::default()
        };
        let lenient = node_with(
            NodeCapabilities::default(),
            metrics.clone(),
            NodePolicy {
                cpu_cap_percent: 50,
                ..NodePolicy::default()
            },
        );
        assert!(is_node_eligible(&lenient, TaskType::Embeddings));

        let strict = node_with(
            NodeCapabilities::default(),
            metrics,
            NodePolicy {
                cpu_cap_percent: 10,
                ..NodePolicy::default()
            },
        );
        let (eligible, reasons) = evaluate_node_eligibility(&strict, TaskType::Embeddings);
        assert!(!eligible);
        assert!(reasons.contains(&REASON_CPU_OVER_CAP));
    }

    #[test]
    fn scoring_is_deterministic() {
        let node = node_with(
            NodeCapabilities {
                has_gpu: true,
                ..NodeCapabilities::default()
            },
            NodeMetrics {
                cpu_percent: 20.0,
                ram_percent: 30.0,
                gpu_percent: Some(10.0),
                ..NodeMetrics::default()
            },
            NodePolicy::default(),
        );

        let first = score_node(&node, TaskType::Inference);
        let second = score_node(&node, TaskType::Inference);
        assert_eq!(first, second);
    }
}
