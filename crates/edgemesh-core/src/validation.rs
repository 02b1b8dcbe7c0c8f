//! Field validators for boundary adapters (spec §10.6) and for the two
//! `Store` operations the spec calls out as validating (spec §4.1:
//! `upsert_node_capabilities`, `update_node_policy`). These never touch I/O.

use crate::domain::{NodeCapabilities, NodePolicy};
use crate::enums::TaskType;
use crate::error::CoreError;

/// `node_id`, `job_id` and `task_id` share the same shape rule: non-empty,
/// no whitespace, capped so they can't be used to smuggle oversized keys
/// into storage.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::validation(field, "must not be empty"));
    }
    if value.len() > 128 {
        return Err(CoreError::validation(field, "must be 128 characters or fewer"));
    }
    if value.chars().any(|c| c.is_whitespace()) {
        return Err(CoreError::validation(field, "must not contain whitespace"));
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), CoreError> {
    if port == 0 {
        return Err(CoreError::validation("port", "must be nonzero"));
    }
    Ok(())
}

pub fn validate_percent(field: &'static str, value: u8) -> Result<(), CoreError> {
    if value > 100 {
        return Err(CoreError::validation(field, "must be between 0 and 100"));
    }
    Ok(())
}

pub fn validate_task_allowlist(task_types: &[TaskType]) -> Result<(), CoreError> {
    if task_types.is_empty() {
        return Err(CoreError::validation(
            "task_allowlist",
            "must name at least one task type",
        ));
    }
    Ok(())
}

pub fn validate_max_retries(max_retries: u32) -> Result<(), CoreError> {
    if max_retries > 50 {
        return Err(CoreError::validation(
            "max_retries",
            "must be 50 or fewer",
        ));
    }
    Ok(())
}

pub fn validate_duration_ms(duration_ms: u64) -> Result<(), CoreError> {
    if duration_ms > 24 * 60 * 60 * 1000 {
        return Err(CoreError::validation(
            "duration_ms",
            "must be 24 hours or less",
        ));
    }
    Ok(())
}

fn validate_nonnegative(field: &'static str, value: f64) -> Result<(), CoreError> {
    if value < 0.0 {
        return Err(CoreError::validation(field, "must be zero or greater"));
    }
    Ok(())
}

/// Called by `Store::upsert_node_capabilities` (spec §4.1) before the
/// capabilities are persisted. Ram/vram figures are physical quantities and
/// can't be negative; everything else in [`NodeCapabilities`] is either an
/// optional free-form string or already non-negative by its integer type.
pub fn validate_capabilities(caps: &NodeCapabilities) -> Result<(), CoreError> {
    if let Some(ram_total_gb) = caps.ram_total_gb {
        validate_nonnegative("ram_total_gb", ram_total_gb)?;
    }
    if let Some(ram_gb) = caps.ram_gb {
        validate_nonnegative("ram_gb", ram_gb)?;
    }
    if let Some(vram_total_gb) = caps.vram_total_gb {
        validate_nonnegative("vram_total_gb", vram_total_gb)?;
    }
    Ok(())
}

/// Called by `Store::update_node_policy` (spec §4.1) before the policy is
/// persisted: every cap is a percentage in `[0,100]` (spec §3) and the
/// allowlist must name at least one task type.
pub fn validate_policy(policy: &NodePolicy) -> Result<(), CoreError> {
    validate_percent("cpu_cap_percent", policy.cpu_cap_percent)?;
    validate_percent("ram_cap_percent", policy.ram_cap_percent)?;
    if let Some(gpu_cap_percent) = policy.gpu_cap_percent {
        validate_percent("gpu_cap_percent", gpu_cap_percent)?;
    }
    validate_task_allowlist(&policy.task_allowlist)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace_ids() {
        assert!(validate_id("node_id", "").is_err());
        assert!(validate_id("node_id", "has space").is_err());
        assert!(validate_id("node_id", "node-1").is_ok());
    }

    #[test]
    fn rejects_out_of_range_percent() {
        assert!(validate_percent("cpu_cap_percent", 101).is_err());
        assert!(validate_percent("cpu_cap_percent", 100).is_ok());
    }

    #[test]
    fn rejects_empty_task_allowlist() {
        assert!(validate_task_allowlist(&[]).is_err());
        assert!(validate_task_allowlist(&[TaskType::Inference]).is_ok());
    }

    #[test]
    fn rejects_negative_capability_quantities() {
        let caps = NodeCapabilities {
            ram_total_gb: Some(-1.0),
            ..NodeCapabilities::default()
        };
        assert!(validate_capabilities(&caps).is_err());
        assert!(validate_capabilities(&NodeCapabilities::default()).is_ok());
    }

    #[test]
    fn rejects_policy_with_out_of_range_or_empty_allowlist() {
        let over_cap = NodePolicy {
            cpu_cap_percent: 101,
            ..NodePolicy::default()
        };
        assert!(validate_policy(&over_cap).is_err());

        let empty_allowlist = NodePolicy {
            task_allowlist: Vec::new(),
            ..NodePolicy::default()
        };
        assert!(validate_policy(&empty_allowlist).is_err());

        assert!(validate_policy(&NodePolicy::default()).is_ok());
    }
}
