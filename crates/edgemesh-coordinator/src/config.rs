//! Environment-sourced configuration (spec §6, §10.2). Grounded on
//! `original_source/edgemesh/coordinator/app/coordinator_service/settings.py`:
//! same env var names, same literal defaults. `host`/`port`/`log_level`/
//! `cors_origins` are parsed here but are otherwise inert in this crate —
//! wiring them into an HTTP listener, a logging subscriber, or a CORS layer
//! is the external HTTP collaborator's job (spec §1 Non-goals).

use std::env;

/// Coordinator-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub heartbeat_ttl_seconds: i64,
    pub node_stale_seconds: i64,
    pub task_lease_seconds: i64,
    pub task_recovery_interval_seconds: u64,
    pub cors_origins: Vec<String>,
    pub db_url: String,
    pub edge_mesh_shared_secret: Option<String>,
}

impl Config {
    /// Reads every field from its environment variable, falling back to the
    /// literal defaults in §6/§10.2 when unset or unparseable.
    pub fn from_env() -> Self {
        let cors_origins = env::var("COORDINATOR_CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        let secret = env::var("EDGE_MESH_SHARED_SECRET")
            .unwrap_or_default()
            .trim()
            .to_string();

        Self {
            host: env::var("COORDINATOR_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env_or("COORDINATOR_PORT", 8000),
            log_level: env::var("COORDINATOR_LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            heartbeat_ttl_seconds: parse_env_or("COORDINATOR_HEARTBEAT_TTL_SECONDS", 60),
            node_stale_seconds: parse_env_or("NODE_STALE_SECONDS", 15),
            task_lease_seconds: parse_env_or("TASK_LEASE_SECONDS", 30),
            task_recovery_interval_seconds: parse_env_or("TASK_RECOVERY_INTERVAL_SECONDS", 3),
            cors_origins,
            db_url: env::var("COORDINATOR_DB_URL")
                .unwrap_or_else(|_| "sqlite://./coordinator.db".to_string()),
            edge_mesh_shared_secret: if secret.is_empty() { None } else { Some(secret) },
        }
    }
}

impl Default for Config {
    /// The same defaults `from_env` falls back to when nothing is set;
    /// useful for tests that want a `Config` without touching the
    /// environment.
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "INFO".to_string(),
            heartbeat_ttl_seconds: 60,
            node_stale_seconds: 15,
            task_lease_seconds: 30,
            task_recovery_interval_seconds: 3,
            cors_origins: vec!["http://localhost:5173".to_string()],
            db_url: "sqlite://./coordinator.db".to_string(),
            edge_mesh_shared_secret: None,
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_settings_module() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.node_stale_seconds, 15);
        assert_eq!(config.task_lease_seconds, 30);
        assert_eq!(config.task_recovery_interval_seconds, 3);
        assert_eq!(config.heartbeat_ttl_seconds, 60);
        assert!(config.edge_mesh_shared_secret.is_none());
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
    }

    #[test]
    fn blank_shared_secret_is_treated_as_unset() {
        // mirrors `edge_mesh_shared_secret=os.getenv(...).strip()` being
        // falsy in the original, rather than an empty-string secret that
        // would make every request's presented secret compare unequal.
        let config = Config {
            edge_mesh_shared_secret: "   ".trim().to_string().is_empty().then(String::new),
            ..Config::default()
        };
        assert!(config.edge_mesh_shared_secret.is_none());
    }
}
