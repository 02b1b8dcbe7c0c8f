//! Process-wide facade for the EdgeMesh coordinator (spec §9 "process-wide
//! registries"). Wires together the durable [`Store`], the two event buses
//! and the background liveness/recovery monitors described in §4.6/§4.4,
//! and owns their teardown. An external HTTP layer (out of scope for this
//! crate, per spec §1) depends on [`Coordinator`] rather than constructing
//! a store or the monitors itself.

mod config;
mod monitor;

use std::sync::Arc;
use std::time::Duration;

pub use config::Config;

use edgemesh_core::events::{JobEventBus, NodeEventBus};
use edgemesh_core::store::Store;
use edgemesh_store_sqlite::SqliteStore;
use tokio::task::JoinHandle;

/// The process-wide singleton: a `Store` handle, the node/job event buses,
/// and the two background monitors (spec §4.6). Dropping it does not stop
/// the monitors on its own — call [`Coordinator::shutdown`] during an
/// orderly process exit.
pub struct Coordinator {
    store: Arc<dyn Store>,
    node_bus: NodeEventBus,
    job_bus: JobEventBus,
    config: Config,
    liveness_handle: JoinHandle<()>,
    recovery_handle: JoinHandle<()>,
}

impl Coordinator {
    /// Connects to the configured sqlite database (applying migrations,
    /// §6 "Persisted state layout"), wires the event buses, and spawns the
    /// liveness and task-recovery monitors at the configured cadence.
    pub async fn start(config: Config) -> Result<Self, edgemesh_core::error::CoreError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&config.db_url).await?);
        Ok(Self::start_with_store(store, config))
    }

    /// Same as [`Coordinator::start`] but takes an already-constructed
    /// store; the seam the test crate's in-memory `Store` uses to exercise
    /// the monitors without a sqlite file.
    pub fn start_with_store(store: Arc<dyn Store>, config: Config) -> Self {
        let node_bus = NodeEventBus::new();
        let job_bus = JobEventBus::new();

        let liveness_handle = tokio::spawn(monitor::run_liveness_monitor(
            Arc::clone(&store),
            node_bus.clone(),
            config.node_stale_seconds,
            Duration::from_secs(5),
        ));
        let recovery_handle = tokio::spawn(monitor::run_task_recovery_monitor(
            Arc::clone(&store),
            Duration::from_secs(config.task_recovery_interval_seconds),
        ));

        Self {
            store,
            node_bus,
            job_bus,
            config,
            liveness_handle,
            recovery_handle,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn node_events(&self) -> &NodeEventBus {
        &self.node_bus
    }

    pub fn job_events(&self) -> &JobEventBus {
        &self.job_bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancels the background monitors. Idempotent: calling it twice just
    /// aborts already-finished tasks.
    pub fn shutdown(&self) {
        self.liveness_handle.abort();
        self.recovery_handle.abort();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgemesh_testing::MemoryStore;

    #[tokio::test]
    async fn spawns_and_shuts_down_monitors_cleanly() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::start_with_store(store, Config::default());

        assert!(!coordinator.liveness_handle.is_finished());
        assert!(!coordinator.recovery_handle.is_finished());

        coordinator.shutdown();
        // Give the aborted tasks a tick to settle.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn liveness_monitor_publishes_offline_transitions() {
        // Exercises `monitor::run_liveness_monitor` directly with a short
        // tick so the test doesn't have to wait out the real 5s cadence
        // `Coordinator::start_with_store` uses.
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert_node_identity("node-1", "Node One", "10.0.0.5", 9000)
            .await
            .unwrap();

        let node_bus = NodeEventBus::new();
        let mut subscriber = node_bus.subscribe();
        let handle = tokio::spawn(monitor::run_liveness_monitor(
            Arc::clone(&store),
            node_bus,
            0,
            Duration::from_millis(20),
        ));

        let event = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("monitor tick did not fire in time")
            .expect("channel closed unexpectedly");

        assert_eq!(event.node_id, "node-1");
        handle.abort();
    }
}
