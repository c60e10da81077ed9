//! # Status Controller
//!
//! Publishes this instance's [`ServerRecord`] on a fixed heartbeat and keeps
//! the hosting platform informed through [`LifecycleSignals`].
//!
//! Each beat:
//! 1. with no hosted sessions, signal `ready`
//! 2. signal `health`
//! 3. with hosted sessions, signal `allocate` and report ALLOCATED, else READY
//! 4. write used capacity units and the session count
//!
//! A failed store write is a transient condition. It is logged and retried on
//! the next beat, never escalated.

use crate::lifecycle::LifecycleSignals;
use fleet_core::{LifecycleState, ServerRecord, ServerRole, StoreMap, StoreResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Reports how many capacity units this process currently uses.
pub trait CapacityProbe: Send + Sync {
    fn used_units(&self) -> u64;
}

/// Resident memory of the current process, in MiB.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from(std::process::id() as usize),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityProbe for ProcessMemoryProbe {
    fn used_units(&self) -> u64 {
        let mut system = self.system.lock();
        if !system.refresh_process(self.pid) {
            return 0;
        }
        system
            .process(self.pid)
            .map_or(0, |process| process.memory() / (1024 * 1024))
    }
}

/// Number of sessions currently hosted by this process.
pub trait OccupancySource: Send + Sync {
    fn session_count(&self) -> u32;
}

/// Drives the heartbeat for one instance.
pub struct StatusController {
    server_id: String,
    role: ServerRole,
    servers: StoreMap<String, ServerRecord>,
    signals: Arc<dyn LifecycleSignals>,
    probe: Arc<dyn CapacityProbe>,
    occupancy: Arc<dyn OccupancySource>,
    shut_down: AtomicBool,
}

impl StatusController {
    pub fn new(
        server_id: impl Into<String>,
        role: ServerRole,
        servers: StoreMap<String, ServerRecord>,
        signals: Arc<dyn LifecycleSignals>,
        probe: Arc<dyn CapacityProbe>,
        occupancy: Arc<dyn OccupancySource>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            role,
            servers,
            signals,
            probe,
            occupancy,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn fresh_record(&self) -> ServerRecord {
        let mut record = ServerRecord::new(self.server_id.clone(), self.role);
        record.used_capacity_units = self.probe.used_units();
        record
    }

    /// Writes the initial READY record for this instance.
    pub async fn register(&self) -> StoreResult<ServerRecord> {
        let record = self.fresh_record();
        self.servers
            .put_async(self.server_id.clone(), record.clone())
            .await?;
        info!("📋 Registered {} as {}", self.server_id, self.role);
        Ok(record)
    }

    /// Runs one beat. Returns the record written, or `None` if the store
    /// could not be reached.
    pub async fn heartbeat(&self) -> Option<ServerRecord> {
        let sessions = self.occupancy.session_count();
        if sessions == 0 {
            self.signals.ready();
        }

        let mut record = match self.servers.get_async(self.server_id.clone()).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Server record for {} is missing, recreating it", self.server_id);
                self.fresh_record()
            }
            Err(e) => {
                warn!("⚠️ Heartbeat read failed for {} (transient): {}", self.server_id, e);
                return None;
            }
        };

        self.signals.health();

        if sessions == 0 {
            record.lifecycle_state = LifecycleState::Ready;
        } else {
            self.signals.allocate();
            record.lifecycle_state = LifecycleState::Allocated;
        }
        record.used_capacity_units = self.probe.used_units();
        record.current_session_count = sessions;

        if let Err(e) = self
            .servers
            .put_async(self.server_id.clone(), record.clone())
            .await
        {
            warn!("⚠️ Heartbeat write failed for {} (transient): {}", self.server_id, e);
            return None;
        }

        debug!(
            "Heartbeat {}: {:?}, {} units, {} session(s)",
            self.server_id, record.lifecycle_state, record.used_capacity_units, sessions
        );
        Some(record)
    }

    /// Spawns the heartbeat loop.
    pub fn run(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.heartbeat().await;
            }
        })
    }

    /// Signals `shutdown` to the platform. Later calls do nothing.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.signals.shutdown();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{
        default_registry, Codec, MemoryBackend, SharedState, StoreBackend, StoreError,
        Subscription,
    };
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct RecordingSignals {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingSignals {
        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl LifecycleSignals for RecordingSignals {
        fn ready(&self) {
            self.calls.lock().push("ready");
        }
        fn allocate(&self) {
            self.calls.lock().push("allocate");
        }
        fn health(&self) {
            self.calls.lock().push("health");
        }
        fn shutdown(&self) {
            self.calls.lock().push("shutdown");
        }
    }

    struct FixedProbe(u64);

    impl CapacityProbe for FixedProbe {
        fn used_units(&self) -> u64 {
            self.0
        }
    }

    #[derive(Default)]
    struct Occupants(AtomicU32);

    impl OccupancySource for Occupants {
        fn session_count(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct UnreachableStore;

    impl UnreachableStore {
        fn fail<T>() -> StoreResult<T> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    impl StoreBackend for UnreachableStore {
        fn get(&self, _: &str, _: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            Self::fail()
        }
        fn put(&self, _: &str, _: Vec<u8>, _: Vec<u8>) -> StoreResult<()> {
            Self::fail()
        }
        fn put_with_ttl(&self, _: &str, _: Vec<u8>, _: Vec<u8>, _: Duration) -> StoreResult<()> {
            Self::fail()
        }
        fn remove(&self, _: &str, _: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            Self::fail()
        }
        fn contains(&self, _: &str, _: &[u8]) -> StoreResult<bool> {
            Self::fail()
        }
        fn entries(&self, _: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
            Self::fail()
        }
        fn len(&self, _: &str) -> StoreResult<usize> {
            Self::fail()
        }
        fn compute_if_absent(
            &self,
            _: &str,
            _: Vec<u8>,
            _: Box<dyn FnOnce() -> StoreResult<Vec<u8>> + Send + '_>,
        ) -> StoreResult<Vec<u8>> {
            Self::fail()
        }
        fn clear(&self, _: &str) -> StoreResult<()> {
            Self::fail()
        }
        fn list_push(&self, _: &str, _: Vec<u8>) -> StoreResult<usize> {
            Self::fail()
        }
        fn list_range(&self, _: &str) -> StoreResult<Vec<Vec<u8>>> {
            Self::fail()
        }
        fn list_remove(&self, _: &str, _: &[u8]) -> StoreResult<bool> {
            Self::fail()
        }
        fn list_len(&self, _: &str) -> StoreResult<usize> {
            Self::fail()
        }
        fn list_clear(&self, _: &str) -> StoreResult<()> {
            Self::fail()
        }
        fn publish(&self, _: &str, _: Vec<u8>) -> StoreResult<usize> {
            Self::fail()
        }
        fn subscribe(&self, _: &str) -> StoreResult<Subscription> {
            Self::fail()
        }
    }

    fn controller(
        backend: Arc<dyn StoreBackend>,
    ) -> (StatusController, Arc<RecordingSignals>, Arc<Occupants>, SharedState) {
        let codec = Arc::new(Codec::new(Arc::new(default_registry().unwrap())));
        let state = SharedState::new(backend, codec);
        let signals = Arc::new(RecordingSignals::default());
        let occupants = Arc::new(Occupants::default());
        let controller = StatusController::new(
            "world-host-1",
            ServerRole::WorldHost,
            state.servers(),
            signals.clone(),
            Arc::new(FixedProbe(512)),
            occupants.clone(),
        );
        (controller, signals, occupants, state)
    }

    #[tokio::test]
    async fn test_idle_heartbeat_reports_ready() {
        let (controller, signals, _, state) = controller(Arc::new(MemoryBackend::new()));
        controller.register().await.unwrap();

        let record = controller.heartbeat().await.unwrap();
        assert_eq!(signals.take(), vec!["ready", "health"]);
        assert_eq!(record.lifecycle_state, LifecycleState::Ready);
        assert_eq!(record.used_capacity_units, 512);
        assert_eq!(state.get_server("world-host-1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_busy_heartbeat_reports_allocated() {
        let (controller, signals, occupants, state) = controller(Arc::new(MemoryBackend::new()));
        controller.register().await.unwrap();
        occupants.0.store(3, Ordering::SeqCst);

        controller.heartbeat().await.unwrap();
        assert_eq!(signals.take(), vec!["health", "allocate"]);

        let stored = state.get_server("world-host-1").await.unwrap().unwrap();
        assert_eq!(stored.lifecycle_state, LifecycleState::Allocated);
        assert_eq!(stored.current_session_count, 3);
    }

    #[tokio::test]
    async fn test_missing_record_is_recreated() {
        let (controller, _, _, state) = controller(Arc::new(MemoryBackend::new()));

        assert!(controller.heartbeat().await.is_some());
        assert!(state.get_server("world-host-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_transient() {
        let (controller, signals, _, _) = controller(Arc::new(UnreachableStore));

        assert!(controller.register().await.is_err());
        assert!(controller.heartbeat().await.is_none());
        assert!(controller.heartbeat().await.is_none());
        assert_eq!(signals.take(), vec!["ready", "ready"]);
    }

    #[test]
    fn test_shutdown_signalled_once() {
        let (controller, signals, _, _) = controller(Arc::new(MemoryBackend::new()));

        assert!(controller.shutdown());
        assert!(!controller.shutdown());
        assert_eq!(signals.take(), vec!["shutdown"]);
    }
}
