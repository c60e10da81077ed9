//! Lifecycle signal contract with the hosting platform.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// The four parameterless signals the orchestration platform expects.
///
/// `ready` and `allocate` reflect current occupancy, `health` is a periodic
/// liveness pulse, `shutdown` is sent exactly once at controlled termination.
/// Implementations must treat repeated calls as no-ops where the platform does.
pub trait LifecycleSignals: Send + Sync {
    fn ready(&self);
    fn allocate(&self);
    fn health(&self);
    fn shutdown(&self);
}

/// Signals that are only logged, for running without a platform sidecar.
#[derive(Debug)]
pub struct LoggingLifecycle {
    server_id: String,
    allocated: AtomicBool,
}

impl LoggingLifecycle {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            allocated: AtomicBool::new(false),
        }
    }
}

impl LifecycleSignals for LoggingLifecycle {
    fn ready(&self) {
        if self.allocated.swap(false, Ordering::SeqCst) {
            info!("🟢 {} is ready", self.server_id);
        }
    }

    fn allocate(&self) {
        if !self.allocated.swap(true, Ordering::SeqCst) {
            info!("🔵 {} is allocated", self.server_id);
        }
    }

    fn health(&self) {
        debug!("💓 {} health pulse", self.server_id);
    }

    fn shutdown(&self) {
        info!("🛑 {} signalled shutdown", self.server_id);
    }
}
