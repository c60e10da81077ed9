//! Routing of [`RedirectRequest`]s to a concrete instance.

use crate::allocation::{AllocationError, AllocationSelector};
use crate::placement::PlacementError;
use async_trait::async_trait;
use fleet_core::{
    ChannelError, ChannelRegistry, Listener, RedirectRequest, ServerRecord, ServerRole, SessionId,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
#[error("Failed to transfer session {session_id} to {target}: {reason}")]
pub struct TransferError {
    pub session_id: SessionId,
    pub target: String,
    pub reason: String,
}

/// The proxy layer that physically moves a session between instances.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn transfer(
        &self,
        session_id: SessionId,
        target: &ServerRecord,
    ) -> Result<(), TransferError>;
}

/// Resolves a role to an instance and hands the session to the transport.
pub struct RedirectRouter {
    selector: AllocationSelector,
    transport: Arc<dyn SessionTransport>,
    default_role: ServerRole,
}

impl RedirectRouter {
    pub fn new(selector: AllocationSelector, transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            selector,
            transport,
            default_role: ServerRole::Spawn,
        }
    }

    pub fn with_default_role(mut self, role: ServerRole) -> Self {
        self.default_role = role;
        self
    }

    /// Moves the session to an instance of the requested role, or of the
    /// default role when the requested one has no capacity.
    pub async fn route(&self, request: RedirectRequest) -> Result<ServerRecord, PlacementError> {
        let target = match self.selector.select_instance_async(request.target_role).await {
            Ok(target) => target,
            Err(AllocationError::NoCapacityAvailable(role)) if role != self.default_role => {
                warn!(
                    "No {} capacity for {}, trying {}",
                    role, request.session_id, self.default_role
                );
                self.selector.select_instance_async(self.default_role).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.transport.transfer(request.session_id, &target).await?;
        info!("🚚 Sent {} to {} ({})", request.session_id, target.id, target.role);
        Ok(target)
    }

    /// Routes every redirect request published on the fleet.
    pub fn subscribe(self: Arc<Self>, channels: &ChannelRegistry) -> Result<Listener, ChannelError> {
        channels.listen_async(move |request: RedirectRequest| {
            let router = self.clone();
            async move {
                if let Err(e) = router.route(request.clone()).await {
                    error!("❌ Could not route {}: {}", request.session_id, e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationPolicy;
    use fleet_core::{default_registry, Codec, LifecycleState, MemoryBackend, SharedState};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        moves: Mutex<Vec<(SessionId, String)>>,
    }

    #[async_trait]
    impl SessionTransport for RecordingTransport {
        async fn transfer(
            &self,
            session_id: SessionId,
            target: &ServerRecord,
        ) -> Result<(), TransferError> {
            self.moves.lock().push((session_id, target.id.clone()));
            Ok(())
        }
    }

    fn router(state: &SharedState) -> (RedirectRouter, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let selector = AllocationSelector::new(state.servers(), AllocationPolicy::default());
        (RedirectRouter::new(selector, transport.clone()), transport)
    }

    fn state() -> SharedState {
        let codec = Arc::new(Codec::new(Arc::new(default_registry().unwrap())));
        SharedState::new(Arc::new(MemoryBackend::new()), codec)
    }

    fn register(state: &SharedState, id: &str, role: ServerRole, used: u64) {
        let mut record = ServerRecord::new(id, role);
        record.lifecycle_state = LifecycleState::Allocated;
        record.used_capacity_units = used;
        state.servers().put(&id.to_string(), &record).unwrap();
    }

    #[tokio::test]
    async fn test_routes_to_least_loaded_instance_of_role() {
        let state = state();
        register(&state, "limbo-1", ServerRole::Limbo, 900);
        register(&state, "limbo-2", ServerRole::Limbo, 300);
        let (router, transport) = router(&state);

        let session = SessionId::new();
        let target = router
            .route(RedirectRequest {
                session_id: session,
                target_role: ServerRole::Limbo,
            })
            .await
            .unwrap();

        assert_eq!(target.id, "limbo-2");
        assert_eq!(*transport.moves.lock(), vec![(session, "limbo-2".to_string())]);
    }

    #[tokio::test]
    async fn test_falls_back_to_default_role() {
        let state = state();
        register(&state, "spawn-1", ServerRole::Spawn, 100);
        let (router, _) = router(&state);

        let target = router
            .route(RedirectRequest {
                session_id: SessionId::new(),
                target_role: ServerRole::WorldHost,
            })
            .await
            .unwrap();
        assert_eq!(target.role, ServerRole::Spawn);
    }

    #[tokio::test]
    async fn test_empty_fleet_reports_no_capacity() {
        let state = state();
        let (router, transport) = router(&state);

        let err = router
            .route(RedirectRequest {
                session_id: SessionId::new(),
                target_role: ServerRole::Spawn,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlacementError::Allocation(AllocationError::NoCapacityAvailable(ServerRole::Spawn))
        ));
        assert!(transport.moves.lock().is_empty());
    }
}
