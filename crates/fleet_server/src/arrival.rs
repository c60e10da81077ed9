//! Destination-side handling of sessions that were routed here.
//!
//! The waiting room only marks a session's [`PositionResolution`] and notifies
//! the destination. The destination resolves the mode to a concrete
//! [`Location`] when the session arrives, then clears the mode so a later
//! reconnect does not apply it again.

use crate::cache::ResourceCache;
use crate::invalidation::ResourceHost;
use crate::placement::PlacementError;
use async_trait::async_trait;
use fleet_core::{
    ChannelError, ChannelRegistry, Listener, Location, PlacementRequest, PositionResolution,
    ServerRole, SessionId, SessionRecord, SharedState,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Turns one resolution mode into a concrete location on this instance.
#[async_trait]
pub trait PositionResolver: Send + Sync {
    async fn resolve(&self, session: &SessionRecord, role: ServerRole) -> Option<Location>;
}

pub struct ArrivalCoordinator {
    state: SharedState,
    role: ServerRole,
    resolvers: HashMap<PositionResolution, Arc<dyn PositionResolver>>,
}

impl ArrivalCoordinator {
    pub fn new(state: SharedState, role: ServerRole) -> Self {
        Self {
            state,
            role,
            resolvers: HashMap::new(),
        }
    }

    pub fn with_resolver(mut self, mode: PositionResolution, resolver: Arc<dyn PositionResolver>) -> Self {
        self.resolvers.insert(mode, resolver);
        self
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Records that the session is now on this role and applies its pending
    /// resolution mode.
    ///
    /// Returns the resolved location, or `None` when nothing had to be done or
    /// the resolver found no location.
    pub async fn on_arrival(&self, session_id: SessionId) -> Result<Option<Location>, PlacementError> {
        let sessions = self.state.sessions();
        let Some(mut record) = sessions.get_async(session_id).await? else {
            warn!("{} arrived without a session record", session_id);
            return Ok(None);
        };

        record.last_server_role = self.role;
        let mode = record.position_resolution_mode;

        if mode == PositionResolution::None {
            sessions.put_async(session_id, record).await?;
            trace!("{} arrived with nothing to resolve", session_id);
            return Ok(None);
        }

        let Some(resolver) = self.resolvers.get(&mode) else {
            sessions.put_async(session_id, record).await?;
            return Err(PlacementError::NoResolver(mode));
        };

        let location = resolver.resolve(&record, self.role).await;
        if location.is_none() {
            debug!("No location found for {} under {:?}", session_id, mode);
        }

        record.position_resolution_mode = PositionResolution::None;
        sessions.put_async(session_id, record).await?;
        Ok(location)
    }
}

/// Prepares this instance for sessions another instance is sending here.
pub struct PlacementRequestListener {
    server_id: String,
    cache: Arc<ResourceCache>,
    host: Arc<dyn ResourceHost>,
}

impl PlacementRequestListener {
    pub fn new(server_id: impl Into<String>, cache: Arc<ResourceCache>, host: Arc<dyn ResourceHost>) -> Self {
        Self {
            server_id: server_id.into(),
            cache,
            host,
        }
    }

    /// Returns whether the resource was handed to the host.
    pub async fn handle(&self, request: PlacementRequest) -> bool {
        if request.target_instance_id != self.server_id {
            return false;
        }

        let resource = match self.cache.get(request.resource_id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                warn!(
                    "Placement of {} into {} dropped, resource no longer exists",
                    request.session_id, request.resource_id
                );
                return false;
            }
            Err(e) => {
                error!("❌ Could not read resource {}: {}", request.resource_id, e);
                return false;
            }
        };

        self.host.prepare_placement(&resource, &request).await;
        info!(
            "📦 Prepared resource {} for {} ({})",
            request.resource_id, request.display_name, request.session_id
        );

        match self.cache.claim_host(request.resource_id, &self.server_id).await {
            Ok(true) => debug!("Resource {} now hosted on {}", request.resource_id, self.server_id),
            Ok(false) => warn!("Resource {} was deleted while being prepared", request.resource_id),
            Err(e) => error!("❌ Could not record host of {}: {}", request.resource_id, e),
        }
        true
    }

    pub fn subscribe(self: Arc<Self>, channels: &ChannelRegistry) -> Result<Listener, ChannelError> {
        channels.listen_async(move |request: PlacementRequest| {
            let listener = self.clone();
            async move {
                listener.handle(request).await;
            }
        })
    }
}
