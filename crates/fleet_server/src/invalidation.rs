//! # Resource Deletion
//!
//! Deleting a resource removes its record from the shared store and tells the
//! instance hosting it. That instance drops its cached copy, evacuates every
//! session inside the resource's space, and tears the space down after a
//! grace period.
//!
//! Evacuation is always issued before teardown is scheduled. The grace period
//! gives evacuation time to take effect; it does not prove that it did.

use crate::cache::ResourceCache;
use async_trait::async_trait;
use fleet_core::{
    ChannelError, ChannelRegistry, Listener, PlacementRequest, ResourceDeleteRequest, ResourceId,
    ResourceRecord, SessionId, SharedState, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// The game runtime that owns the spaces resources are loaded into.
#[async_trait]
pub trait ResourceHost: Send + Sync {
    /// Whether the resource's space is loaded on this instance.
    fn is_hosted(&self, resource: ResourceId) -> bool;

    /// Sessions currently inside the resource's space.
    fn occupants(&self, resource: ResourceId) -> Vec<SessionId>;

    /// Sends one session to a safe default location.
    async fn evacuate(&self, session: SessionId, resource: ResourceId);

    /// Unloads the resource's space.
    async fn teardown(&self, resource: ResourceId);

    /// Loads the resource's space so an incoming session can be placed in it.
    async fn prepare_placement(&self, resource: &ResourceRecord, request: &PlacementRequest);
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Handles [`ResourceDeleteRequest`]s addressed to this instance.
pub struct ResourceDeletionListener {
    server_id: String,
    host: Arc<dyn ResourceHost>,
    cache: Arc<ResourceCache>,
    teardown_delay: Duration,
}

impl ResourceDeletionListener {
    pub fn new(
        server_id: impl Into<String>,
        host: Arc<dyn ResourceHost>,
        cache: Arc<ResourceCache>,
        teardown_delay: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            host,
            cache,
            teardown_delay,
        }
    }

    /// Evacuates the resource and schedules its teardown.
    ///
    /// Returns the pending teardown, or `None` if the request was not for a
    /// resource hosted here.
    pub async fn handle(&self, request: ResourceDeleteRequest) -> Option<JoinHandle<()>> {
        if request.server.as_deref() != Some(self.server_id.as_str()) {
            trace!(
                "Ignoring deletion of {} addressed to {:?}",
                request.resource_id,
                request.server
            );
            return None;
        }

        let resource = request.resource_id;
        self.cache.invalidate(&resource);
        if !self.host.is_hosted(resource) {
            debug!("Resource {} is not loaded here, nothing to tear down", resource);
            return None;
        }

        let occupants = self.host.occupants(resource);
        for session in &occupants {
            self.host.evacuate(*session, resource).await;
        }
        info!(
            "🧹 Evacuated {} session(s) from {}, teardown in {:?}",
            occupants.len(),
            resource,
            self.teardown_delay
        );

        let host = self.host.clone();
        let cache = self.cache.clone();
        let server_id = self.server_id.clone();
        let delay = self.teardown_delay;
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            host.teardown(resource).await;
            info!("🗑️ Tore down resource {}", resource);
            if let Err(e) = cache.release_host(resource, &server_id).await {
                error!("❌ Could not clear host of {}: {}", resource, e);
            }
        }))
    }

    pub fn subscribe(self: Arc<Self>, channels: &ChannelRegistry) -> Result<Listener, ChannelError> {
        channels.listen_async(move |request: ResourceDeleteRequest| {
            let listener = self.clone();
            async move {
                listener.handle(request).await;
            }
        })
    }
}

/// Owner-side deletion of resources.
#[derive(Debug, Clone)]
pub struct ResourceService {
    state: SharedState,
    channels: ChannelRegistry,
}

impl ResourceService {
    pub fn new(state: SharedState, channels: ChannelRegistry) -> Self {
        Self { state, channels }
    }

    /// Deletes the resource and notifies the instance hosting it.
    ///
    /// Returns the removed record, or `None` if it did not exist.
    pub async fn delete(&self, resource_id: ResourceId) -> Result<Option<ResourceRecord>, ResourceError> {
        let Some(removed) = self.state.delete_resource(resource_id).await? else {
            debug!("Resource {} already deleted", resource_id);
            return Ok(None);
        };

        let request = ResourceDeleteRequest {
            server: removed.host_instance_id.clone(),
            resource_id,
        };
        self.channels.publish_async(request).await?;
        info!(
            "Deleted resource {} (hosted on {:?})",
            resource_id, removed.host_instance_id
        );
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{default_registry, Codec, MemoryBackend, StoreBackend};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum HostEvent {
        Evacuate(SessionId),
        Teardown(ResourceId),
    }

    #[derive(Default)]
    struct RecordingHost {
        hosted: Mutex<HashMap<ResourceId, Vec<SessionId>>>,
        events: Mutex<Vec<HostEvent>>,
    }

    impl RecordingHost {
        fn load(&self, resource: ResourceId, occupants: Vec<SessionId>) {
            self.hosted.lock().insert(resource, occupants);
        }

        fn events(&self) -> Vec<HostEvent> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl ResourceHost for RecordingHost {
        fn is_hosted(&self, resource: ResourceId) -> bool {
            self.hosted.lock().contains_key(&resource)
        }

        fn occupants(&self, resource: ResourceId) -> Vec<SessionId> {
            self.hosted.lock().get(&resource).cloned().unwrap_or_default()
        }

        async fn evacuate(&self, session: SessionId, resource: ResourceId) {
            if let Some(occupants) = self.hosted.lock().get_mut(&resource) {
                occupants.retain(|s| *s != session);
            }
            self.events.lock().push(HostEvent::Evacuate(session));
        }

        async fn teardown(&self, resource: ResourceId) {
            self.hosted.lock().remove(&resource);
            self.events.lock().push(HostEvent::Teardown(resource));
        }

        async fn prepare_placement(&self, _: &ResourceRecord, _: &PlacementRequest) {}
    }

    struct Fixture {
        state: SharedState,
        channels: ChannelRegistry,
        host: Arc<RecordingHost>,
        cache: Arc<ResourceCache>,
        listener: ResourceDeletionListener,
    }

    fn fixture() -> Fixture {
        let codec = Arc::new(Codec::new(Arc::new(default_registry().unwrap())));
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let state = SharedState::new(backend.clone(), codec.clone());
        let channels = ChannelRegistry::new(backend, codec);
        let host = Arc::new(RecordingHost::default());
        let cache = Arc::new(ResourceCache::new(state.resources(), Duration::from_secs(60)));
        let listener = ResourceDeletionListener::new(
            "world-host-1",
            host.clone(),
            cache.clone(),
            Duration::from_secs(3),
        );
        Fixture {
            state,
            channels,
            host,
            cache,
            listener,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evacuation_precedes_teardown() {
        let f = fixture();
        let resource = ResourceId::new();
        let (a, b) = (SessionId::new(), SessionId::new());
        f.host.load(resource, vec![a, b]);

        let teardown = f
            .listener
            .handle(ResourceDeleteRequest {
                server: Some("world-host-1".to_string()),
                resource_id: resource,
            })
            .await
            .unwrap();
        assert_eq!(f.host.events(), vec![HostEvent::Evacuate(a), HostEvent::Evacuate(b)]);

        tokio::time::advance(Duration::from_millis(2900)).await;
        tokio::task::yield_now().await;
        assert_eq!(f.host.events().len(), 2);

        teardown.await.unwrap();
        assert_eq!(
            f.host.events(),
            vec![
                HostEvent::Evacuate(a),
                HostEvent::Evacuate(b),
                HostEvent::Teardown(resource)
            ]
        );
        assert!(!f.host.is_hosted(resource));
    }

    #[tokio::test]
    async fn test_requests_for_other_instances_are_ignored() {
        let f = fixture();
        let resource = ResourceId::new();
        f.host.load(resource, vec![SessionId::new()]);

        for server in [None, Some("world-host-2".to_string())] {
            let outcome = f
                .listener
                .handle(ResourceDeleteRequest {
                    server,
                    resource_id: resource,
                })
                .await;
            assert!(outcome.is_none());
        }
        assert!(f.host.events().is_empty());
    }

    #[tokio::test]
    async fn test_cached_copy_is_invalidated() {
        let f = fixture();
        let record = ResourceRecord::new(ResourceId::new(), SessionId::new());
        let resource = record.resource_id;
        f.state.resources().put(&resource, &record).unwrap();
        f.cache.get(resource).await.unwrap();
        f.host.load(resource, Vec::new());

        f.listener
            .handle(ResourceDeleteRequest {
                server: Some("world-host-1".to_string()),
                resource_id: resource,
            })
            .await
            .unwrap()
            .abort();
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_dropped_even_when_not_hosted() {
        let f = fixture();
        let record = ResourceRecord::new(ResourceId::new(), SessionId::new());
        let resource = record.resource_id;
        f.state.resources().put(&resource, &record).unwrap();
        f.cache.get(resource).await.unwrap();

        let outcome = f
            .listener
            .handle(ResourceDeleteRequest {
                server: Some("world-host-1".to_string()),
                resource_id: resource,
            })
            .await;
        assert!(outcome.is_none());
        assert!(f.cache.is_empty());
        assert!(f.host.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_clears_recorded_host() {
        let f = fixture();
        let mut record = ResourceRecord::new(ResourceId::new(), SessionId::new());
        record.host_instance_id = Some("world-host-1".to_string());
        let resource = record.resource_id;
        f.state.resources().put(&resource, &record).unwrap();
        f.host.load(resource, Vec::new());

        f.listener
            .handle(ResourceDeleteRequest {
                server: Some("world-host-1".to_string()),
                resource_id: resource,
            })
            .await
            .unwrap()
            .await
            .unwrap();

        let stored = f.state.resources().get(&resource).unwrap().unwrap();
        assert_eq!(stored.host_instance_id, None);
    }

    #[tokio::test]
    async fn test_delete_notifies_hosting_instance() {
        let f = fixture();
        let mut record = ResourceRecord::new(ResourceId::new(), SessionId::new());
        record.host_instance_id = Some("world-host-1".to_string());
        let resource = record.resource_id;
        f.state.resources().put(&resource, &record).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _listener = f
            .channels
            .listen(move |request: ResourceDeleteRequest| sink.lock().push(request))
            .unwrap();

        let service = ResourceService::new(f.state.clone(), f.channels.clone());
        assert_eq!(service.delete(resource).await.unwrap(), Some(record));
        assert_eq!(service.delete(resource).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *received.lock(),
            vec![ResourceDeleteRequest {
                server: Some("world-host-1".to_string()),
                resource_id: resource,
            }]
        );
    }
}
