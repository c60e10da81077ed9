//! # Node Assembly
//!
//! Wires the coordination components of one server process around a shared
//! store backend. The game runtime and the proxy are supplied as trait
//! objects through [`NodeCollaborators`].
//!
//! Every node runs the heartbeat, the resource deletion listener and the
//! placement request listener. Waiting-room nodes also run the placement
//! orchestrator, and nodes given a [`SessionTransport`] route redirects.

use crate::allocation::AllocationSelector;
use crate::arrival::{ArrivalCoordinator, PlacementRequestListener};
use crate::cache::ResourceCache;
use crate::config::AppConfig;
use crate::invalidation::{ResourceDeletionListener, ResourceHost, ResourceService};
use crate::lifecycle::{LifecycleSignals, LoggingLifecycle};
use crate::placement::{HoldingArea, PlacementOrchestrator};
use crate::redirect::{RedirectRouter, SessionTransport};
use crate::retry::RetryWindow;
use crate::status::{CapacityProbe, OccupancySource, ProcessMemoryProbe, StatusController};
use fleet_core::{
    default_registry, ChannelError, ChannelRegistry, Codec, ConfigurationError, Listener,
    ServerRole, SharedState, StoreBackend, StoreError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// External systems a node talks to.
pub struct NodeCollaborators {
    pub resource_host: Arc<dyn ResourceHost>,
    pub occupancy: Arc<dyn OccupancySource>,
    pub signals: Option<Arc<dyn LifecycleSignals>>,
    pub probe: Option<Arc<dyn CapacityProbe>>,
    /// Sessions waiting for a decision; only used on LIMBO nodes
    pub holding: Option<Arc<dyn HoldingArea>>,
    pub transport: Option<Arc<dyn SessionTransport>>,
}

impl NodeCollaborators {
    pub fn new(resource_host: Arc<dyn ResourceHost>, occupancy: Arc<dyn OccupancySource>) -> Self {
        Self {
            resource_host,
            occupancy,
            signals: None,
            probe: None,
            holding: None,
            transport: None,
        }
    }

    pub fn with_signals(mut self, signals: Arc<dyn LifecycleSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn CapacityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_holding_area(mut self, holding: Arc<dyn HoldingArea>) -> Self {
        self.holding = Some(holding);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SessionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// One running server process.
pub struct FleetNode {
    config: AppConfig,
    state: SharedState,
    channels: ChannelRegistry,
    status: Arc<StatusController>,
    orchestrator: Arc<PlacementOrchestrator>,
    arrival: Arc<ArrivalCoordinator>,
    resources: ResourceService,
    deletion: Arc<ResourceDeletionListener>,
    placement: Arc<PlacementRequestListener>,
    router: Option<Arc<RedirectRouter>>,
    holding: Option<Arc<dyn HoldingArea>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl FleetNode {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn StoreBackend>,
        collaborators: NodeCollaborators,
    ) -> Result<Self, NodeError> {
        let codec = Arc::new(Codec::new(Arc::new(default_registry()?)));
        let state = SharedState::new(backend.clone(), codec.clone());
        let channels = ChannelRegistry::new(backend, codec);
        Ok(Self::with_state(config, state, channels, collaborators))
    }

    pub fn with_state(
        config: AppConfig,
        state: SharedState,
        channels: ChannelRegistry,
        collaborators: NodeCollaborators,
    ) -> Self {
        let server_id = config.server.id.clone();
        let role = config.server.role;
        let default_role = config.placement.default_role;

        let signals: Arc<dyn LifecycleSignals> = match collaborators.signals {
            Some(signals) => signals,
            None => Arc::new(LoggingLifecycle::new(server_id.clone())),
        };
        let probe: Arc<dyn CapacityProbe> = match collaborators.probe {
            Some(probe) => probe,
            None => Arc::new(ProcessMemoryProbe::new()),
        };

        let status = Arc::new(StatusController::new(
            server_id.clone(),
            role,
            state.servers(),
            signals,
            probe,
            collaborators.occupancy,
        ));

        let orchestrator = Arc::new(
            PlacementOrchestrator::new(
                state.clone(),
                channels.clone(),
                AllocationSelector::new(state.servers(), config.allocation),
                RetryWindow::new(config.retry_window(), config.placement.retry_capacity),
            )
            .with_default_role(default_role),
        );

        let cache = Arc::new(ResourceCache::new(state.resources(), config.cache_ttl()));
        let deletion = Arc::new(ResourceDeletionListener::new(
            server_id.clone(),
            collaborators.resource_host.clone(),
            cache.clone(),
            config.teardown_delay(),
        ));
        let placement = Arc::new(PlacementRequestListener::new(
            server_id,
            cache,
            collaborators.resource_host,
        ));

        let router = collaborators.transport.map(|transport| {
            Arc::new(
                RedirectRouter::new(
                    AllocationSelector::new(state.servers(), config.allocation),
                    transport,
                )
                .with_default_role(default_role),
            )
        });

        Self {
            arrival: Arc::new(ArrivalCoordinator::new(state.clone(), role)),
            resources: ResourceService::new(state.clone(), channels.clone()),
            config,
            state,
            channels,
            status,
            orchestrator,
            deletion,
            placement,
            router,
            holding: collaborators.holding,
            tasks: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the arrival coordinator, typically to register resolvers.
    pub fn with_arrival(mut self, arrival: ArrivalCoordinator) -> Self {
        self.arrival = Arc::new(arrival);
        self
    }

    pub fn server_id(&self) -> &str {
        &self.config.server.id
    }

    pub fn role(&self) -> ServerRole {
        self.config.server.role
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn status(&self) -> &Arc<StatusController> {
        &self.status
    }

    pub fn orchestrator(&self) -> &Arc<PlacementOrchestrator> {
        &self.orchestrator
    }

    pub fn arrival(&self) -> &Arc<ArrivalCoordinator> {
        &self.arrival
    }

    pub fn resources(&self) -> &ResourceService {
        &self.resources
    }

    /// Registers this instance and starts its loops and listeners.
    pub async fn start(&self) -> Result<(), NodeError> {
        self.status.register().await?;

        let mut listeners = vec![
            self.deletion.clone().subscribe(&self.channels)?,
            self.placement.clone().subscribe(&self.channels)?,
        ];
        if let Some(router) = &self.router {
            listeners.push(router.clone().subscribe(&self.channels)?);
        }
        self.listeners.lock().extend(listeners);

        let mut tasks = vec![self.status.clone().run(self.config.heartbeat_interval())];
        if self.role() == ServerRole::Limbo {
            match &self.holding {
                Some(holding) => tasks.push(
                    self.orchestrator
                        .clone()
                        .run(holding.clone(), self.config.poll_interval()),
                ),
                None => warn!("⚠️ {} has no holding area, placement loop not started", self.server_id()),
            }
        }
        self.tasks.lock().extend(tasks);

        info!(
            "🚀 {} started as {} (routing redirects: {})",
            self.server_id(),
            self.role(),
            self.router.is_some()
        );
        Ok(())
    }

    /// Stops every loop and listener and signals `shutdown` once.
    ///
    /// Returns `false` if the node was already shut down.
    pub fn shutdown(&self) -> bool {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for listener in self.listeners.lock().drain(..) {
            listener.close();
        }

        let first = self.status.shutdown();
        if first {
            info!("✅ {} shut down", self.server_id());
        }
        first
    }
}

impl Drop for FleetNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
