//! Fleet server node entry point.
//!
//! Runs the coordination layer of one instance without an attached game
//! runtime: the node registers itself, heartbeats, and reacts to fleet
//! messages, but hosts no sessions or resources of its own.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fleet_core::{
    MemoryBackend, PlacementRequest, RedisBackend, ResourceId, ResourceRecord, SessionId,
    StoreBackend,
};
use fleet_server::cli::CliArgs;
use fleet_server::config::{AppConfig, StoreKind, StoreSettings};
use fleet_server::logging::setup_logging;
use fleet_server::signals::wait_for_shutdown;
use fleet_server::{
    FleetNode, HoldingArea, NodeCollaborators, Occupant, OccupancySource, ResourceHost,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stand-in for the game runtime when running the node on its own.
struct HeadlessRuntime;

impl HoldingArea for HeadlessRuntime {
    fn occupants(&self) -> Vec<Occupant> {
        Vec::new()
    }
}

impl OccupancySource for HeadlessRuntime {
    fn session_count(&self) -> u32 {
        0
    }
}

#[async_trait]
impl ResourceHost for HeadlessRuntime {
    fn is_hosted(&self, _: ResourceId) -> bool {
        false
    }

    fn occupants(&self, _: ResourceId) -> Vec<SessionId> {
        Vec::new()
    }

    async fn evacuate(&self, _: SessionId, _: ResourceId) {}

    async fn teardown(&self, _: ResourceId) {}

    async fn prepare_placement(&self, resource: &ResourceRecord, request: &PlacementRequest) {
        warn!(
            "Placement of {} into {} requested, but no game runtime is attached",
            request.session_id, resource.resource_id
        );
    }
}

async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn StoreBackend>> {
    match settings.backend {
        StoreKind::Redis => {
            let url = settings.url.clone();
            let prefix = settings.key_prefix.clone();
            let backend = tokio::task::spawn_blocking(move || RedisBackend::connect(&url, &prefix))
                .await?
                .with_context(|| format!("Failed to connect to store at {}", settings.url))?;
            Ok(Arc::new(backend))
        }
        StoreKind::Memory => {
            warn!("⚠️ Using a process-local store, this node cannot see the rest of the fleet");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

async fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    args.apply(&mut config);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;
    Ok(config)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = load_config(&args).await?;
    setup_logging(&config.logging)?;

    info!(
        "📂 Config: {} | Instance: {} ({})",
        args.config_path.display(),
        config.server.id,
        config.server.role
    );
    info!("  🗄️ Store: {:?} at {}", config.store.backend, config.store.url);
    info!(
        "  ⚖️ Capacity ceiling {} units, margin {}, reservation {}",
        config.allocation.capacity_ceiling,
        config.allocation.safety_margin,
        config.allocation.reservation_units
    );

    let runtime = Arc::new(HeadlessRuntime);
    let collaborators = NodeCollaborators::new(runtime.clone(), runtime.clone())
        .with_holding_area(runtime);
    let backend = open_store(&config.store).await?;
    let server_id = config.server.id.clone();
    let node = FleetNode::new(config, backend, collaborators).context("Failed to build node")?;

    node.start().await.context("Failed to start node")?;
    info!("🛑 Press Ctrl+C to gracefully shutdown");

    match wait_for_shutdown().await {
        Ok(signal) => info!("🛑 {} received, shutting down {}", signal, server_id),
        Err(e) => error!("❌ Signal handling failed, shutting down {}: {}", server_id, e),
    }
    node.shutdown();
    Ok(())
}
