//! Several nodes sharing one store backend, exchanging real channel messages.

use async_trait::async_trait;
use fleet_core::{
    Location, MemoryBackend, PlacementRequest, PositionResolution, ResourceId, ResourceRecord,
    ServerRecord, ServerRole, SessionId, SessionRecord, StoreBackend,
};
use fleet_server::{
    AppConfig, ArrivalCoordinator, CapacityProbe, FleetNode, HoldingArea, NodeCollaborators,
    Occupant, OccupancySource, PositionResolver, ResourceHost, SessionTransport, TransferError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostEvent {
    Prepared(ResourceId, SessionId),
    Evacuated(SessionId),
    TornDown(ResourceId),
}

#[derive(Default)]
struct TestRuntime {
    waiting: Mutex<Vec<Occupant>>,
    hosted: Mutex<HashMap<ResourceId, Vec<SessionId>>>,
    events: Mutex<Vec<HostEvent>>,
}

impl TestRuntime {
    fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }
}

impl HoldingArea for TestRuntime {
    fn occupants(&self) -> Vec<Occupant> {
        self.waiting.lock().clone()
    }
}

impl OccupancySource for TestRuntime {
    fn session_count(&self) -> u32 {
        self.hosted.lock().values().map(|s| s.len() as u32).sum()
    }
}

#[async_trait]
impl ResourceHost for TestRuntime {
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
        self.events.lock().push(HostEvent::Evacuated(session));
    }

    async fn teardown(&self, resource: ResourceId) {
        self.hosted.lock().remove(&resource);
        self.events.lock().push(HostEvent::TornDown(resource));
    }

    async fn prepare_placement(&self, resource: &ResourceRecord, request: &PlacementRequest) {
        self.hosted
            .lock()
            .entry(resource.resource_id)
            .or_default()
            .push(request.session_id);
        self.events
            .lock()
            .push(HostEvent::Prepared(resource.resource_id, request.session_id));
    }
}

struct FixedProbe(u64);

impl CapacityProbe for FixedProbe {
    fn used_units(&self) -> u64 {
        self.0
    }
}

struct SpawnPoint;

#[async_trait]
impl PositionResolver for SpawnPoint {
    async fn resolve(&self, _: &SessionRecord, _: ServerRole) -> Option<Location> {
        Some(Location {
            world: "home".to_string(),
            x: 0.0,
            y: 100.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
        })
    }
}

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

fn config(id: &str, role: ServerRole) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.id = id.to_string();
    config.server.role = role;
    config.placement.poll_interval_ms = 25;
    config.status.heartbeat_interval_ms = 25;
    config.invalidation.teardown_delay_ms = 100;
    config
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_returning_owner_round_trip() {
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());

    let host_runtime = Arc::new(TestRuntime::default());
    let world_host = FleetNode::new(
        config("world-host-1", ServerRole::WorldHost),
        backend.clone(),
        NodeCollaborators::new(host_runtime.clone(), host_runtime.clone())
            .with_probe(Arc::new(FixedProbe(200))),
    )
    .unwrap();
    let arrival = ArrivalCoordinator::new(world_host.state().clone(), ServerRole::WorldHost)
        .with_resolver(PositionResolution::TeleportResourceHome, Arc::new(SpawnPoint));
    let world_host = world_host.with_arrival(arrival);

    let limbo_runtime = Arc::new(TestRuntime::default());
    let limbo = FleetNode::new(
        config("limbo-1", ServerRole::Limbo),
        backend.clone(),
        NodeCollaborators::new(limbo_runtime.clone(), limbo_runtime.clone())
            .with_probe(Arc::new(FixedProbe(50)))
            .with_holding_area(limbo_runtime.clone()),
    )
    .unwrap();

    let owner = SessionId::new();
    let resource = ResourceRecord::new(ResourceId::new(), owner);
    let resource_id = resource.resource_id;
    limbo
        .state()
        .resources()
        .put(&resource_id, &resource)
        .unwrap();

    let mut session = SessionRecord::first_contact(owner, "Alex");
    session.last_server_role = ServerRole::WorldHost;
    session.resource_id = Some(resource_id);
    limbo.state().sessions().put(&owner, &session).unwrap();

    world_host.start().await.unwrap();
    limbo.start().await.unwrap();

    limbo
        .orchestrator()
        .register_arrival(owner, "Alex")
        .await
        .unwrap();
    limbo_runtime
        .waiting
        .lock()
        .push(Occupant::new(owner, "Alex"));

    eventually("placement on the world host", || {
        host_runtime
            .events()
            .contains(&HostEvent::Prepared(resource_id, owner))
    })
    .await;
    limbo_runtime.waiting.lock().clear();

    eventually("host recorded on the resource", || {
        limbo
            .state()
            .resources()
            .get(&resource_id)
            .ok()
            .flatten()
            .and_then(|r| r.host_instance_id)
            == Some("world-host-1".to_string())
    })
    .await;

    let stored = world_host.state().sessions().get(&owner).unwrap().unwrap();
    assert_eq!(
        stored.position_resolution_mode,
        PositionResolution::TeleportResourceHome
    );

    let location = world_host.arrival().on_arrival(owner).await.unwrap();
    assert_eq!(location.map(|l| l.world), Some("home".to_string()));
    let stored = world_host.state().sessions().get(&owner).unwrap().unwrap();
    assert_eq!(stored.position_resolution_mode, PositionResolution::None);
    assert_eq!(stored.last_server_role, ServerRole::WorldHost);

    let removed = limbo.resources().delete(resource_id).await.unwrap();
    assert!(removed.is_some());
    assert!(limbo.state().resources().get(&resource_id).unwrap().is_none());

    eventually("teardown on the world host", || {
        host_runtime
            .events()
            .contains(&HostEvent::TornDown(resource_id))
    })
    .await;
    let events = host_runtime.events();
    let evacuated = events
        .iter()
        .position(|e| *e == HostEvent::Evacuated(owner))
        .unwrap();
    let torn_down = events
        .iter()
        .position(|e| *e == HostEvent::TornDown(resource_id))
        .unwrap();
    assert!(evacuated < torn_down);

    assert!(world_host.shutdown());
    assert!(!world_host.shutdown());
    assert!(limbo.shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_newcomer_is_routed_to_spawn() {
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());

    let spawn_runtime = Arc::new(TestRuntime::default());
    let spawn = FleetNode::new(
        config("spawn-1", ServerRole::Spawn),
        backend.clone(),
        NodeCollaborators::new(spawn_runtime.clone(), spawn_runtime)
            .with_probe(Arc::new(FixedProbe(300))),
    )
    .unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let limbo_runtime = Arc::new(TestRuntime::default());
    let limbo = FleetNode::new(
        config("limbo-1", ServerRole::Limbo),
        backend,
        NodeCollaborators::new(limbo_runtime.clone(), limbo_runtime.clone())
            .with_probe(Arc::new(FixedProbe(50)))
            .with_holding_area(limbo_runtime.clone())
            .with_transport(transport.clone()),
    )
    .unwrap();

    spawn.start().await.unwrap();
    limbo.start().await.unwrap();

    let newcomer = SessionId::new();
    limbo
        .orchestrator()
        .register_arrival(newcomer, "Sam")
        .await
        .unwrap();
    limbo_runtime
        .waiting
        .lock()
        .push(Occupant::new(newcomer, "Sam"));

    eventually("redirect to spawn", || !transport.moves.lock().is_empty()).await;
    assert_eq!(
        transport.moves.lock()[0],
        (newcomer, "spawn-1".to_string())
    );

    spawn.shutdown();
    limbo.shutdown();
}
