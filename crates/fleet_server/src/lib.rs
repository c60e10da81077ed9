//! # Fleet Server
//!
//! Runtime for one server process in the fleet, built on the shared store and
//! channels from [`fleet_core`].
//!
//! ## Components
//!
//! - [`allocation`] - least-loaded instance selection with a capacity ceiling
//!   and safety margin
//! - [`placement`] - the waiting-room orchestrator that decides where
//!   rejoining sessions go
//! - [`arrival`] - destination-side position resolution and placement
//!   preparation
//! - [`redirect`] - routes redirect requests to a concrete instance
//! - [`invalidation`] - resource deletion, evacuation and delayed teardown
//! - [`status`] / [`lifecycle`] - heartbeat and platform lifecycle signals
//! - [`node`] - assembles all of the above for one process
//!
//! The game runtime and the proxy are external. They are reached through the
//! [`HoldingArea`], [`ResourceHost`], [`OccupancySource`], [`PositionResolver`]
//! and [`SessionTransport`] traits.

pub mod allocation;
pub mod arrival;
pub mod cache;
pub mod cli;
pub mod config;
pub mod invalidation;
pub mod lifecycle;
pub mod logging;
pub mod node;
pub mod placement;
pub mod redirect;
pub mod retry;
pub mod signals;
pub mod status;

pub use allocation::{select_from, AllocationError, AllocationPolicy, AllocationSelector};
pub use arrival::{ArrivalCoordinator, PlacementRequestListener, PositionResolver};
pub use cache::ResourceCache;
pub use config::{AppConfig, StoreKind, StoreSettings};
pub use invalidation::{ResourceDeletionListener, ResourceError, ResourceHost, ResourceService};
pub use lifecycle::{LifecycleSignals, LoggingLifecycle};
pub use node::{FleetNode, NodeCollaborators, NodeError};
pub use placement::{
    HoldingArea, Occupant, PlacementDecision, PlacementError, PlacementOrchestrator,
};
pub use redirect::{RedirectRouter, SessionTransport, TransferError};
pub use retry::RetryWindow;
pub use signals::ShutdownSignal;
pub use status::{CapacityProbe, OccupancySource, ProcessMemoryProbe, StatusController};
