//! # Shared Records
//!
//! The record types held in the shared state store. Each record type has
//! exactly one authoritative copy in the store; processes read and write it
//! through the typed maps in [`crate::store`].
//!
//! - [`ServerRecord`] - self-reported load and lifecycle state of one instance
//! - [`SessionRecord`] - routing state of one connected client
//! - [`ResourceRecord`] - an owned, deletable unit of hosted content

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque identity of a client session, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an owned resource such as a player world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Workload category served by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerRole {
    /// Default landing instances
    Spawn,
    /// Waiting room that steers rejoining sessions
    Limbo,
    /// Full game instances hosting owned resources
    WorldHost,
}

impl ServerRole {
    pub const ALL: [ServerRole; 3] = [ServerRole::Spawn, ServerRole::Limbo, ServerRole::WorldHost];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Spawn => "SPAWN",
            ServerRole::Limbo => "LIMBO",
            ServerRole::WorldHost => "WORLD_HOST",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerRole {
    type Err = String;

    /// Accepts `world_host`, `WORLD_HOST` and `world-host` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ServerRole::ALL
            .into_iter()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| format!("Unknown server role: {}", s))
    }
}

/// Whether an instance is idle or actively serving load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Idle, can accept new load
    Ready,
    /// Actively serving sessions
    Allocated,
}

/// What the destination instance must do with a session once it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionResolution {
    TeleportSpawn,
    TeleportResourceVisit,
    TeleportResourceHome,
    TeleportResourceWarp,
    TeleportPlayerShop,
    None,
}

// ============================================================================
// Records
// ============================================================================

/// Self-reported state of one server process.
///
/// Written only by the process it describes, on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub role: ServerRole,
    pub lifecycle_state: LifecycleState,
    pub used_capacity_units: u64,
    pub current_session_count: u32,
}

impl ServerRecord {
    /// A freshly registered, idle instance.
    pub fn new(id: impl Into<String>, role: ServerRole) -> Self {
        Self {
            id: id.into(),
            role,
            lifecycle_state: LifecycleState::Ready,
            used_capacity_units: 0,
            current_session_count: 0,
        }
    }
}

/// Routing state of one session, independent of which instance hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// Last known name, overwritten on every reconnect
    pub display_name: String,
    /// Role of the instance the session was last routed from
    pub last_server_role: ServerRole,
    /// Weak reference to an owned resource
    pub resource_id: Option<ResourceId>,
    pub position_resolution_mode: PositionResolution,
}

impl SessionRecord {
    /// Record created on a session's first contact with the network.
    pub fn first_contact(session_id: SessionId, display_name: impl Into<String>) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
            last_server_role: ServerRole::Spawn,
            resource_id: None,
            position_resolution_mode: PositionResolution::TeleportSpawn,
        }
    }

    pub fn with_resolution(mut self, mode: PositionResolution) -> Self {
        self.position_resolution_mode = mode;
        self
    }
}

/// An owned, deletable unit of hosted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub owner_session_id: SessionId,
    pub members: BTreeSet<SessionId>,
    /// Instance currently hosting the resource's space, if loaded anywhere
    pub host_instance_id: Option<String>,
}

impl ResourceRecord {
    pub fn new(resource_id: ResourceId, owner: SessionId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(owner);
        Self {
            resource_id,
            owner_session_id: owner,
            members,
            host_instance_id: None,
        }
    }
}

/// Balance held by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyRecord {
    pub session_id: SessionId,
    pub balance: f64,
}

/// Externally fetched profile data, cached with a time-to-live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub display_name: String,
    pub texture: String,
}

/// A named point inside a hosted space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
}
