//! Cross-instance messages and the channels they travel on.
//!
//! Payload fields are hints. Consumers re-read the authoritative records from
//! the store before acting on anything that matters, since a message can be
//! observed before the state write that preceded it is visible.

use crate::records::{ResourceId, ServerRole, SessionId};
use serde::{Deserialize, Serialize};

pub const PLACEMENT_CHANNEL: &str = "resource_placement";
pub const REDIRECT_CHANNEL: &str = "session_redirect";
pub const RESOURCE_DELETE_CHANNEL: &str = "resource_delete";

/// Asks a specific instance to place a session inside a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub target_instance_id: String,
    pub session_id: SessionId,
    pub resource_id: ResourceId,
    pub display_name: String,
    /// Place at the resource's home point rather than a visit point
    pub home: bool,
}

/// Asks the network to route a session to any instance of a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRequest {
    pub session_id: SessionId,
    pub target_role: ServerRole,
}

/// Tells the hosting instance that a resource was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeleteRequest {
    /// Instance the request is addressed to; others ignore it
    pub server: Option<String>,
    pub resource_id: ResourceId,
}
