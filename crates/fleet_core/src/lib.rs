//! # Fleet Core
//!
//! The coordination layer shared by every server process in the fleet.
//!
//! ## Components
//!
//! - **Type registry** ([`registry`]) - stable mapping ids and channel names,
//!   registered explicitly once at process start
//! - **Envelope codec** ([`codec`]) - `{ mapping, data }` wire format keyed by
//!   the stable id instead of the type name
//! - **Shared state store** ([`store`]) - named, typed maps, map-caches and
//!   lists with blocking and non-blocking access, over a [`RedisBackend`]
//!   shared by the fleet or a process-local [`MemoryBackend`]
//! - **Channel registry** ([`channels`]) - `publish(message)` / `listen(handler)`
//!   with the channel resolved from the message type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleet_core::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let codec = Arc::new(Codec::new(Arc::new(default_registry()?)));
//! let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
//!
//! let state = SharedState::new(backend.clone(), codec.clone());
//! let channels = ChannelRegistry::new(backend, codec);
//!
//! let _listener = channels.listen(|request: RedirectRequest| {
//!     println!("route {} to {}", request.session_id, request.target_role);
//! })?;
//!
//! let session = SessionId::new();
//! state
//!     .sessions()
//!     .compute_if_absent_async(session, move || SessionRecord::first_contact(session, "Alex"))
//!     .await?;
//! channels.publish(&RedirectRequest { session_id: session, target_role: ServerRole::Spawn })?;
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod codec;
pub mod error;
pub mod messages;
pub mod records;
pub mod registry;
pub mod store;

pub use channels::{ChannelRegistry, Listener};
pub use codec::{Codec, DecodedValue, Envelope};
pub use error::{ChannelError, CodecError, ConfigurationError, StoreError, StoreResult};
pub use messages::{PlacementRequest, RedirectRequest, ResourceDeleteRequest};
pub use records::{
    EconomyRecord, LifecycleState, Location, PositionResolution, ProfileRecord, ResourceId,
    ResourceRecord, ServerRecord, ServerRole, SessionId, SessionRecord,
};
pub use registry::{TypeEntry, TypeRegistry, TypeRegistryBuilder};
pub use store::{
    Delivery, MemoryBackend, RedisBackend, SharedState, StoreBackend, StoreList, StoreMap,
    StoreMapCache, Subscription,
};

/// Registry with every record and message of the fleet under its stable id.
///
/// Mapping ids and channel names are part of the wire format: once data has
/// been written under an id, the id must not change.
pub fn default_registry() -> Result<TypeRegistry, ConfigurationError> {
    Ok(TypeRegistry::builder()
        .register::<ServerRecord>("server")?
        .register::<SessionRecord>("session")?
        .register::<ResourceRecord>("resource")?
        .register::<EconomyRecord>("economy")?
        .register::<ProfileRecord>("profile")?
        .register::<SessionId>("session_id")?
        .register::<ResourceId>("resource_id")?
        .register_message::<PlacementRequest>("placement_request", messages::PLACEMENT_CHANNEL)?
        .register_message::<RedirectRequest>("redirect_request", messages::REDIRECT_CHANNEL)?
        .register_message::<ResourceDeleteRequest>(
            "resource_delete_request",
            messages::RESOURCE_DELETE_CHANNEL,
        )?
        .build())
}
