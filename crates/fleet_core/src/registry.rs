//! # Type Registry
//!
//! The static metadata table consulted by the codec and the channel registry.
//!
//! Every encodable type is registered once, at process start, under a stable
//! mapping id. Message types additionally declare the single channel they are
//! published on. Nothing is discovered at runtime: the table is built through
//! explicit [`TypeRegistryBuilder`] calls and is immutable afterwards.
//!
//! ```rust
//! use fleet_core::{TypeRegistry, messages::RedirectRequest, records::ServerRecord};
//!
//! let registry = TypeRegistry::builder()
//!     .register::<ServerRecord>("server")?
//!     .register_message::<RedirectRequest>("redirect_request", "session_redirect")?
//!     .build();
//!
//! assert_eq!(registry.mapping_of::<ServerRecord>(), Some("server"));
//! assert_eq!(registry.channel_of::<RedirectRequest>()?, "session_redirect");
//! # Ok::<(), fleet_core::ConfigurationError>(())
//! ```

use crate::error::ConfigurationError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use tracing::debug;

pub(crate) type BoxedValue = Box<dyn Any + Send + Sync>;
pub(crate) type DecodeFn = fn(&str) -> Result<BoxedValue, serde_json::Error>;

fn decode_boxed<T>(data: &str) -> Result<BoxedValue, serde_json::Error>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    serde_json::from_str::<T>(data).map(|value| Box::new(value) as BoxedValue)
}

/// Metadata recorded for one registered type.
#[derive(Clone)]
pub struct TypeEntry {
    /// Stable id written to the wire in place of the type name
    pub mapping: String,
    /// Rust type name, for diagnostics only
    pub type_name: &'static str,
    /// Channel the type is published on, if it is a message
    pub channel: Option<String>,
    pub(crate) type_id: TypeId,
    pub(crate) decode: DecodeFn,
}

impl std::fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeEntry")
            .field("mapping", &self.mapping)
            .field("type_name", &self.type_name)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Bidirectional `type <-> mapping id` table plus channel metadata.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_type: HashMap<TypeId, TypeEntry>,
    by_mapping: HashMap<String, TypeId>,
    by_channel: HashMap<String, TypeId>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Metadata for `T`, if registered.
    pub fn entry_of<T: 'static>(&self) -> Option<&TypeEntry> {
        self.by_type.get(&TypeId::of::<T>())
    }

    /// Stable mapping id for `T`, if registered.
    pub fn mapping_of<T: 'static>(&self) -> Option<&str> {
        self.entry_of::<T>().map(|entry| entry.mapping.as_str())
    }

    /// Reverse lookup from a wire mapping id.
    pub fn entry_for_mapping(&self, mapping: &str) -> Option<&TypeEntry> {
        self.by_mapping
            .get(mapping)
            .and_then(|type_id| self.by_type.get(type_id))
    }

    /// Channel declared by `T`.
    ///
    /// Fails with [`ConfigurationError::MissingMapping`] when `T` was never
    /// registered and [`ConfigurationError::MissingChannel`] when it was
    /// registered as a plain record.
    pub fn channel_of<T: 'static>(&self) -> Result<&str, ConfigurationError> {
        let entry = self
            .entry_of::<T>()
            .ok_or(ConfigurationError::MissingMapping(type_name::<T>()))?;
        entry
            .channel
            .as_deref()
            .ok_or(ConfigurationError::MissingChannel(type_name::<T>()))
    }

    /// All declared channel names.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.by_channel.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Collects registrations and rejects conflicting metadata.
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    registry: TypeRegistry,
}

impl TypeRegistryBuilder {
    /// Registers a storable record under a stable mapping id.
    pub fn register<T>(self, mapping: &str) -> Result<Self, ConfigurationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.insert::<T>(mapping, None)
    }

    /// Registers a message type under a stable mapping id and its channel.
    pub fn register_message<T>(self, mapping: &str, channel: &str) -> Result<Self, ConfigurationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if channel.is_empty() {
            return Err(ConfigurationError::Empty {
                what: "channel name",
                type_name: type_name::<T>(),
            });
        }
        self.insert::<T>(mapping, Some(channel))
    }

    fn insert<T>(mut self, mapping: &str, channel: Option<&str>) -> Result<Self, ConfigurationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let attempted = type_name::<T>();

        if mapping.is_empty() {
            return Err(ConfigurationError::Empty {
                what: "mapping id",
                type_name: attempted,
            });
        }
        if self.registry.by_type.contains_key(&type_id) {
            return Err(ConfigurationError::AlreadyRegistered(attempted));
        }
        if let Some(existing) = self.registry.entry_for_mapping(mapping) {
            return Err(ConfigurationError::DuplicateMapping {
                id: mapping.to_string(),
                existing: existing.type_name,
                attempted,
            });
        }
        if let Some(channel) = channel {
            if let Some(existing) = self
                .registry
                .by_channel
                .get(channel)
                .and_then(|id| self.registry.by_type.get(id))
            {
                return Err(ConfigurationError::DuplicateChannel {
                    channel: channel.to_string(),
                    existing: existing.type_name,
                    attempted,
                });
            }
            self.registry.by_channel.insert(channel.to_string(), type_id);
        }

        self.registry.by_mapping.insert(mapping.to_string(), type_id);
        self.registry.by_type.insert(
            type_id,
            TypeEntry {
                mapping: mapping.to_string(),
                type_name: attempted,
                channel: channel.map(str::to_string),
                type_id,
                decode: decode_boxed::<T>,
            },
        );

        debug!("📝 Registered mapping '{}' for {}", mapping, attempted);
        Ok(self)
    }

    pub fn build(self) -> TypeRegistry {
        self.registry
    }
}
