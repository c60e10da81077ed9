//! # Envelope Codec
//!
//! Every value that crosses a process boundary, as a map value, a map key or
//! a published message, is wrapped in an envelope:
//!
//! ```json
//! { "mapping": "session", "data": "{\"session_id\":\"...\",...}" }
//! ```
//!
//! `mapping` is the stable id from the [`TypeRegistry`], never the Rust type
//! name of a registered type, so records can be renamed or moved between
//! modules without invalidating data already in the store or in flight.
//! `data` is the JSON text of the value.
//!
//! Types without a registration fall back to their literal type name. That
//! exists for primitives used as keys (`String`, `Uuid`, ...) and should not be
//! relied on for domain types.

use crate::error::{CodecError, CodecResult};
use crate::registry::{BoxedValue, TypeRegistry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any, TypeId};
use std::sync::Arc;
use tracing::trace;

/// Wire form of every encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub mapping: String,
    pub data: String,
}

/// Encodes and decodes envelopes against a shared [`TypeRegistry`].
#[derive(Debug, Clone)]
pub struct Codec {
    registry: Arc<TypeRegistry>,
}

impl Codec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Encodes `value` into envelope bytes.
    pub fn encode<T>(&self, value: &T) -> CodecResult<Vec<u8>>
    where
        T: Serialize + 'static,
    {
        let mapping = match self.registry.mapping_of::<T>() {
            Some(mapping) => mapping.to_string(),
            None => {
                trace!("No mapping registered for {}, using type name", type_name::<T>());
                type_name::<T>().to_string()
            }
        };

        let data = match serde_json::to_string(value) {
            Ok(data) => data,
            Err(source) => return Err(CodecError::Encode { mapping, source }),
        };

        let envelope = Envelope { mapping, data };
        serde_json::to_vec(&envelope).map_err(|source| CodecError::Encode {
            mapping: envelope.mapping.clone(),
            source,
        })
    }

    /// Parses the envelope without decoding its payload.
    pub fn open(&self, bytes: &[u8]) -> CodecResult<Envelope> {
        serde_json::from_slice(bytes).map_err(CodecError::MalformedEnvelope)
    }

    /// Decodes envelope bytes into a `T`.
    ///
    /// The envelope's mapping must either be registered to `T` or, when it is
    /// not registered at all, equal `T`'s literal type name.
    pub fn decode<T>(&self, bytes: &[u8]) -> CodecResult<T>
    where
        T: DeserializeOwned + 'static,
    {
        let envelope = self.open(bytes)?;

        match self.registry.entry_for_mapping(&envelope.mapping) {
            Some(entry) if entry.type_id == TypeId::of::<T>() => {}
            Some(entry) => {
                return Err(CodecError::TypeMismatch {
                    mapping: envelope.mapping,
                    registered: entry.type_name,
                    expected: type_name::<T>(),
                });
            }
            None if envelope.mapping == type_name::<T>() => {}
            None => {
                return Err(CodecError::UnknownMapping {
                    mapping: envelope.mapping,
                    expected: type_name::<T>(),
                });
            }
        }

        serde_json::from_str(&envelope.data).map_err(|source| CodecError::Decode {
            mapping: envelope.mapping,
            source,
        })
    }

    /// Decodes envelope bytes through the registry without a static type.
    ///
    /// Only registered mappings can be decoded this way.
    pub fn decode_dynamic(&self, bytes: &[u8]) -> CodecResult<DecodedValue> {
        let envelope = self.open(bytes)?;
        let entry = self
            .registry
            .entry_for_mapping(&envelope.mapping)
            .ok_or_else(|| CodecError::UnknownMapping {
                mapping: envelope.mapping.clone(),
                expected: "a registered type",
            })?;

        let value = (entry.decode)(&envelope.data).map_err(|source| CodecError::Decode {
            mapping: envelope.mapping.clone(),
            source,
        })?;

        Ok(DecodedValue {
            mapping: envelope.mapping,
            type_name: entry.type_name,
            value,
        })
    }
}

/// A value decoded without knowing its type at the call site.
pub struct DecodedValue {
    mapping: String,
    type_name: &'static str,
    value: BoxedValue,
}

impl DecodedValue {
    pub fn mapping(&self) -> &str {
        &self.mapping
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Recovers the concrete value, or gives `self` back if `T` is wrong.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let Self {
            mapping,
            type_name,
            value,
        } = self;
        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self {
                mapping,
                type_name,
                value,
            }),
        }
    }
}

impl std::fmt::Debug for DecodedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedValue")
            .field("mapping", &self.mapping)
            .field("type_name", &self.type_name)
            .finish()
    }
}
