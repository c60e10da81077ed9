//! Error taxonomy shared by the codec, the store and the channel registry.

use thiserror::Error;

/// Failures while turning values into envelopes and back.
///
/// Codec errors are always surfaced to the caller. A payload that cannot be
/// decoded in full is rejected, never returned partially.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes are not a `{ "mapping", "data" }` envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    /// The mapping id is neither registered nor the literal type name expected
    #[error("Unknown mapping '{mapping}' (expected {expected})")]
    UnknownMapping {
        mapping: String,
        expected: &'static str,
    },
    /// The mapping id is registered to a different type than the one requested
    #[error("Mapping '{mapping}' resolves to {registered}, not {expected}")]
    TypeMismatch {
        mapping: String,
        registered: &'static str,
        expected: &'static str,
    },
    /// The value itself could not be serialized
    #[error("Failed to encode payload for '{mapping}': {source}")]
    Encode {
        mapping: String,
        #[source]
        source: serde_json::Error,
    },
    /// The payload does not match the structure of the target type
    #[error("Failed to decode payload for '{mapping}': {source}")]
    Decode {
        mapping: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Missing or conflicting static metadata.
///
/// These are programming defects and are expected to surface at startup or at
/// the first call site, not to be recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Type {0} has no registered mapping")]
    MissingMapping(&'static str),

    #[error("Type {0} declares no channel")]
    MissingChannel(&'static str),

    #[error("Mapping id '{id}' is already bound to {existing}, cannot bind {attempted}")]
    DuplicateMapping {
        id: String,
        existing: &'static str,
        attempted: &'static str,
    },

    #[error("Channel '{channel}' is already declared by {existing}, cannot declare it for {attempted}")]
    DuplicateChannel {
        channel: String,
        existing: &'static str,
        attempted: &'static str,
    },

    #[error("Type {0} is already registered")]
    AlreadyRegistered(&'static str),

    #[error("Empty {what} for type {type_name}")]
    Empty {
        what: &'static str,
        type_name: &'static str,
    },
}

/// Failures of shared state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transient connectivity problem; callers decide whether to retry
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The blocking task backing a non-blocking call did not complete
    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures of typed publish/listen calls.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type CodecResult<T> = Result<T, CodecError>;
