//! # Shared State Store
//!
//! Named, strongly typed collections layered over a byte-level
//! [`StoreBackend`]. Keys and values are both written as codec envelopes.
//!
//! Every operation exists in a blocking form and a non-blocking `*_async`
//! form. The async forms run the blocking call on tokio's blocking pool, so
//! they are safe to await from tasks that must not stall on store latency.
//!
//! The store never invalidates anything on its own. Callers remove entries
//! explicitly when a domain event makes them stale.

mod memory;
mod redis;

pub use self::redis::RedisBackend;
pub use memory::MemoryBackend;

use crate::codec::Codec;
use crate::error::{StoreError, StoreResult};
use crate::records::{
    EconomyRecord, ProfileRecord, ResourceId, ResourceRecord, ServerRecord, SessionId,
    SessionRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const SERVERS_MAP: &str = "servers";
pub const SESSIONS_MAP: &str = "sessions";
pub const RESOURCES_MAP: &str = "resources";
pub const ECONOMY_MAP: &str = "economy";
pub const PROFILES_MAP: &str = "profiles";
pub const MESSAGE_TARGETS_MAP: &str = "message_targets";

/// Byte-level operations of the externally visible store.
///
/// All calls are blocking and may take a network round trip. Writes to one
/// key from one caller are applied in issue order; there is no cross-key
/// transaction.
pub trait StoreBackend: Send + Sync + 'static {
    fn get(&self, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn put(&self, map: &str, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()>;
    fn put_with_ttl(&self, map: &str, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StoreResult<()>;
    fn remove(&self, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn contains(&self, map: &str, key: &[u8]) -> StoreResult<bool>;
    fn entries(&self, map: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;
    fn len(&self, map: &str) -> StoreResult<usize>;

    /// Returns the live value under `key`, or stores and returns the result
    /// of `factory`. Concurrent callers on the same key all observe the one
    /// value that was stored.
    fn compute_if_absent(
        &self,
        map: &str,
        key: Vec<u8>,
        factory: Box<dyn FnOnce() -> StoreResult<Vec<u8>> + Send + '_>,
    ) -> StoreResult<Vec<u8>>;

    fn clear(&self, map: &str) -> StoreResult<()>;

    /// Appends to a list and returns its new length.
    fn list_push(&self, list: &str, value: Vec<u8>) -> StoreResult<usize>;
    fn list_range(&self, list: &str) -> StoreResult<Vec<Vec<u8>>>;
    /// Removes the first element equal to `value`.
    fn list_remove(&self, list: &str, value: &[u8]) -> StoreResult<bool>;
    fn list_len(&self, list: &str) -> StoreResult<usize>;
    fn list_clear(&self, list: &str) -> StoreResult<()>;

    /// Fire-and-forget publish; returns how many subscribers were reached.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize>;
    fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}

/// One item taken from a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Vec<u8>),
    /// The subscriber fell behind and this many messages were dropped
    Lagged(u64),
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(channel: &str, receiver: broadcast::Receiver<Vec<u8>>) -> Self {
        Self {
            channel: channel.to_string(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next delivery, or `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.receiver.recv().await {
            Ok(bytes) => Some(Delivery::Message(bytes)),
            Err(RecvError::Lagged(skipped)) => Some(Delivery::Lagged(skipped)),
            Err(RecvError::Closed) => None,
        }
    }
}

async fn run_blocking<R, F>(call: F) -> StoreResult<R>
where
    F: FnOnce() -> StoreResult<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(call).await?
}

/// Bounds every stored key and value type must satisfy.
pub trait Storable: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Storable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

// ============================================================================
// Typed map
// ============================================================================

/// Typed view over one named map.
pub struct StoreMap<K, V> {
    name: Arc<str>,
    backend: Arc<dyn StoreBackend>,
    codec: Arc<Codec>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for StoreMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            codec: self.codec.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> std::fmt::Debug for StoreMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMap").field("name", &self.name).finish()
    }
}

impl<K: Storable, V: Storable> StoreMap<K, V> {
    pub fn new(name: &str, backend: Arc<dyn StoreBackend>, codec: Arc<Codec>) -> Self {
        Self {
            name: Arc::from(name),
            backend,
            codec,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn encode_key(&self, key: &K) -> StoreResult<Vec<u8>> {
        Ok(self.codec.encode(key)?)
    }

    fn decode_value(&self, bytes: &[u8]) -> StoreResult<V> {
        Ok(self.codec.decode(bytes)?)
    }

    pub fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let key = self.encode_key(key)?;
        self.backend
            .get(&self.name, &key)?
            .map(|bytes| self.decode_value(&bytes))
            .transpose()
    }

    pub fn put(&self, key: &K, value: &V) -> StoreResult<()> {
        let key = self.encode_key(key)?;
        let value = self.codec.encode(value)?;
        self.backend.put(&self.name, key, value)
    }

    /// Removes the entry and returns the value it held.
    pub fn remove(&self, key: &K) -> StoreResult<Option<V>> {
        let key = self.encode_key(key)?;
        self.backend
            .remove(&self.name, &key)?
            .map(|bytes| self.decode_value(&bytes))
            .transpose()
    }

    pub fn contains_key(&self, key: &K) -> StoreResult<bool> {
        let key = self.encode_key(key)?;
        self.backend.contains(&self.name, &key)
    }

    pub fn len(&self) -> StoreResult<usize> {
        self.backend.len(&self.name)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn values(&self) -> StoreResult<Vec<V>> {
        self.backend
            .entries(&self.name)?
            .iter()
            .map(|(_, bytes)| self.decode_value(bytes))
            .collect()
    }

    pub fn entries(&self) -> StoreResult<Vec<(K, V)>> {
        self.backend
            .entries(&self.name)?
            .iter()
            .map(|(key, value)| -> StoreResult<(K, V)> {
                Ok((self.codec.decode(key)?, self.decode_value(value)?))
            })
            .collect()
    }

    /// Atomic create-if-missing.
    ///
    /// When several callers race on the same missing key, the factory runs
    /// once and every caller receives the value it produced.
    pub fn compute_if_absent<F>(&self, key: &K, factory: F) -> StoreResult<V>
    where
        F: FnOnce() -> V + Send,
    {
        let key = self.encode_key(key)?;
        let codec = &self.codec;
        let bytes = self.backend.compute_if_absent(
            &self.name,
            key,
            Box::new(move || codec.encode(&factory()).map_err(StoreError::from)),
        )?;
        self.decode_value(&bytes)
    }

    pub async fn get_async(&self, key: K) -> StoreResult<Option<V>> {
        let map = self.clone();
        run_blocking(move || map.get(&key)).await
    }

    pub async fn put_async(&self, key: K, value: V) -> StoreResult<()> {
        let map = self.clone();
        run_blocking(move || map.put(&key, &value)).await
    }

    pub async fn remove_async(&self, key: K) -> StoreResult<Option<V>> {
        let map = self.clone();
        run_blocking(move || map.remove(&key)).await
    }

    pub async fn contains_key_async(&self, key: K) -> StoreResult<bool> {
        let map = self.clone();
        run_blocking(move || map.contains_key(&key)).await
    }

    pub async fn values_async(&self) -> StoreResult<Vec<V>> {
        let map = self.clone();
        run_blocking(move || map.values()).await
    }

    pub async fn compute_if_absent_async<F>(&self, key: K, factory: F) -> StoreResult<V>
    where
        F: FnOnce() -> V + Send + 'static,
    {
        let map = self.clone();
        run_blocking(move || map.compute_if_absent(&key, factory)).await
    }
}

// ============================================================================
// Typed map with per-entry expiry
// ============================================================================

/// A [`StoreMap`] whose entries may carry a time-to-live.
pub struct StoreMapCache<K, V> {
    map: StoreMap<K, V>,
}

impl<K, V> Clone for StoreMapCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for StoreMapCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMapCache").field("name", &self.map.name).finish()
    }
}

impl<K, V> Deref for StoreMapCache<K, V> {
    type Target = StoreMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl<K: Storable, V: Storable> StoreMapCache<K, V> {
    pub fn new(name: &str, backend: Arc<dyn StoreBackend>, codec: Arc<Codec>) -> Self {
        Self {
            map: StoreMap::new(name, backend, codec),
        }
    }

    /// Stores `value` until `ttl` elapses.
    pub fn put_with_ttl(&self, key: &K, value: &V, ttl: Duration) -> StoreResult<()> {
        let key = self.map.encode_key(key)?;
        let value = self.map.codec.encode(value)?;
        self.map.backend.put_with_ttl(&self.map.name, key, value, ttl)
    }

    pub async fn put_with_ttl_async(&self, key: K, value: V, ttl: Duration) -> StoreResult<()> {
        let cache = self.clone();
        run_blocking(move || cache.put_with_ttl(&key, &value, ttl)).await
    }
}

// ============================================================================
// Typed list
// ============================================================================

/// Typed view over one named list.
pub struct StoreList<V> {
    name: Arc<str>,
    backend: Arc<dyn StoreBackend>,
    codec: Arc<Codec>,
    _type: PhantomData<fn() -> V>,
}

impl<V> Clone for StoreList<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            codec: self.codec.clone(),
            _type: PhantomData,
        }
    }
}

impl<V: Storable> StoreList<V> {
    pub fn new(name: &str, backend: Arc<dyn StoreBackend>, codec: Arc<Codec>) -> Self {
        Self {
            name: Arc::from(name),
            backend,
            codec,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `value` and returns the new length.
    pub fn push(&self, value: &V) -> StoreResult<usize> {
        let bytes = self.codec.encode(value)?;
        self.backend.list_push(&self.name, bytes)
    }

    pub fn all(&self) -> StoreResult<Vec<V>> {
        self.backend
            .list_range(&self.name)?
            .iter()
            .map(|bytes| -> StoreResult<V> { Ok(self.codec.decode(bytes)?) })
            .collect()
    }

    /// Removes the first element equal to `value`.
    pub fn remove(&self, value: &V) -> StoreResult<bool> {
        let bytes = self.codec.encode(value)?;
        self.backend.list_remove(&self.name, &bytes)
    }

    pub fn len(&self) -> StoreResult<usize> {
        self.backend.list_len(&self.name)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> StoreResult<()> {
        self.backend.list_clear(&self.name)
    }

    pub async fn push_async(&self, value: V) -> StoreResult<usize> {
        let list = self.clone();
        run_blocking(move || list.push(&value)).await
    }

    pub async fn all_async(&self) -> StoreResult<Vec<V>> {
        let list = self.clone();
        run_blocking(move || list.all()).await
    }
}

// ============================================================================
// Named collections
// ============================================================================

/// Handle to the fleet's named collections.
///
/// Cloning is cheap; every clone talks to the same backend.
#[derive(Clone)]
pub struct SharedState {
    backend: Arc<dyn StoreBackend>,
    codec: Arc<Codec>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").finish_non_exhaustive()
    }
}

impl SharedState {
    pub fn new(backend: Arc<dyn StoreBackend>, codec: Arc<Codec>) -> Self {
        Self { backend, codec }
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn map<K: Storable, V: Storable>(&self, name: &str) -> StoreMap<K, V> {
        StoreMap::new(name, self.backend.clone(), self.codec.clone())
    }

    pub fn map_cache<K: Storable, V: Storable>(&self, name: &str) -> StoreMapCache<K, V> {
        StoreMapCache::new(name, self.backend.clone(), self.codec.clone())
    }

    pub fn list<V: Storable>(&self, name: &str) -> StoreList<V> {
        StoreList::new(name, self.backend.clone(), self.codec.clone())
    }

    /// Self-reported server records keyed by instance id.
    pub fn servers(&self) -> StoreMap<String, ServerRecord> {
        self.map(SERVERS_MAP)
    }

    pub fn sessions(&self) -> StoreMap<SessionId, SessionRecord> {
        self.map(SESSIONS_MAP)
    }

    pub fn resources(&self) -> StoreMap<ResourceId, ResourceRecord> {
        self.map(RESOURCES_MAP)
    }

    pub fn economy(&self) -> StoreMap<SessionId, EconomyRecord> {
        self.map(ECONOMY_MAP)
    }

    /// Externally fetched profiles, stored with a time-to-live.
    pub fn profiles(&self) -> StoreMapCache<SessionId, ProfileRecord> {
        self.map_cache(PROFILES_MAP)
    }

    /// Who each session last messaged, for reply routing.
    pub fn message_targets(&self) -> StoreMapCache<SessionId, SessionId> {
        self.map_cache(MESSAGE_TARGETS_MAP)
    }

    /// Pending invitations into one resource.
    pub fn invites_for(&self, resource: ResourceId) -> StoreList<SessionId> {
        self.list(&format!("invites:{}", resource))
    }

    pub async fn get_server(&self, id: &str) -> StoreResult<Option<ServerRecord>> {
        self.servers().get_async(id.to_string()).await
    }

    /// Removes a resource record together with its pending invitations.
    pub async fn delete_resource(&self, id: ResourceId) -> StoreResult<Option<ResourceRecord>> {
        let removed = self.resources().remove_async(id).await?;
        let invites = self.invites_for(id);
        run_blocking(move || invites.clear()).await?;
        Ok(removed)
    }
}
