//! In-process store backend.
//!
//! One `Arc<MemoryBackend>` shared between several nodes behaves like the
//! externally visible store: every node reads and writes the same maps, lists
//! and topics.

use super::{StoreBackend, Subscription};
use crate::error::StoreResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

type Map = DashMap<Vec<u8>, StoredValue>;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn persistent(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            expires_at: None,
        }
    }

    fn expiring(bytes: Vec<u8>, ttl: Duration) -> Self {
        Self {
            bytes,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// DashMap-backed maps and lists plus broadcast topics.
///
/// Expired entries are dropped lazily when they are next touched.
pub struct MemoryBackend {
    maps: DashMap<String, Arc<Map>>,
    lists: DashMap<String, Vec<Vec<u8>>>,
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    topic_capacity: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_topic_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Backend whose topics buffer at most `capacity` undelivered messages
    /// per subscriber before the slowest one starts losing messages.
    pub fn with_topic_capacity(capacity: usize) -> Self {
        Self {
            maps: DashMap::new(),
            lists: DashMap::new(),
            topics: DashMap::new(),
            topic_capacity: capacity.max(1),
        }
    }

    fn map(&self, name: &str) -> Arc<Map> {
        if let Some(map) = self.maps.get(name) {
            return map.clone();
        }
        self.maps.entry(name.to_string()).or_default().clone()
    }

    fn existing_map(&self, name: &str) -> Option<Arc<Map>> {
        self.maps.get(name).map(|map| map.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("maps", &self.maps.len())
            .field("lists", &self.lists.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let Some(map) = self.existing_map(map) else {
            return Ok(None);
        };
        let now = Instant::now();

        let expired = match map.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.bytes.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            map.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(None)
    }

    fn put(&self, map: &str, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        self.map(map).insert(key, StoredValue::persistent(value));
        Ok(())
    }

    fn put_with_ttl(&self, map: &str, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.map(map).insert(key, StoredValue::expiring(value, ttl));
        Ok(())
    }

    fn remove(&self, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let Some(map) = self.existing_map(map) else {
            return Ok(None);
        };
        let now = Instant::now();
        Ok(map
            .remove(key)
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(_, entry)| entry.bytes))
    }

    fn contains(&self, map: &str, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(map, key)?.is_some())
    }

    fn entries(&self, map: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(map) = self.existing_map(map) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        map.retain(|_, entry| entry.is_live(now));
        Ok(map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().bytes.clone()))
            .collect())
    }

    fn len(&self, map: &str) -> StoreResult<usize> {
        let Some(map) = self.existing_map(map) else {
            return Ok(0);
        };
        let now = Instant::now();
        map.retain(|_, entry| entry.is_live(now));
        Ok(map.len())
    }

    fn compute_if_absent(
        &self,
        map: &str,
        key: Vec<u8>,
        factory: Box<dyn FnOnce() -> StoreResult<Vec<u8>> + Send + '_>,
    ) -> StoreResult<Vec<u8>> {
        let map = self.map(map);
        let now = Instant::now();

        // The shard stays write-locked until the new value is in place.
        let outcome = match map.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(occupied.get().bytes.clone());
                }
                let bytes = factory()?;
                occupied.insert(StoredValue::persistent(bytes.clone()));
                Ok(bytes)
            }
            Entry::Vacant(vacant) => {
                let bytes = factory()?;
                vacant.insert(StoredValue::persistent(bytes.clone()));
                Ok(bytes)
            }
        };
        outcome
    }

    fn clear(&self, map: &str) -> StoreResult<()> {
        if let Some(map) = self.existing_map(map) {
            map.clear();
        }
        Ok(())
    }

    fn list_push(&self, list: &str, value: Vec<u8>) -> StoreResult<usize> {
        let mut items = self.lists.entry(list.to_string()).or_default();
        items.push(value);
        Ok(items.len())
    }

    fn list_range(&self, list: &str) -> StoreResult<Vec<Vec<u8>>> {
        Ok(self
            .lists
            .get(list)
            .map(|items| items.clone())
            .unwrap_or_default())
    }

    fn list_remove(&self, list: &str, value: &[u8]) -> StoreResult<bool> {
        let Some(mut items) = self.lists.get_mut(list) else {
            return Ok(false);
        };
        match items.iter().position(|item| item.as_slice() == value) {
            Some(index) => {
                items.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_len(&self, list: &str) -> StoreResult<usize> {
        Ok(self.lists.get(list).map_or(0, |items| items.len()))
    }

    fn list_clear(&self, list: &str) -> StoreResult<()> {
        self.lists.remove(list);
        Ok(())
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize> {
        let Some(sender) = self.topics.get(channel).map(|sender| sender.clone()) else {
            trace!("No subscribers ever joined '{}', dropping message", channel);
            return Ok(0);
        };
        // Err only means nobody is listening right now
        Ok(sender.send(payload).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let receiver = self
            .topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.topic_capacity).0)
            .subscribe();
        debug!("📡 New subscriber on '{}'", channel);
        Ok(Subscription::new(channel, receiver))
    }
}
