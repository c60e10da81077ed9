//! Local read-through cache of resource records.

use fleet_core::{ResourceId, ResourceRecord, StoreMap, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CachedResource {
    record: ResourceRecord,
    loaded_at: Instant,
}

/// Keeps resource records this instance reads often, for at most `ttl`.
///
/// Entries are never refreshed in the background. Deletion must be reported
/// through [`invalidate`](Self::invalidate). A load that was in flight while
/// any invalidation happened is returned but not cached.
#[derive(Debug)]
pub struct ResourceCache {
    resources: StoreMap<ResourceId, ResourceRecord>,
    ttl: Duration,
    entries: Mutex<HashMap<ResourceId, CachedResource>>,
    generation: AtomicU64,
}

impl ResourceCache {
    pub fn new(resources: StoreMap<ResourceId, ResourceRecord>, ttl: Duration) -> Self {
        Self {
            resources,
            ttl,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }


    fn cached(&self, id: &ResourceId) -> Option<ResourceRecord> {
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(id)
            .map(|entry| (entry.loaded_at.elapsed() < self.ttl).then(|| entry.record.clone()));
        match fresh {
            Some(Some(record)) => Some(record),
            Some(None) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Returns the record, loading it from the store on a miss.
    pub async fn get(&self, id: ResourceId) -> StoreResult<Option<ResourceRecord>> {
        if let Some(record) = self.cached(&id) {
            trace!("Resource cache hit for {}", id);
            return Ok(Some(record));
        }

        let generation = self.generation.load(Ordering::Acquire);
        let loaded = self.resources.get_async(id).await?;
        if let Some(record) = &loaded {
            let mut entries = self.entries.lock();
            if self.generation.load(Ordering::Acquire) == generation {
                entries.insert(
                    id,
                    CachedResource {
                        record: record.clone(),
                        loaded_at: Instant::now(),
                    },
                );
            } else {
                trace!("Not caching {}, invalidated while loading", id);
            }
        }
        Ok(loaded)
    }

    /// Drops the local copy. Returns whether one was held.
    pub fn invalidate(&self, id: &ResourceId) -> bool {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = entries.remove(id).is_some();
        drop(entries);
        if removed {
            debug!("Invalidated cached resource {}", id);
        }
        removed
    }

    /// Records `server_id` as the instance hosting the resource.
    ///
    /// Returns `false` when the record no longer exists.
    pub async fn claim_host(&self, id: ResourceId, server_id: &str) -> StoreResult<bool> {
        let Some(mut record) = self.resources.get_async(id).await? else {
            return Ok(false);
        };
        if record.host_instance_id.as_deref() != Some(server_id) {
            record.host_instance_id = Some(server_id.to_string());
            self.resources.put_async(id, record).await?;
        }
        self.invalidate(&id);
        Ok(true)
    }

    /// Clears the resource's host if it is still `server_id`.
    ///
    /// Returns whether the stored record was changed.
    pub async fn release_host(&self, id: ResourceId, server_id: &str) -> StoreResult<bool> {
        let record = self.resources.get_async(id).await?;
        self.invalidate(&id);
        let Some(mut record) = record else {
            return Ok(false);
        };
        if record.host_instance_id.as_deref() != Some(server_id) {
            return Ok(false);
        }
        record.host_instance_id = None;
        self.resources.put_async(id, record).await?;
        Ok(true)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.cached(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
