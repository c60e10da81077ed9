//! Redis store backend shared by every process of the fleet.
//!
//! Layout under the configured key prefix:
//!
//! - `{prefix}:map:{name}` hash of key -> value
//! - `{prefix}:map:{name}:expiry` sorted set of key -> deadline (unix millis)
//! - `{prefix}:list:{name}` list
//! - `{prefix}:topic:{channel}` pub/sub channel
//!
//! Expired hash fields are removed lazily by the next operation on their map.

use super::{StoreBackend, Subscription};
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use redis::{Client, Connection, RedisError, Script};
use std::collections::HashMap;
use std::sync::mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;
const SUBSCRIBER_POLL: Duration = Duration::from_secs(1);
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const PURGE_EXPIRED: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, field in ipairs(expired) do
    redis.call('HDEL', KEYS[1], field)
end
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
return #expired
";

const INSERT_ABSENT: &str = r"
local deadline = redis.call('ZSCORE', KEYS[2], ARGV[1])
if deadline and tonumber(deadline) <= tonumber(ARGV[3]) then
    redis.call('HDEL', KEYS[1], ARGV[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
end
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
    return ARGV[2]
end
return redis.call('HGET', KEYS[1], ARGV[1])
";

fn unavailable(error: RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Hashes, lists and pub/sub on one Redis server.
///
/// Commands share a single connection that is re-established on the next
/// call after an I/O failure. Each subscription holds its own connection on a
/// dedicated thread.
///
/// `compute_if_absent` is atomic on the server: every process observes the
/// same stored value, but factories racing in different processes may each
/// run once.
pub struct RedisBackend {
    client: Client,
    connection: Mutex<Option<Connection>>,
    prefix: String,
    purge_expired: Script,
    insert_absent: Script,
    topic_capacity: usize,
}

impl RedisBackend {
    /// Parses `url` and prepares the client. No connection is made until the
    /// first operation.
    pub fn open(url: &str, prefix: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            prefix: prefix.to_string(),
            purge_expired: Script::new(PURGE_EXPIRED),
            insert_absent: Script::new(INSERT_ABSENT),
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
        })
    }

    /// Connects right away, so a bad address fails at startup.
    pub fn connect(url: &str, prefix: &str) -> StoreResult<Self> {
        let backend = Self::open(url, prefix)?;
        backend.with_connection(|connection| redis::cmd("PING").query::<String>(connection))?;
        info!("🔌 Connected to store at {}", url);
        Ok(backend)
    }

    fn map_key(&self, name: &str) -> String {
        format!("{}:map:{}", self.prefix, name)
    }

    fn expiry_key(&self, name: &str) -> String {
        format!("{}:map:{}:expiry", self.prefix, name)
    }

    fn list_key(&self, name: &str) -> String {
        format!("{}:list:{}", self.prefix, name)
    }

    fn topic_key(&self, channel: &str) -> String {
        format!("{}:topic:{}", self.prefix, channel)
    }

    fn with_connection<R>(
        &self,
        call: impl FnOnce(&mut Connection) -> redis::RedisResult<R>,
    ) -> StoreResult<R> {
        let mut slot = self.connection.lock();
        if slot.is_none() {
            let connection = self
                .client
                .get_connection_with_timeout(CONNECT_TIMEOUT)
                .map_err(unavailable)?;
            *slot = Some(connection);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(StoreError::Unavailable("no store connection".to_string()));
        };

        match call(connection) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    debug!("Dropping store connection after: {}", e);
                    *slot = None;
                }
                Err(unavailable(e))
            }
        }
    }

    /// Runs `call` after the map's expired fields are gone.
    fn with_live_map<R>(
        &self,
        map: &str,
        call: impl FnOnce(&mut Connection, &str) -> redis::RedisResult<R>,
    ) -> StoreResult<R> {
        let hash = self.map_key(map);
        let expiry = self.expiry_key(map);
        self.with_connection(|connection| {
            let purged: usize = self
                .purge_expired
                .key(&hash)
                .key(&expiry)
                .arg(now_millis())
                .invoke(connection)?;
            if purged > 0 {
                trace!("Dropped {} expired entries from '{}'", purged, map);
            }
            call(connection, &hash)
        })
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .field("connected", &self.connection.lock().is_some())
            .finish()
    }
}

impl StoreBackend for RedisBackend {
    fn get(&self, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.with_live_map(map, |connection, hash| {
            redis::cmd("HGET").arg(hash).arg(key).query(connection)
        })
    }

    fn put(&self, map: &str, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        let hash = self.map_key(map);
        let expiry = self.expiry_key(map);
        self.with_connection(|connection| {
            redis::pipe()
                .atomic()
                .cmd("HSET").arg(&hash).arg(&key).arg(&value).ignore()
                .cmd("ZREM").arg(&expiry).arg(&key).ignore()
                .query(connection)
        })
    }

    fn put_with_ttl(&self, map: &str, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let hash = self.map_key(map);
        let expiry = self.expiry_key(map);
        let deadline = now_millis().saturating_add(ttl.as_millis() as u64);
        self.with_connection(|connection| {
            redis::pipe()
                .atomic()
                .cmd("HSET").arg(&hash).arg(&key).arg(&value).ignore()
                .cmd("ZADD").arg(&expiry).arg(deadline).arg(&key).ignore()
                .query(connection)
        })
    }

    fn remove(&self, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let expiry = self.expiry_key(map);
        self.with_live_map(map, |connection, hash| {
            let (previous, _, _): (Option<Vec<u8>>, i64, i64) = redis::pipe()
                .atomic()
                .cmd("HGET").arg(hash).arg(key)
                .cmd("HDEL").arg(hash).arg(key)
                .cmd("ZREM").arg(&expiry).arg(key)
                .query(connection)?;
            Ok(previous)
        })
    }

    fn contains(&self, map: &str, key: &[u8]) -> StoreResult<bool> {
        self.with_live_map(map, |connection, hash| {
            redis::cmd("HEXISTS").arg(hash).arg(key).query(connection)
        })
    }

    fn entries(&self, map: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let all: HashMap<Vec<u8>, Vec<u8>> = self.with_live_map(map, |connection, hash| {
            redis::cmd("HGETALL").arg(hash).query(connection)
        })?;
        Ok(all.into_iter().collect())
    }

    fn len(&self, map: &str) -> StoreResult<usize> {
        self.with_live_map(map, |connection, hash| {
            redis::cmd("HLEN").arg(hash).query(connection)
        })
    }

    fn compute_if_absent(
        &self,
        map: &str,
        key: Vec<u8>,
        factory: Box<dyn FnOnce() -> StoreResult<Vec<u8>> + Send + '_>,
    ) -> StoreResult<Vec<u8>> {
        if let Some(existing) = self.get(map, &key)? {
            return Ok(existing);
        }

        // The factory may itself use the store, so no connection is held here
        let candidate = factory()?;
        let hash = self.map_key(map);
        let expiry = self.expiry_key(map);
        self.with_connection(|connection| {
            self.insert_absent
                .key(&hash)
                .key(&expiry)
                .arg(&key)
                .arg(&candidate)
                .arg(now_millis())
                .invoke(connection)
        })
    }

    fn clear(&self, map: &str) -> StoreResult<()> {
        let hash = self.map_key(map);
        let expiry = self.expiry_key(map);
        self.with_connection(|connection| {
            redis::cmd("DEL").arg(&hash).arg(&expiry).query(connection)
        })
    }

    fn list_push(&self, list: &str, value: Vec<u8>) -> StoreResult<usize> {
        let key = self.list_key(list);
        self.with_connection(|connection| {
            redis::cmd("RPUSH").arg(&key).arg(&value).query(connection)
        })
    }

    fn list_range(&self, list: &str) -> StoreResult<Vec<Vec<u8>>> {
        let key = self.list_key(list);
        self.with_connection(|connection| {
            redis::cmd("LRANGE").arg(&key).arg(0).arg(-1).query(connection)
        })
    }

    fn list_remove(&self, list: &str, value: &[u8]) -> StoreResult<bool> {
        let key = self.list_key(list);
        let removed: i64 = self.with_connection(|connection| {
            redis::cmd("LREM").arg(&key).arg(1).arg(value).query(connection)
        })?;
        Ok(removed > 0)
    }

    fn list_len(&self, list: &str) -> StoreResult<usize> {
        let key = self.list_key(list);
        self.with_connection(|connection| redis::cmd("LLEN").arg(&key).query(connection))
    }

    fn list_clear(&self, list: &str) -> StoreResult<()> {
        let key = self.list_key(list);
        self.with_connection(|connection| redis::cmd("DEL").arg(&key).query(connection))
    }

    /// Returns the number of subscribed connections across the fleet.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize> {
        let topic = self.topic_key(channel);
        self.with_connection(|connection| {
            redis::cmd("PUBLISH").arg(&topic).arg(&payload).query(connection)
        })
    }

    fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (sender, receiver) = broadcast::channel(self.topic_capacity);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let client = self.client.clone();
        let topic = self.topic_key(channel);

        std::thread::Builder::new()
            .name(format!("store-sub-{}", channel))
            .spawn(move || run_subscriber(client, topic, sender, ready_tx))
            .map_err(|e| StoreError::Unavailable(format!("subscriber thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| StoreError::Unavailable("subscriber exited before joining".to_string()))??;
        debug!("📡 New subscriber on '{}'", channel);
        Ok(Subscription::new(channel, receiver))
    }
}

enum SubscriberExit {
    Abandoned,
    Lost(RedisError),
}

/// Forwards messages from `topic` until every local receiver is gone.
///
/// The first join is reported through `ready`. Later connection losses are
/// retried for as long as someone is still listening.
fn run_subscriber(
    client: Client,
    topic: String,
    sender: broadcast::Sender<Vec<u8>>,
    ready: mpsc::SyncSender<StoreResult<()>>,
) {
    let mut ready = Some(ready);
    loop {
        let exit = match client.get_connection_with_timeout(CONNECT_TIMEOUT) {
            Ok(mut connection) => forward(&mut connection, &topic, &sender, &mut ready),
            Err(e) => SubscriberExit::Lost(e),
        };

        match exit {
            SubscriberExit::Abandoned => {
                trace!("Last receiver of '{}' dropped", topic);
                return;
            }
            SubscriberExit::Lost(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(unavailable(e)));
                    return;
                }
                if sender.receiver_count() == 0 {
                    return;
                }
                warn!("⚠️ Subscription to '{}' lost, rejoining: {}", topic, e);
                std::thread::sleep(RESUBSCRIBE_DELAY);
            }
        }
    }
}

fn forward(
    connection: &mut Connection,
    topic: &str,
    sender: &broadcast::Sender<Vec<u8>>,
    ready: &mut Option<mpsc::SyncSender<StoreResult<()>>>,
) -> SubscriberExit {
    let mut pubsub = connection.as_pubsub();
    if let Err(e) = pubsub.subscribe(topic) {
        return SubscriberExit::Lost(e);
    }
    if let Err(e) = pubsub.set_read_timeout(Some(SUBSCRIBER_POLL)) {
        return SubscriberExit::Lost(e);
    }
    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }

    loop {
        match pubsub.get_message() {
            Ok(message) => match message.get_payload::<Vec<u8>>() {
                Ok(payload) => {
                    if sender.send(payload).is_err() {
                        return SubscriberExit::Abandoned;
                    }
                }
                Err(e) => warn!("Unreadable message on '{}': {}", topic, e),
            },
            Err(e) if e.is_timeout() => {
                if sender.receiver_count() == 0 {
                    return SubscriberExit::Abandoned;
                }
            }
            Err(e) => return SubscriberExit::Lost(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let backend = RedisBackend::open("redis://127.0.0.1:6379/", "fleet").unwrap();
        assert_eq!(backend.map_key("sessions"), "fleet:map:sessions");
        assert_eq!(backend.expiry_key("sessions"), "fleet:map:sessions:expiry");
        assert_eq!(backend.list_key("invites:1"), "fleet:list:invites:1");
        assert_eq!(backend.topic_key("fleet.placement"), "fleet:topic:fleet.placement");
    }

    #[test]
    fn test_bad_url_is_unavailable() {
        let err = RedisBackend::open("not a url", "fleet").unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_unreachable_server_is_unavailable() {
        let backend = RedisBackend::open("redis://127.0.0.1:1/", "fleet").unwrap();
        assert!(matches!(
            backend.get("sessions", b"k"),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            backend.subscribe("anything"),
            Err(StoreError::Unavailable(_))
        ));
    }

    /// Needs a server on `FLEET_TEST_REDIS` (default `redis://127.0.0.1:6379/`).
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore]
    async fn test_against_live_server() {
        use crate::store::Delivery;

        let url = std::env::var("FLEET_TEST_REDIS")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let prefix = format!("fleet-test-{}", uuid::Uuid::new_v4());
        let backend = RedisBackend::connect(&url, &prefix).unwrap();

        backend.put("sessions", b"a".to_vec(), b"1".to_vec()).unwrap();
        backend
            .put_with_ttl("sessions", b"b".to_vec(), b"2".to_vec(), Duration::from_millis(50))
            .unwrap();
        assert_eq!(backend.len("sessions").unwrap(), 2);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(backend.get("sessions", b"b").unwrap(), None);
        assert_eq!(backend.len("sessions").unwrap(), 1);

        let kept = backend
            .compute_if_absent(
                "sessions",
                b"a".to_vec(),
                Box::new(|| -> StoreResult<Vec<u8>> { panic!("factory must not run") }),
            )
            .unwrap();
        assert_eq!(kept, b"1".to_vec());
        assert_eq!(backend.remove("sessions", b"a").unwrap(), Some(b"1".to_vec()));

        assert_eq!(backend.list_push("invites", b"x".to_vec()).unwrap(), 1);
        assert!(backend.list_remove("invites", b"x").unwrap());
        assert_eq!(backend.list_len("invites").unwrap(), 0);

        let mut subscription = backend.subscribe("alpha").unwrap();
        assert_eq!(backend.publish("alpha", b"hello".to_vec()).unwrap(), 1);
        match tokio::time::timeout(Duration::from_secs(2), subscription.recv()).await {
            Ok(Some(Delivery::Message(bytes))) => assert_eq!(bytes, b"hello".to_vec()),
            other => panic!("unexpected delivery: {:?}", other),
        }

        backend.clear("sessions").unwrap();
    }
}
