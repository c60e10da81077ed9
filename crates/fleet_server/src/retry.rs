//! Per-key retry suppression.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Fixed-capacity table of keys that recently started an attempt.
///
/// A key may start a new attempt once `window` has passed since its last
/// accepted one. Check and insert happen under one lock. Stale entries are
/// only evicted when touched or when the table fills up; a table full of live
/// entries suppresses every new key.
#[derive(Debug)]
pub struct RetryWindow<K> {
    window: Duration,
    capacity: usize,
    entries: Mutex<HashMap<K, Instant>>,
}

impl<K> RetryWindow<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` and records the attempt if `key` is outside its window.
    pub fn try_acquire(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key).copied() {
            Some(expires_at) if expires_at > now => return false,
            Some(_) => {
                entries.remove(key);
            }
            None => {}
        }

        if entries.len() >= self.capacity {
            entries.retain(|_, expires_at| *expires_at > now);
            if entries.len() >= self.capacity {
                warn!(
                    "Retry table full ({} live entries), suppressing attempt for {:?}",
                    entries.len(),
                    key
                );
                return false;
            }
        }

        entries.insert(key.clone(), now + self.window);
        true
    }

    /// Number of entries currently held, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_inside_window_is_suppressed() {
        let retries = RetryWindow::new(Duration::from_secs(2), 16);

        assert!(retries.try_acquire(&"alex"));
        assert!(!retries.try_acquire(&"alex"));
        assert!(retries.try_acquire(&"sam"));

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(!retries.try_acquire(&"alex"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(retries.try_acquire(&"alex"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_table_suppresses_until_entries_expire() {
        let retries = RetryWindow::new(Duration::from_secs(2), 2);

        assert!(retries.try_acquire(&1));
        assert!(retries.try_acquire(&2));
        assert!(!retries.try_acquire(&3));
        assert_eq!(retries.len(), 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(retries.try_acquire(&3));
        assert_eq!(retries.len(), 1);
    }
}
