//! Small time-bounded cache shared through application state.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Entries older than the TTL behave as absent and are dropped on access.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed() < self.ttl)?;
        if fresh {
            entries.get(key).map(|entry| entry.value.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.entries.lock().insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn expire(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|entry| entry.value)
    }

    /// Drops every stale entry and returns how many went.
    pub fn purge(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Purges `cache` once per TTL so keys that are never read again do not
/// pile up. The task ends once the last strong reference is dropped.
pub fn spawn_purge<K, V>(cache: &Arc<TtlCache<K, V>>, name: &'static str) -> JoinHandle<()>
where
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    let period = cache.ttl();
    let cache: Weak<TtlCache<K, V>> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let dropped = cache.purge();
            if dropped > 0 {
                debug!(cache = name, dropped, "purged stale cache entries");
            }
        }
    })
}
