//! Async mutexes keyed by value. An entry lives only while some task holds
//! or waits on its lock.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Run `critical` while holding the lock for `key`.
    pub async fn run<F, T>(&self, key: &K, critical: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let out = {
            let _guard = lock.lock().await;
            critical.await
        };
        drop(lock);
        // Clones are only taken under the shard lock, so a count of one
        // means no task holds or waits on this entry.
        self.locks.remove_if(key, |_, l| Arc::strong_count(l) == 1);
        out
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
