//! Advisory locks keyed by string id (user ids, incident ids).
//!
//! An entry lives only while someone holds or waits for its lock; the last
//! guard to drop removes it, so the map stays as small as the contention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// A set of named async mutexes.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<StdMutex<LockMap>>,
}

/// Holds one key's lock until dropped.
pub struct KeyedGuard {
    key: String,
    map: Arc<StdMutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;

        KeyedGuard {
            key: key.to_string(),
            map: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Release first so the count below only sees the map and any waiters.
        self.guard.take();

        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}
