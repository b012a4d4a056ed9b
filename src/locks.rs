//! Per-key mutual exclusion
//!
//! Store documents are rewritten whole, so every read-modify-write of one key
//! has to run under that key's lock. Locks for distinct keys are independent.
//!
//! Lock ordering: branch lock, then server-name lock, then IP lock. Never the
//! other way round.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// A set of named mutexes, created on first use and dropped once unused
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`
    pub fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        // Clone the Arc out so the dashmap shard is not held while waiting
        let mutex = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let result = {
            let _guard = mutex.lock();
            f()
        };

        // Only the map and `mutex` hold the entry: nobody is waiting on it.
        // New waiters clone under the shard lock, so this check cannot race.
        self.locks.remove_if(key, |_, entry| {
            Arc::ptr_eq(entry, &mutex) && Arc::strong_count(entry) == 2
        });

        result
    }

    /// Number of keys currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
