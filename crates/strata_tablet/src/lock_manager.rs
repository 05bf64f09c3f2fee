//! Per-row locks keyed by encoded primary key.
//!
//! Locks are always acquired in sorted key order, so two writers contending
//! on overlapping key sets cannot deadlock. A guard holds its keys until
//! dropped at transaction finish.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug)]
pub struct LockManager {
    held: Mutex<HashSet<Vec<u8>>>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire every key, blocking until all are free. Keys are sorted and
    /// deduplicated before acquisition.
    pub fn acquire(manager: &Arc<LockManager>, mut keys: Vec<Vec<u8>>) -> RowLocks {
        keys.sort();
        keys.dedup();
        let mut held = manager.held.lock().unwrap();
        for key in &keys {
            while held.contains(key) {
                held = manager.released.wait(held).unwrap();
            }
            held.insert(key.clone());
        }
        RowLocks {
            manager: Arc::clone(manager),
            keys,
        }
    }

    pub fn locked_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

/// Guard over a sorted set of row locks; dropping it releases them all.
pub struct RowLocks {
    manager: Arc<LockManager>,
    keys: Vec<Vec<u8>>,
}

impl RowLocks {
    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }
}

impl Drop for RowLocks {
    fn drop(&mut self) {
        let mut held = self.manager.held.lock().unwrap();
        for key in &self.keys {
            held.remove(key);
        }
        self.manager.released.notify_all();
    }
}
