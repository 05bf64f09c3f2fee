//! Log anchor registry.
//!
//! Long-running readers and bootstrap pin a log index with a named anchor;
//! the log's GC pass retains everything at or above the minimum live anchor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use strata_util::{Error, Result};

/// Token returned by [`LogAnchorRegistry::register`].
#[derive(Debug)]
pub struct LogAnchor {
    id: u64,
    pub owner: String,
}

#[derive(Debug)]
struct AnchorEntry {
    owner: String,
    log_index: u64,
}

/// Registry of anchors pinning log indexes for one tablet.
#[derive(Default)]
#[derive(Debug)]
pub struct LogAnchorRegistry {
    anchors: Mutex<BTreeMap<u64, AnchorEntry>>,
    next_id: AtomicU64,
}

impl LogAnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `log_index`; the returned anchor must be passed back to
    /// `unregister` when the caller no longer needs the entries.
    pub fn register(&self, log_index: u64, owner: impl Into<String>) -> LogAnchor {
        let owner = owner.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.anchors.lock().unwrap().insert(
            id,
            AnchorEntry {
                owner: owner.clone(),
                log_index,
            },
        );
        LogAnchor { id, owner }
    }

    /// Move an existing anchor to a new index.
    pub fn update(&self, anchor: &LogAnchor, log_index: u64) -> Result<()> {
        let mut anchors = self.anchors.lock().unwrap();
        let entry = anchors.get_mut(&anchor.id).ok_or_else(|| {
            Error::NotFound(format!("anchor {} ({}) not registered", anchor.id, anchor.owner))
        })?;
        entry.log_index = log_index;
        Ok(())
    }

    pub fn unregister(&self, anchor: LogAnchor) -> Result<()> {
        let mut anchors = self.anchors.lock().unwrap();
        anchors.remove(&anchor.id).ok_or_else(|| {
            Error::NotFound(format!("anchor {} ({}) not registered", anchor.id, anchor.owner))
        })?;
        Ok(())
    }

    /// Lowest index any live anchor pins, or None when nothing is anchored.
    pub fn min_anchored_index(&self) -> Option<u64> {
        self.anchors
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.log_index)
            .min()
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_tracks_live_anchors() {
        let registry = LogAnchorRegistry::new();
        assert_eq!(registry.min_anchored_index(), None);

        let a = registry.register(10, "reader-a");
        let b = registry.register(4, "reader-b");
        assert_eq!(registry.min_anchored_index(), Some(4));

        registry.unregister(b).unwrap();
        assert_eq!(registry.min_anchored_index(), Some(10));
        registry.unregister(a).unwrap();
        assert_eq!(registry.min_anchored_index(), None);
    }

    #[test]
    fn update_moves_an_anchor() {
        let registry = LogAnchorRegistry::new();
        let a = registry.register(3, "bootstrap");
        registry.update(&a, 17).unwrap();
        assert_eq!(registry.min_anchored_index(), Some(17));
        registry.unregister(a).unwrap();
    }

    #[test]
    fn double_unregister_is_an_error() {
        let registry = LogAnchorRegistry::new();
        let a = registry.register(1, "x");
        let stale = LogAnchor {
            id: a.id,
            owner: a.owner.clone(),
        };
        registry.unregister(a).unwrap();
        assert!(registry.unregister(stale).is_err());
    }
}
