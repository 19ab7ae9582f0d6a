//! Registry of key ranges currently claimed by range-scoped jobs.

use std::sync::RwLock;

use rk_common::KeyRange;

/// Tracks the ranges registered by running balance-range jobs so other
/// schedulers can steer around them.
#[derive(Debug, Default)]
pub struct KeyRangeManager {
    ranges: RwLock<Vec<KeyRange>>,
}

impl KeyRangeManager {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the ranges of a job entering Running.
    pub fn append(&self, ranges: &[KeyRange]) {
        self.ranges
            .write()
            .expect("key range lock")
            .extend_from_slice(ranges);
    }

    /// Deregisters the ranges of a completed job.
    pub fn delete(&self, ranges: &[KeyRange]) {
        let mut held = self.ranges.write().expect("key range lock");
        held.retain(|r| !ranges.contains(r));
    }

    /// Snapshot of every registered range.
    pub fn list(&self) -> Vec<KeyRange> {
        self.ranges.read().expect("key range lock").clone()
    }

    /// Whether `key` falls inside any registered range.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.ranges
            .read()
            .expect("key range lock")
            .iter()
            .any(|r| r.contains(key))
    }
}
