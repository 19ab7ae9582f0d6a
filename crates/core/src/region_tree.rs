//! Interval index over regions, keyed by start key.
//!
//! The tree holds non-overlapping half-open ranges; inserting a newcomer
//! first evicts every stored region it overlaps (several at once after a
//! merge). A total-approximate-size counter is maintained alongside, under
//! the same lock as the tree itself.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rk_common::KeyRange;

use crate::region::RegionInfo;

/// Interval tree over regions.
#[derive(Debug, Default)]
pub struct RegionTree {
    items: BTreeMap<Vec<u8>, Arc<RegionInfo>>,
    total_size: u64,
}

impl RegionTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions in the tree.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the tree holds no regions.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the approximate sizes of every contained region.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Inserts `region`, evicting and returning every stored region its
    /// range overlaps.
    pub fn insert(&mut self, region: Arc<RegionInfo>) -> Vec<Arc<RegionInfo>> {
        let evicted = self.overlaps(region.start_key(), region.end_key());
        for old in &evicted {
            self.items.remove(old.start_key());
            self.total_size = self.total_size.saturating_sub(old.approximate_size);
        }
        self.total_size += region.approximate_size;
        self.items.insert(region.start_key().to_vec(), region);
        evicted
    }

    /// Removes `region` when the stored entry at its start key is the same
    /// region (by id). Returns whether anything was removed.
    pub fn remove(&mut self, region: &RegionInfo) -> bool {
        match self.items.get(region.start_key()) {
            Some(stored) if stored.id() == region.id() => {
                let stored = self.items.remove(region.start_key()).expect("checked entry");
                self.total_size = self.total_size.saturating_sub(stored.approximate_size);
                true
            }
            _ => false,
        }
    }

    /// The region containing `key`, if any.
    pub fn find(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let (_, candidate) = self.items.range(..=key.to_vec()).next_back()?;
        if candidate.contains_key(key) {
            Some(candidate.clone())
        } else {
            None
        }
    }

    /// The region immediately before the one containing (or following) `key`.
    pub fn prev(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let anchor: &[u8] = match self.find(key) {
            Some(region) => {
                let start = region.start_key().to_vec();
                return self
                    .items
                    .range(..start.clone())
                    .next_back()
                    .map(|(_, r)| r.clone());
            }
            None => key,
        };
        self.items
            .range(..anchor.to_vec())
            .next_back()
            .map(|(_, r)| r.clone())
    }

    /// Every stored region overlapping `[start, end)`, in key order.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> Vec<Arc<RegionInfo>> {
        let mut out = Vec::new();
        if let Some((_, candidate)) = self.items.range(..=start.to_vec()).next_back() {
            if candidate.overlaps(start, end) {
                out.push(candidate.clone());
            }
        }
        for (item_start, region) in self
            .items
            .range((Excluded(start.to_vec()), Unbounded))
        {
            if !end.is_empty() && item_start.as_slice() >= end {
                break;
            }
            out.push(region.clone());
        }
        out
    }

    /// Scans regions from the one containing `start_key` (or the next one),
    /// up to `limit` entries; `limit` 0 means unbounded.
    pub fn scan(&self, start_key: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        let anchor = match self.find(start_key) {
            Some(region) => region.start_key().to_vec(),
            None => start_key.to_vec(),
        };
        let mut out = Vec::new();
        for (_, region) in self.items.range(anchor.clone()..) {
            if limit > 0 && out.len() >= limit {
                break;
            }
            out.push(region.clone());
        }
        out
    }

    /// Uniformly samples up to `n` distinct regions whose ranges intersect
    /// the supplied key ranges (no ranges = the whole domain).
    ///
    /// Candidates are materialized by walking the overlapping nodes, so the
    /// draw is uniform regardless of tree shape.
    pub fn random_regions(&self, n: usize, ranges: &[KeyRange]) -> Vec<Arc<RegionInfo>> {
        if n == 0 || self.items.is_empty() {
            return Vec::new();
        }
        let mut candidates: Vec<Arc<RegionInfo>> = if ranges.is_empty() {
            self.items.values().cloned().collect()
        } else {
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for range in ranges {
                for region in self.overlaps(&range.start_key, &range.end_key) {
                    if seen.insert(region.id()) {
                        out.push(region);
                    }
                }
            }
            out
        };
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(n);
        candidates
    }

    /// Uniformly samples one region intersecting the supplied ranges.
    pub fn random_region(&self, ranges: &[KeyRange]) -> Option<Arc<RegionInfo>> {
        self.random_regions(1, ranges).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, RegionEpoch, RegionMeta};

    fn region(id: u64, start: &[u8], end: &[u8], size: u64) -> Arc<RegionInfo> {
        let peer = Peer::voter(id * 10, 1);
        let mut info = RegionInfo::new(
            RegionMeta {
                id,
                start_key: start.to_vec(),
                end_key: end.to_vec(),
                epoch: RegionEpoch::new(1, 1),
                peers: vec![peer],
            },
            Some(peer),
        );
        info.approximate_size = size;
        Arc::new(info)
    }

    fn populated() -> RegionTree {
        let mut tree = RegionTree::new();
        tree.insert(region(1, b"", b"g", 10));
        tree.insert(region(2, b"g", b"n", 20));
        tree.insert(region(3, b"n", b"t", 30));
        tree.insert(region(4, b"t", b"", 40));
        tree
    }

    #[test]
    fn point_lookup_and_neighbors() {
        let tree = populated();
        assert_eq!(tree.find(b"a").unwrap().id(), 1);
        assert_eq!(tree.find(b"g").unwrap().id(), 2);
        assert_eq!(tree.find(b"zzz").unwrap().id(), 4);

        assert!(tree.prev(b"a").is_none());
        assert_eq!(tree.prev(b"h").unwrap().id(), 1);
        assert_eq!(tree.prev(b"zzz").unwrap().id(), 3);
    }

    #[test]
    fn insert_evicts_every_overlap() {
        let mut tree = populated();
        // One newcomer spanning two stored regions replaces both.
        let evicted = tree.insert(region(5, b"g", b"t", 60));
        let mut evicted_ids: Vec<u64> = evicted.iter().map(|r| r.id()).collect();
        evicted_ids.sort_unstable();
        assert_eq!(evicted_ids, vec![2, 3]);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.find(b"h").unwrap().id(), 5);
        assert_eq!(tree.total_size(), 10 + 60 + 40);
    }

    #[test]
    fn partial_overlap_evicts_the_touched_region() {
        let mut tree = populated();
        let evicted = tree.insert(region(6, b"a", b"c", 5));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), 1);
        // The evicted remainder is gone; the key space before "a" is
        // uncovered until the next heartbeat reports it.
        assert!(tree.find(b"0").is_none());
        assert_eq!(tree.find(b"b").unwrap().id(), 6);
    }

    #[test]
    fn scan_covers_every_region_exactly_once() {
        let tree = populated();
        let all = tree.scan(b"", 0);
        assert_eq!(all.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        let limited = tree.scan(b"h", 2);
        assert_eq!(limited.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn total_size_tracks_inserts_and_removes() {
        let mut tree = populated();
        assert_eq!(tree.total_size(), 100);
        let r = tree.find(b"g").unwrap();
        assert!(tree.remove(&r));
        assert_eq!(tree.total_size(), 80);
        // Removing a region whose slot was already replaced is a no-op.
        assert!(!tree.remove(&r));
    }

    #[test]
    fn random_region_respects_ranges() {
        let tree = populated();
        for _ in 0..32 {
            let picked = tree
                .random_region(&[KeyRange::new(b"g".to_vec(), b"n".to_vec())])
                .unwrap();
            assert_eq!(picked.id(), 2);
        }
        let picked = tree.random_region(&[KeyRange::new(b"".to_vec(), b"".to_vec())]);
        assert!(picked.is_some());
        assert!(tree.random_region(&[]).is_some());

        let two = tree.random_regions(2, &[KeyRange::new(b"".to_vec(), b"".to_vec())]);
        assert_eq!(two.len(), 2);
        assert_ne!(two[0].id(), two[1].id());
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let tree = RegionTree::new();
        assert!(tree.find(b"a").is_none());
        assert!(tree.random_region(&[]).is_none());
        assert!(tree.scan(b"", 0).is_empty());
    }
}
