//! The cluster state store: stores by id, regions in an interval tree with
//! role indexes, and the heartbeat reconciliation that keeps them coherent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rk_common::{KeyRange, Result, RkError};
use tracing::{debug, info};

use crate::region::RegionInfo;
use crate::region_tree::RegionTree;
use crate::store::{validate_labels, StoreInfo, StoreMeta, StoreState, StoreStats};

/// Outcome of reconciling one region heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The report superseded the stored geometry; the listed region ids
    /// were evicted from the tree.
    Updated {
        /// Ids of regions removed while inserting the newcomer.
        evicted: Vec<u64>,
    },
    /// Same epoch; only mutable statistics were refreshed.
    StatsUpdated,
    /// Older epoch; ignored, but the stream still replies.
    Stale,
}

/// Replica role used by range-scoped counting and sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRole {
    /// Regions led from the store.
    Leader,
    /// Regions with a non-leader voter on the store.
    Follower,
    /// Regions with a learner on the store.
    Learner,
}

#[derive(Default)]
struct RegionIndex {
    tree: RegionTree,
    by_id: HashMap<u64, Arc<RegionInfo>>,
    leaders: HashMap<u64, HashSet<u64>>,
    followers: HashMap<u64, HashSet<u64>>,
    learners: HashMap<u64, HashSet<u64>>,
}

impl RegionIndex {
    fn unindex(&mut self, region: &RegionInfo) {
        self.by_id.remove(&region.id());
        for set in self.leaders.values_mut() {
            set.remove(&region.id());
        }
        for set in self.followers.values_mut() {
            set.remove(&region.id());
        }
        for set in self.learners.values_mut() {
            set.remove(&region.id());
        }
    }

    fn index(&mut self, region: &Arc<RegionInfo>) {
        self.by_id.insert(region.id(), region.clone());
        if let Some(leader_store) = region.leader_store_id() {
            self.leaders
                .entry(leader_store)
                .or_default()
                .insert(region.id());
        }
        for peer in region.followers() {
            self.followers
                .entry(peer.store_id)
                .or_default()
                .insert(region.id());
        }
        for peer in region.learners() {
            self.learners
                .entry(peer.store_id)
                .or_default()
                .insert(region.id());
        }
    }

    fn replace(&mut self, region: Arc<RegionInfo>) -> Vec<u64> {
        if let Some(origin) = self.by_id.get(&region.id()).cloned() {
            if origin.start_key() != region.start_key() {
                self.tree.remove(&origin);
            }
            self.unindex(&origin);
        }
        let evicted = self.tree.insert(region.clone());
        let mut evicted_ids = Vec::with_capacity(evicted.len());
        for old in evicted {
            if old.id() != region.id() {
                evicted_ids.push(old.id());
            }
            self.unindex(&old);
        }
        self.index(&region);
        evicted_ids
    }

    fn role_set(&self, store_id: u64, role: RegionRole) -> Option<&HashSet<u64>> {
        match role {
            RegionRole::Leader => self.leaders.get(&store_id),
            RegionRole::Follower => self.followers.get(&store_id),
            RegionRole::Learner => self.learners.get(&store_id),
        }
    }
}

/// In-memory registry of stores and regions.
///
/// The registry exclusively owns both object families; readers get cheap
/// `Arc` snapshots, writers replace whole records under short write locks.
pub struct BasicCluster {
    placement_rules_enabled: bool,
    stores: RwLock<HashMap<u64, StoreInfo>>,
    regions: RwLock<RegionIndex>,
}

impl BasicCluster {
    /// An empty registry.
    pub fn new(placement_rules_enabled: bool) -> Self {
        Self {
            placement_rules_enabled,
            stores: RwLock::new(HashMap::new()),
            regions: RwLock::new(RegionIndex::default()),
        }
    }

    // ---- stores ----

    /// Validates and upserts a store meta record.
    ///
    /// Re-upping a tombstoned store is rejected; runtime statistics survive
    /// a meta update.
    pub fn put_meta_store(&self, meta: StoreMeta) -> Result<()> {
        validate_labels(&meta.labels, self.placement_rules_enabled)
            .map_err(RkError::InvalidValue)?;
        let mut stores = self.stores.write().expect("stores lock");
        if let Some(existing) = stores.get_mut(&meta.id) {
            if existing.is_tombstone() && meta.state != StoreState::Tombstone {
                return Err(RkError::StoreTombstone(meta.id));
            }
            existing.meta = meta;
            return Ok(());
        }
        info!(
            store_id = meta.id,
            address = %meta.address,
            operator = "ClusterPutStore",
            "store joined the cluster"
        );
        stores.insert(meta.id, StoreInfo::new(meta));
        Ok(())
    }

    /// One store record by id.
    pub fn get_store(&self, store_id: u64) -> Option<StoreInfo> {
        self.stores
            .read()
            .expect("stores lock")
            .get(&store_id)
            .cloned()
    }

    /// Every store record, in id order.
    pub fn get_stores(&self) -> Vec<StoreInfo> {
        let mut out: Vec<StoreInfo> = self
            .stores
            .read()
            .expect("stores lock")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(StoreInfo::id);
        out
    }

    /// Applies one store heartbeat: statistics plus the liveness instant.
    pub fn update_store_stats(&self, store_id: u64, stats: StoreStats) -> Result<()> {
        let mut stores = self.stores.write().expect("stores lock");
        let store = stores
            .get_mut(&store_id)
            .ok_or(RkError::StoreNotFound(store_id))?;
        if store.is_tombstone() {
            return Err(RkError::StoreTombstone(store_id));
        }
        store.stats = stats;
        store.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    /// Sets leader/region weights; both must be non-negative.
    pub fn set_store_weight(
        &self,
        store_id: u64,
        leader_weight: f64,
        region_weight: f64,
    ) -> Result<()> {
        if leader_weight < 0.0 || region_weight < 0.0 {
            return Err(RkError::InvalidValue(
                "store weights must be non-negative".to_string(),
            ));
        }
        let mut stores = self.stores.write().expect("stores lock");
        let store = stores
            .get_mut(&store_id)
            .ok_or(RkError::StoreNotFound(store_id))?;
        store.leader_weight = leader_weight;
        store.region_weight = region_weight;
        Ok(())
    }

    /// Transitions a store Up -> Offline, or straight to Tombstone when
    /// `force`. Idempotent. Returns the regions led on the store, which
    /// become down-leader candidates for the schedulers.
    pub fn remove_store(&self, store_id: u64, force: bool) -> Result<Vec<u64>> {
        {
            let mut stores = self.stores.write().expect("stores lock");
            let store = stores
                .get_mut(&store_id)
                .ok_or(RkError::StoreNotFound(store_id))?;
            let next = if force {
                StoreState::Tombstone
            } else if store.is_tombstone() {
                StoreState::Tombstone
            } else {
                StoreState::Offline
            };
            if store.meta.state != next {
                info!(
                    store_id,
                    state = ?next,
                    operator = "ClusterRemoveStore",
                    "store state transition"
                );
                store.meta.state = next;
            }
        }
        let regions = self.regions.read().expect("regions lock");
        Ok(regions
            .leaders
            .get(&store_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Stores not yet heartbeating for `threshold`.
    pub fn disconnected_stores(&self, threshold: Duration) -> Vec<u64> {
        self.stores
            .read()
            .expect("stores lock")
            .values()
            .filter(|s| s.is_up() && s.is_disconnected(threshold))
            .map(StoreInfo::id)
            .collect()
    }

    // ---- regions ----

    /// Reconciles a reported region against the tree.
    pub fn handle_region_heartbeat(&self, region: RegionInfo) -> Result<HeartbeatOutcome> {
        if region.id() == 0 {
            return Err(RkError::InvalidValue(
                "invalid request region, zero region id".to_string(),
            ));
        }
        if region.meta.peers.is_empty() {
            return Err(RkError::InvalidValue(
                "invalid region, zero region peer count".to_string(),
            ));
        }
        let region = Arc::new(region);
        let mut index = self.regions.write().expect("regions lock");
        // A report never supersedes an overlapping region that already
        // carries a newer geometry version.
        let outranked = index
            .tree
            .overlaps(region.start_key(), region.end_key())
            .iter()
            .any(|o| o.id() != region.id() && o.epoch().version > region.epoch().version);
        if outranked {
            return Ok(HeartbeatOutcome::Stale);
        }
        match index.by_id.get(&region.id()).cloned() {
            Some(origin) => {
                let stored = origin.epoch();
                let reported = region.epoch();
                if stored.is_newer_than(&reported) {
                    debug!(
                        region_id = region.id(),
                        operator = "ClusterRegionHeartbeat",
                        "stale epoch report ignored"
                    );
                    return Ok(HeartbeatOutcome::Stale);
                }
                if reported == stored {
                    let evicted = index.replace(region);
                    debug_assert!(evicted.is_empty());
                    return Ok(HeartbeatOutcome::StatsUpdated);
                }
                if reported.is_newer_than(&stored) {
                    let evicted = index.replace(region);
                    return Ok(HeartbeatOutcome::Updated { evicted });
                }
                // Mixed epochs never supersede.
                Ok(HeartbeatOutcome::Stale)
            }
            None => {
                let evicted = index.replace(region);
                Ok(HeartbeatOutcome::Updated { evicted })
            }
        }
    }

    /// One region by id.
    pub fn get_region(&self, region_id: u64) -> Option<Arc<RegionInfo>> {
        self.regions
            .read()
            .expect("regions lock")
            .by_id
            .get(&region_id)
            .cloned()
    }

    /// The region containing `key`.
    pub fn get_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.regions.read().expect("regions lock").tree.find(key)
    }

    /// The region immediately before the one containing `key`.
    pub fn get_prev_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.regions.read().expect("regions lock").tree.prev(key)
    }

    /// Scans regions within `[start, end)` in key order, up to `limit`
    /// entries (0 = unbounded).
    pub fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        let index = self.regions.read().expect("regions lock");
        let mut out = Vec::new();
        for region in index.tree.scan(start, 0) {
            if !end.is_empty() && region.start_key() >= end {
                break;
            }
            if limit > 0 && out.len() >= limit {
                break;
            }
            out.push(region);
        }
        out
    }

    /// Scans several disjoint ascending ranges at once.
    ///
    /// Ranges must be in ascending order and non-overlapping; with
    /// `contain_all`, the output must cover every requested key range or
    /// the call fails.
    pub fn batch_scan_regions(
        &self,
        ranges: &[KeyRange],
        limit: usize,
        contain_all: bool,
    ) -> Result<Vec<Arc<RegionInfo>>> {
        for (i, range) in ranges.iter().enumerate() {
            if i > 0 && range.start_key < ranges[i - 1].end_key {
                return Err(RkError::InvalidKeyRange("ranges overlapped".to_string()));
            }
            if !range.end_key.is_empty() && range.start_key > range.end_key {
                return Err(RkError::InvalidKeyRange("start key > end key".to_string()));
            }
        }
        let index = self.regions.read().expect("regions lock");
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for range in ranges {
            let overlaps = index.tree.overlaps(&range.start_key, &range.end_key);
            if contain_all {
                check_full_coverage(range, &overlaps)?;
            }
            for region in overlaps {
                if limit > 0 && out.len() >= limit {
                    return Ok(out);
                }
                if seen.insert(region.id()) {
                    out.push(region);
                }
            }
        }
        Ok(out)
    }

    fn rand_regions_by_role(
        &self,
        store_id: u64,
        role: RegionRole,
        ranges: &[KeyRange],
        n: usize,
    ) -> Vec<Arc<RegionInfo>> {
        let index = self.regions.read().expect("regions lock");
        let Some(ids) = index.role_set(store_id, role) else {
            return Vec::new();
        };
        let mut candidates: Vec<Arc<RegionInfo>> = ids
            .iter()
            .filter_map(|id| index.by_id.get(id))
            .filter(|region| {
                ranges.is_empty()
                    || ranges
                        .iter()
                        .any(|r| region.overlaps(&r.start_key, &r.end_key))
            })
            .cloned()
            .collect();
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(n);
        candidates
    }

    /// Random regions led from `store_id` within `ranges`.
    pub fn rand_leader_regions(&self, store_id: u64, ranges: &[KeyRange]) -> Vec<Arc<RegionInfo>> {
        self.rand_regions_by_role(store_id, RegionRole::Leader, ranges, 4)
    }

    /// Random regions with a non-leader voter on `store_id` within `ranges`.
    pub fn rand_follower_regions(
        &self,
        store_id: u64,
        ranges: &[KeyRange],
    ) -> Vec<Arc<RegionInfo>> {
        self.rand_regions_by_role(store_id, RegionRole::Follower, ranges, 4)
    }

    /// Random regions with a learner on `store_id` within `ranges`.
    pub fn rand_learner_regions(&self, store_id: u64, ranges: &[KeyRange]) -> Vec<Arc<RegionInfo>> {
        self.rand_regions_by_role(store_id, RegionRole::Learner, ranges, 4)
    }

    /// Counts regions of `role` on `store_id` intersecting `[start, end)`.
    pub fn get_store_count_by_range(
        &self,
        store_id: u64,
        role: RegionRole,
        start: &[u8],
        end: &[u8],
    ) -> usize {
        let index = self.regions.read().expect("regions lock");
        let Some(ids) = index.role_set(store_id, role) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| index.by_id.get(id))
            .filter(|region| region.overlaps(start, end))
            .count()
    }

    /// Number of regions in the registry.
    pub fn region_count(&self) -> usize {
        self.regions.read().expect("regions lock").tree.len()
    }

    /// Sum of approximate region sizes.
    pub fn total_region_size(&self) -> u64 {
        self.regions.read().expect("regions lock").tree.total_size()
    }

    /// A uniform random region within `ranges`, any role.
    pub fn random_region(&self, ranges: &[KeyRange]) -> Option<Arc<RegionInfo>> {
        self.regions
            .read()
            .expect("regions lock")
            .tree
            .random_region(ranges)
    }

    /// Applies a bucket report onto a stored region. Stale versions are
    /// dropped; unknown regions fail with `RegionNotFound`.
    pub fn update_region_buckets(&self, region_id: u64, buckets: crate::region::Buckets) -> Result<bool> {
        let mut index = self.regions.write().expect("regions lock");
        let origin = index
            .by_id
            .get(&region_id)
            .cloned()
            .ok_or(RkError::RegionNotFound(region_id))?;
        if origin
            .buckets
            .as_ref()
            .is_some_and(|b| b.version >= buckets.version)
        {
            return Ok(false);
        }
        let mut updated = (*origin).clone();
        updated.buckets = Some(buckets);
        let evicted = index.replace(Arc::new(updated));
        debug_assert!(evicted.is_empty());
        Ok(true)
    }
}

fn check_full_coverage(range: &KeyRange, overlaps: &[Arc<RegionInfo>]) -> Result<()> {
    let fail = |detail: String| Err(RkError::RegionsNotContainAllKeyRange(detail));
    let Some(first) = overlaps.first() else {
        return fail(format!("range {range} has no region"));
    };
    if !first.start_key().is_empty() && first.start_key() > range.start_key.as_slice() {
        return fail(format!("range {range} is not covered from its start"));
    }
    for pair in overlaps.windows(2) {
        if pair[0].end_key() != pair[1].start_key() {
            return fail(format!("range {range} has a gap between regions"));
        }
    }
    let last = overlaps.last().expect("non-empty overlaps");
    if !last.end_key().is_empty()
        && (range.end_key.is_empty() || last.end_key() < range.end_key.as_slice())
    {
        return fail(format!("range {range} is not covered up to its end"));
    }
    Ok(())
}

#[cfg(test)]
#[path = "cluster_tests.rs"]
mod tests;
