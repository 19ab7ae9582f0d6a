//! Store and region filter toolkit used by the schedulers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rk_core::{RegionInfo, StoreInfo};

/// Filters candidate stores on the source and target sides of a movement.
pub trait StoreFilter: Send + Sync {
    /// Filter name used in metrics and logs.
    fn name(&self) -> &'static str;
    /// Whether the store may give up a peer or leadership.
    fn filter_source(&self, store: &StoreInfo) -> bool;
    /// Whether the store may receive a peer or leadership.
    fn filter_target(&self, store: &StoreInfo) -> bool;
}

/// Rejects stores whose lifecycle or liveness makes them unusable.
pub struct StoreStateFilter {
    /// Threshold after which a silent store counts as disconnected.
    pub disconnect_threshold: Duration,
}

impl StoreFilter for StoreStateFilter {
    fn name(&self) -> &'static str {
        "store-state-filter"
    }

    fn filter_source(&self, store: &StoreInfo) -> bool {
        // Draining stores are still valid sources; tombstoned and silent
        // ones are not.
        !store.is_tombstone() && !store.is_disconnected(self.disconnect_threshold)
    }

    fn filter_target(&self, store: &StoreInfo) -> bool {
        store.is_up() && !store.is_disconnected(self.disconnect_threshold)
    }
}

/// Keeps only stores running the named engine.
pub struct EngineFilter {
    engine: &'static str,
}

impl EngineFilter {
    /// Row stores only.
    pub fn tikv() -> Self {
        Self {
            engine: rk_core::store::ENGINE_TIKV,
        }
    }

    /// Columnar stores only.
    pub fn tiflash() -> Self {
        Self {
            engine: rk_core::store::ENGINE_TIFLASH,
        }
    }
}

impl StoreFilter for EngineFilter {
    fn name(&self) -> &'static str {
        "engine-filter"
    }

    fn filter_source(&self, store: &StoreInfo) -> bool {
        store.engine() == self.engine
    }

    fn filter_target(&self, store: &StoreInfo) -> bool {
        store.engine() == self.engine
    }
}

/// Excludes explicit stores from the target side.
pub struct ExcludedFilter {
    stores: HashSet<u64>,
}

impl ExcludedFilter {
    /// Builds the exclusion set.
    pub fn new(stores: HashSet<u64>) -> Self {
        Self { stores }
    }
}

impl StoreFilter for ExcludedFilter {
    fn name(&self) -> &'static str {
        "excluded-filter"
    }

    fn filter_source(&self, _store: &StoreInfo) -> bool {
        true
    }

    fn filter_target(&self, store: &StoreInfo) -> bool {
        !self.stores.contains(&store.id())
    }
}

/// Rejects targets with a snapshot already in flight.
pub struct SnapshotFilter;

impl StoreFilter for SnapshotFilter {
    fn name(&self) -> &'static str {
        "snapshot-filter"
    }

    fn filter_source(&self, _store: &StoreInfo) -> bool {
        true
    }

    fn filter_target(&self, store: &StoreInfo) -> bool {
        !store.has_snapshot_in_flight()
    }
}

/// Stores usable as movement sources, in input order.
pub fn select_source_stores(
    stores: Vec<StoreInfo>,
    filters: &[&dyn StoreFilter],
) -> Vec<StoreInfo> {
    stores
        .into_iter()
        .filter(|s| filters.iter().all(|f| f.filter_source(s)))
        .collect()
}

/// Stores usable as movement targets, in input order.
pub fn select_target_stores(
    stores: Vec<StoreInfo>,
    filters: &[&dyn StoreFilter],
) -> Vec<StoreInfo> {
    stores
        .into_iter()
        .filter(|s| filters.iter().all(|f| f.filter_target(s)))
        .collect()
}

/// Filters candidate regions before scheduling.
pub trait RegionFilter: Send + Sync {
    /// Filter name used in metrics and logs.
    fn name(&self) -> &'static str;
    /// Whether the region may be scheduled.
    fn keep(&self, region: &RegionInfo) -> bool;
}

/// Rejects regions reporting down peers.
pub struct RegionDownFilter;

impl RegionFilter for RegionDownFilter {
    fn name(&self) -> &'static str {
        "region-down-filter"
    }

    fn keep(&self, region: &RegionInfo) -> bool {
        !region.has_down_peers()
    }
}

/// Rejects regions reporting pending peers.
pub struct RegionPendingFilter;

impl RegionFilter for RegionPendingFilter {
    fn name(&self) -> &'static str {
        "region-pending-filter"
    }

    fn keep(&self, region: &RegionInfo) -> bool {
        !region.has_pending_peers()
    }
}

/// Rejects regions that are not fully replicated.
pub struct RegionReplicatedFilter {
    /// Expected voter count.
    pub replicas: usize,
}

impl RegionFilter for RegionReplicatedFilter {
    fn name(&self) -> &'static str {
        "region-replicated-filter"
    }

    fn keep(&self, region: &RegionInfo) -> bool {
        region.voter_count() >= self.replicas
    }
}

/// First candidate region passing every filter; the input is expected to
/// be pre-shuffled by the sampling query.
pub fn select_one_region(
    candidates: Vec<Arc<RegionInfo>>,
    filters: &[&dyn RegionFilter],
) -> Option<Arc<RegionInfo>> {
    candidates
        .into_iter()
        .find(|r| filters.iter().all(|f| f.keep(r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_core::{Peer, RegionEpoch, RegionMeta, StoreMeta, StoreState};
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn store(id: u64, state: StoreState) -> StoreInfo {
        let mut info = StoreInfo::new(StoreMeta {
            id,
            address: format!("s{id}"),
            state,
            labels: BTreeMap::new(),
        });
        info.last_heartbeat = Some(Instant::now());
        info
    }

    fn region(down: bool, pending: bool, voters: usize) -> Arc<RegionInfo> {
        let peers: Vec<Peer> = (0..voters as u64).map(|i| Peer::voter(i + 1, i + 1)).collect();
        let leader = peers.first().copied();
        let mut info = RegionInfo::new(
            RegionMeta {
                id: 1,
                start_key: b"a".to_vec(),
                end_key: b"b".to_vec(),
                epoch: RegionEpoch::new(1, 1),
                peers,
            },
            leader,
        );
        if down {
            info.down_peers = vec![Peer::voter(99, 9)];
        }
        if pending {
            info.pending_peers = vec![Peer::voter(98, 8)];
        }
        Arc::new(info)
    }

    #[test]
    fn state_filter_separates_sources_and_targets() {
        let filter = StoreStateFilter {
            disconnect_threshold: Duration::from_secs(20),
        };
        let offline = store(1, StoreState::Offline);
        assert!(filter.filter_source(&offline));
        assert!(!filter.filter_target(&offline));

        let tombstone = store(2, StoreState::Tombstone);
        assert!(!filter.filter_source(&tombstone));

        let mut silent = store(3, StoreState::Up);
        silent.last_heartbeat = Some(Instant::now() - Duration::from_secs(60));
        assert!(!filter.filter_target(&silent));
        assert!(!filter.filter_source(&silent));
    }

    #[test]
    fn engine_filter_selects_by_label() {
        let mut tiflash = store(1, StoreState::Up);
        tiflash.meta.labels.insert(
            rk_core::store::ENGINE_LABEL_KEY.to_string(),
            rk_core::store::ENGINE_TIFLASH.to_string(),
        );
        let tikv = store(2, StoreState::Up);

        assert!(EngineFilter::tiflash().filter_target(&tiflash));
        assert!(!EngineFilter::tiflash().filter_target(&tikv));
        assert!(EngineFilter::tikv().filter_target(&tikv));
        assert!(!EngineFilter::tikv().filter_target(&tiflash));
    }

    #[test]
    fn excluded_and_snapshot_filters_are_target_only() {
        let excluded = ExcludedFilter::new([1].into_iter().collect());
        let s1 = store(1, StoreState::Up);
        assert!(excluded.filter_source(&s1));
        assert!(!excluded.filter_target(&s1));

        let mut snapshotting = store(2, StoreState::Up);
        snapshotting.stats.sending_snap_count = 1;
        assert!(SnapshotFilter.filter_source(&snapshotting));
        assert!(!SnapshotFilter.filter_target(&snapshotting));
    }

    #[test]
    fn region_filters_compose() {
        let filters: Vec<&dyn RegionFilter> = vec![
            &RegionDownFilter,
            &RegionPendingFilter,
            &RegionReplicatedFilter { replicas: 3 },
        ];
        let good = region(false, false, 3);
        let down = region(true, false, 3);
        let thin = region(false, false, 2);

        let picked = select_one_region(vec![down, thin, good.clone()], &filters);
        assert_eq!(picked.unwrap().id(), good.id());
    }
}
