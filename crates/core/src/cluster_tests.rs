use super::*;
use crate::region::{Peer, PeerRole, RegionEpoch, RegionInfo, RegionMeta};
use crate::store::{StoreMeta, StoreState};
use std::collections::BTreeMap;

fn store_meta(id: u64) -> StoreMeta {
    StoreMeta {
        id,
        address: format!("127.0.0.1:2016{id}"),
        state: StoreState::Up,
        labels: BTreeMap::new(),
    }
}

fn region_on_stores(
    id: u64,
    start: &[u8],
    end: &[u8],
    epoch: RegionEpoch,
    voters: &[u64],
    learners: &[u64],
) -> RegionInfo {
    let mut peers = Vec::new();
    for (i, store) in voters.iter().enumerate() {
        peers.push(Peer::voter(id * 100 + i as u64, *store));
    }
    for (i, store) in learners.iter().enumerate() {
        peers.push(Peer {
            id: id * 100 + 50 + i as u64,
            store_id: *store,
            role: PeerRole::Learner,
        });
    }
    let leader = peers.first().copied();
    RegionInfo::new(
        RegionMeta {
            id,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch,
            peers,
        },
        leader,
    )
}

fn cluster() -> BasicCluster {
    BasicCluster::new(true)
}

#[test]
fn put_then_get_store_round_trips() {
    let cluster = cluster();
    let meta = store_meta(1);
    cluster.put_meta_store(meta.clone()).unwrap();
    let loaded = cluster.get_store(1).unwrap();
    assert_eq!(loaded.meta, meta);
    assert!(loaded.last_heartbeat.is_none());
}

#[test]
fn tombstone_store_cannot_be_revived() {
    let cluster = cluster();
    cluster.put_meta_store(store_meta(1)).unwrap();
    cluster.remove_store(1, true).unwrap();
    let err = cluster.put_meta_store(store_meta(1)).unwrap_err();
    assert!(matches!(err, RkError::StoreTombstone(1)));
    // Removing again stays tombstone.
    cluster.remove_store(1, false).unwrap();
    assert!(cluster.get_store(1).unwrap().is_tombstone());
}

#[test]
fn remove_store_reports_down_leader_candidates() {
    let cluster = cluster();
    for id in 1..=3 {
        cluster.put_meta_store(store_meta(id)).unwrap();
    }
    cluster
        .handle_region_heartbeat(region_on_stores(
            10,
            b"a",
            b"b",
            RegionEpoch::new(1, 1),
            &[1, 2, 3],
            &[],
        ))
        .unwrap();
    cluster
        .handle_region_heartbeat(region_on_stores(
            11,
            b"b",
            b"c",
            RegionEpoch::new(1, 1),
            &[2, 1, 3],
            &[],
        ))
        .unwrap();

    let candidates = cluster.remove_store(1, false).unwrap();
    assert_eq!(candidates, vec![10]);
    assert!(cluster.get_store(1).unwrap().is_offline());
}

#[test]
fn stale_epoch_reports_are_ignored() {
    let cluster = cluster();
    let fresh = region_on_stores(1, b"a", b"c", RegionEpoch::new(2, 1), &[1], &[]);
    cluster.handle_region_heartbeat(fresh).unwrap();

    let stale = region_on_stores(1, b"a", b"z", RegionEpoch::new(1, 1), &[1], &[]);
    let outcome = cluster.handle_region_heartbeat(stale).unwrap();
    assert_eq!(outcome, HeartbeatOutcome::Stale);
    assert_eq!(cluster.get_region(1).unwrap().end_key(), b"c");
}

#[test]
fn equal_epoch_updates_statistics_only() {
    let cluster = cluster();
    cluster
        .handle_region_heartbeat(region_on_stores(
            1,
            b"a",
            b"c",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();
    let mut update = region_on_stores(1, b"a", b"c", RegionEpoch::new(1, 1), &[1], &[]);
    update.approximate_size = 96;
    update.approximate_keys = 1_000;
    let outcome = cluster.handle_region_heartbeat(update).unwrap();
    assert_eq!(outcome, HeartbeatOutcome::StatsUpdated);
    let stored = cluster.get_region(1).unwrap();
    assert_eq!(stored.approximate_size, 96);
    assert_eq!(cluster.total_region_size(), 96);
}

#[test]
fn newer_epoch_supersedes_overlapping_regions() {
    let cluster = cluster();
    // Region R: ["a", "c") at version 1.
    cluster
        .handle_region_heartbeat(region_on_stores(
            1,
            b"a",
            b"c",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();
    // Overlapping R' at version 2 takes ["a", "b").
    let outcome = cluster
        .handle_region_heartbeat(region_on_stores(
            2,
            b"a",
            b"b",
            RegionEpoch::new(2, 1),
            &[1],
            &[],
        ))
        .unwrap();
    assert_eq!(outcome, HeartbeatOutcome::Updated { evicted: vec![1] });

    // R is fully gone; only R' remains.
    let scan = cluster.scan_regions(b"a", b"z", 0);
    assert_eq!(scan.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![2]);
    assert!(cluster.get_region(1).is_none());
    assert!(cluster.get_region_by_key(b"b").is_none());
}

#[test]
fn heartbeat_validation_rejects_malformed_regions() {
    let cluster = cluster();
    let mut zero_id = region_on_stores(1, b"a", b"b", RegionEpoch::new(1, 1), &[1], &[]);
    zero_id.meta.id = 0;
    assert!(matches!(
        cluster.handle_region_heartbeat(zero_id),
        Err(RkError::InvalidValue(_))
    ));

    let mut no_peers = region_on_stores(1, b"a", b"b", RegionEpoch::new(1, 1), &[1], &[]);
    no_peers.meta.peers.clear();
    let err = cluster.handle_region_heartbeat(no_peers).unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid value: invalid region, zero region peer count"
    );
}

#[test]
fn region_coverage_after_splits() {
    let cluster = cluster();
    // One region covers everything, then splits into three.
    cluster
        .handle_region_heartbeat(region_on_stores(
            1,
            b"",
            b"",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();
    for (id, start, end) in [(2u64, b"".as_ref(), b"g".as_ref()), (3, b"g", b"n"), (1, b"n", b"")] {
        cluster
            .handle_region_heartbeat(region_on_stores(
                id,
                start,
                end,
                RegionEpoch::new(2, 1),
                &[1],
                &[],
            ))
            .unwrap();
    }
    // Every key resolves to exactly one region, and a full scan returns
    // each region exactly once.
    for key in [b"".as_ref(), b"a", b"g", b"m", b"n", b"zz"] {
        assert!(cluster.get_region_by_key(key).is_some(), "key {key:?}");
    }
    let all = cluster.scan_regions(b"", b"", 0);
    assert_eq!(all.len(), 3);
    let mut ids: Vec<u64> = all.iter().map(|r| r.id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn batch_scan_rejects_reversed_and_overlapping_ranges() {
    let cluster = cluster();
    let err = cluster
        .batch_scan_regions(&[KeyRange::new(b"1".to_vec(), b"0".to_vec())], 0, false)
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid key range, start key > end key");

    let err = cluster
        .batch_scan_regions(
            &[
                KeyRange::new(b"0".to_vec(), b"2".to_vec()),
                KeyRange::new(b"1".to_vec(), b"3".to_vec()),
            ],
            0,
            false,
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid key range, ranges overlapped");
}

#[test]
fn batch_scan_contain_all_detects_gaps() {
    let cluster = cluster();
    cluster
        .handle_region_heartbeat(region_on_stores(
            1,
            b"a",
            b"c",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();
    cluster
        .handle_region_heartbeat(region_on_stores(
            2,
            b"d",
            b"f",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();

    // The gap ["c", "d") breaks full coverage.
    let err = cluster
        .batch_scan_regions(&[KeyRange::new(b"a".to_vec(), b"f".to_vec())], 0, true)
        .unwrap_err();
    assert!(matches!(err, RkError::RegionsNotContainAllKeyRange(_)));

    // Without the option, partial results are fine.
    let regions = cluster
        .batch_scan_regions(&[KeyRange::new(b"a".to_vec(), b"f".to_vec())], 0, false)
        .unwrap();
    assert_eq!(regions.len(), 2);
}

#[test]
fn batch_scan_deduplicates_spanning_regions_and_honors_limit() {
    let cluster = cluster();
    cluster
        .handle_region_heartbeat(region_on_stores(
            1,
            b"a",
            b"e",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();
    cluster
        .handle_region_heartbeat(region_on_stores(
            2,
            b"e",
            b"h",
            RegionEpoch::new(1, 1),
            &[1],
            &[],
        ))
        .unwrap();

    // Region 1 spans both requested ranges but is returned once.
    let regions = cluster
        .batch_scan_regions(
            &[
                KeyRange::new(b"a".to_vec(), b"b".to_vec()),
                KeyRange::new(b"c".to_vec(), b"f".to_vec()),
            ],
            0,
            false,
        )
        .unwrap();
    assert_eq!(regions.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![1, 2]);

    let limited = cluster
        .batch_scan_regions(
            &[KeyRange::new(b"a".to_vec(), b"h".to_vec())],
            1,
            false,
        )
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn role_scoped_sampling_and_counting() {
    let cluster = cluster();
    for id in 1..=3 {
        cluster.put_meta_store(store_meta(id)).unwrap();
    }
    // Store 1 leads both regions; store 2 follows; store 3 learns.
    for (id, start, end) in [(1u64, b"a".as_ref(), b"g".as_ref()), (2, b"g", b"p")] {
        cluster
            .handle_region_heartbeat(region_on_stores(
                id,
                start,
                end,
                RegionEpoch::new(1, 1),
                &[1, 2],
                &[3],
            ))
            .unwrap();
    }

    let whole = [KeyRange::new(b"".to_vec(), b"".to_vec())];
    assert!(!cluster.rand_leader_regions(1, &whole).is_empty());
    assert!(cluster.rand_leader_regions(2, &whole).is_empty());
    assert!(!cluster.rand_follower_regions(2, &whole).is_empty());
    assert!(!cluster.rand_learner_regions(3, &whole).is_empty());

    assert_eq!(
        cluster.get_store_count_by_range(1, RegionRole::Leader, b"", b""),
        2
    );
    assert_eq!(
        cluster.get_store_count_by_range(1, RegionRole::Leader, b"a", b"g"),
        1
    );
    assert_eq!(
        cluster.get_store_count_by_range(3, RegionRole::Learner, b"", b""),
        2
    );

    // A leader transfer moves the region between role indexes.
    let mut transferred = region_on_stores(1, b"a", b"g", RegionEpoch::new(1, 1), &[1, 2], &[3]);
    transferred.leader = transferred.meta.peers.iter().find(|p| p.store_id == 2).copied();
    cluster.handle_region_heartbeat(transferred).unwrap();
    assert_eq!(
        cluster.get_store_count_by_range(1, RegionRole::Leader, b"", b""),
        1
    );
    assert_eq!(
        cluster.get_store_count_by_range(2, RegionRole::Leader, b"", b""),
        1
    );
}

#[test]
fn prev_region_queries() {
    let cluster = cluster();
    for (id, start, end) in [(1u64, b"a".as_ref(), b"g".as_ref()), (2, b"g", b"p")] {
        cluster
            .handle_region_heartbeat(region_on_stores(
                id,
                start,
                end,
                RegionEpoch::new(1, 1),
                &[1],
                &[],
            ))
            .unwrap();
    }
    assert_eq!(cluster.get_prev_region(b"h").unwrap().id(), 1);
    assert!(cluster.get_prev_region(b"b").is_none());
}
