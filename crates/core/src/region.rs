//! Region records: a replicated contiguous key range with an epoch and a
//! peer set.

use rk_common::keyutil;
use serde::{Deserialize, Serialize};

/// Replica role within a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Full voting replica.
    Voter,
    /// Non-voting replica catching up.
    Learner,
    /// Voting replica without log storage.
    Witness,
}

/// One replica of a region on a specific store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable peer id.
    pub id: u64,
    /// Store hosting this replica.
    pub store_id: u64,
    /// Replica role.
    pub role: PeerRole,
}

impl Peer {
    /// A voting peer.
    pub fn voter(id: u64, store_id: u64) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    /// A learner peer.
    pub fn learner(id: u64, store_id: u64) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }
}

/// Monotonically-increasing (version, conf-version) pair used to resolve
/// concurrent heartbeat races. `version` moves on splits/merges, `conf_ver`
/// on peer-set changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    /// Range-geometry version.
    pub version: u64,
    /// Configuration version.
    pub conf_ver: u64,
}

impl RegionEpoch {
    /// Builds an epoch.
    pub fn new(version: u64, conf_ver: u64) -> Self {
        Self { version, conf_ver }
    }

    /// Whether this epoch strictly supersedes `other` in either component
    /// without regressing in the other.
    pub fn is_newer_than(&self, other: &RegionEpoch) -> bool {
        (self.version > other.version && self.conf_ver >= other.conf_ver)
            || (self.conf_ver > other.conf_ver && self.version >= other.version)
    }
}

/// Persisted region meta record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMeta {
    /// Stable region id.
    pub id: u64,
    /// Inclusive start key.
    pub start_key: Vec<u8>,
    /// Exclusive end key; empty means +infinity.
    pub end_key: Vec<u8>,
    /// Race-resolving epoch.
    pub epoch: RegionEpoch,
    /// Ordered peer list.
    pub peers: Vec<Peer>,
}

/// Sub-region hot-range statistics reported by bucket heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Buckets {
    /// Bucket boundary keys, ordered.
    pub keys: Vec<Vec<u8>>,
    /// Bucket version; stale reports are dropped.
    pub version: u64,
}

/// In-memory region record: persisted meta plus heartbeat statistics.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    /// Persisted meta record.
    pub meta: RegionMeta,
    /// Current leader peer, if known.
    pub leader: Option<Peer>,
    /// Peers reported unreachable by the leader.
    pub down_peers: Vec<Peer>,
    /// Peers still applying snapshots.
    pub pending_peers: Vec<Peer>,
    /// Approximate size in MiB.
    pub approximate_size: u64,
    /// Approximate key count.
    pub approximate_keys: u64,
    /// Flow statistics, rounded by the configured digit.
    pub written_bytes: u64,
    /// Rounded written-key rate.
    pub written_keys: u64,
    /// Rounded read-byte rate.
    pub read_bytes: u64,
    /// Rounded read-key rate.
    pub read_keys: u64,
    /// Leader term at report time.
    pub term: u64,
    /// Optional bucket statistics.
    pub buckets: Option<Buckets>,
}

impl RegionInfo {
    /// Wraps a meta record with empty statistics.
    pub fn new(meta: RegionMeta, leader: Option<Peer>) -> Self {
        Self {
            meta,
            leader,
            down_peers: Vec::new(),
            pending_peers: Vec::new(),
            approximate_size: 0,
            approximate_keys: 0,
            written_bytes: 0,
            written_keys: 0,
            read_bytes: 0,
            read_keys: 0,
            term: 0,
            buckets: None,
        }
    }

    /// Region id.
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Race-resolving epoch.
    pub fn epoch(&self) -> RegionEpoch {
        self.meta.epoch
    }

    /// Inclusive start key.
    pub fn start_key(&self) -> &[u8] {
        &self.meta.start_key
    }

    /// Exclusive end key; empty means +infinity.
    pub fn end_key(&self) -> &[u8] {
        &self.meta.end_key
    }

    /// Whether `key` falls inside this region.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        keyutil::contains(&self.meta.start_key, &self.meta.end_key, key)
    }

    /// Whether this region overlaps `[start, end)`.
    ///
    /// Both bounds are half-open: an empty start is the lower bound of the
    /// key domain, an empty end is +infinity, so a region never overlaps a
    /// range it only touches at a boundary key.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        (self.meta.end_key.is_empty()
            || start.is_empty()
            || start < self.meta.end_key.as_slice())
            && (end.is_empty()
                || self.meta.start_key.is_empty()
                || self.meta.start_key.as_slice() < end)
    }

    /// Peer by peer id.
    pub fn get_peer(&self, peer_id: u64) -> Option<&Peer> {
        self.meta.peers.iter().find(|p| p.id == peer_id)
    }

    /// Peer hosted on `store_id`.
    pub fn get_store_peer(&self, store_id: u64) -> Option<&Peer> {
        self.meta.peers.iter().find(|p| p.store_id == store_id)
    }

    /// Ids of every store hosting a peer.
    pub fn store_ids(&self) -> Vec<u64> {
        self.meta.peers.iter().map(|p| p.store_id).collect()
    }

    /// Store hosting the leader, if any.
    pub fn leader_store_id(&self) -> Option<u64> {
        self.leader.map(|p| p.store_id)
    }

    /// Voter peers other than the leader.
    pub fn followers(&self) -> Vec<Peer> {
        let leader_id = self.leader.map(|p| p.id);
        self.meta
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::Voter && Some(p.id) != leader_id)
            .copied()
            .collect()
    }

    /// Learner peers.
    pub fn learners(&self) -> Vec<Peer> {
        self.meta
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::Learner)
            .copied()
            .collect()
    }

    /// Whether any pending peer is recorded.
    pub fn has_pending_peers(&self) -> bool {
        !self.pending_peers.is_empty()
    }

    /// Whether any down peer is recorded.
    pub fn has_down_peers(&self) -> bool {
        !self.down_peers.is_empty()
    }

    /// Voter count, used by the fully-replicated check.
    pub fn voter_count(&self) -> usize {
        self.meta
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::Voter)
            .count()
    }
}

/// Rounds a reported flow value down to `digits` significant decimal
/// places, so equal-magnitude reports do not churn heartbeat responses.
pub fn round_flow(value: u64, digits: u32) -> u64 {
    if digits == 0 {
        return value;
    }
    let unit = 10u64.saturating_pow(digits);
    if unit == 0 {
        return value;
    }
    value / unit * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u64, start: &[u8], end: &[u8], version: u64) -> RegionInfo {
        let peers = vec![Peer::voter(id * 10 + 1, 1), Peer::voter(id * 10 + 2, 2)];
        RegionInfo::new(
            RegionMeta {
                id,
                start_key: start.to_vec(),
                end_key: end.to_vec(),
                epoch: RegionEpoch::new(version, 1),
                peers: peers.clone(),
            },
            Some(peers[0]),
        )
    }

    #[test]
    fn containment_respects_half_open_bounds() {
        let r = region(1, b"b", b"d", 1);
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"c"));
        assert!(!r.contains_key(b"d"));

        let unbounded = region(2, b"d", b"", 1);
        assert!(unbounded.contains_key(b"zzz"));
    }

    #[test]
    fn adjacent_regions_do_not_overlap() {
        // The first region of a keyspace and its right neighbor share only
        // the boundary key, which the left range excludes.
        let first = region(1, b"", b"m", 1);
        assert!(!first.overlaps(b"m", b"z"));
        assert!(first.overlaps(b"l", b"z"));
        assert!(first.overlaps(b"", b"a"));

        let r = region(2, b"b", b"d", 1);
        assert!(!r.overlaps(b"", b"b"));
        assert!(!r.overlaps(b"d", b""));
        assert!(r.overlaps(b"c", b""));
        assert!(r.overlaps(b"", b""));

        let unbounded = region(3, b"", b"", 1);
        assert!(unbounded.overlaps(b"x", b"y"));
    }

    #[test]
    fn epoch_supersession() {
        let old = RegionEpoch::new(1, 1);
        assert!(RegionEpoch::new(2, 1).is_newer_than(&old));
        assert!(RegionEpoch::new(1, 2).is_newer_than(&old));
        assert!(!RegionEpoch::new(1, 1).is_newer_than(&old));
        assert!(!old.is_newer_than(&RegionEpoch::new(2, 1)));
        // A mixed regression never supersedes.
        assert!(!RegionEpoch::new(2, 0).is_newer_than(&RegionEpoch::new(1, 1)));
    }

    #[test]
    fn peer_lookups() {
        let r = region(1, b"a", b"b", 1);
        assert_eq!(r.get_store_peer(2).map(|p| p.id), Some(12));
        assert!(r.get_store_peer(9).is_none());
        assert_eq!(r.leader_store_id(), Some(1));
        assert_eq!(r.followers().len(), 1);
        assert_eq!(r.store_ids(), vec![1, 2]);
    }

    #[test]
    fn flow_rounding() {
        assert_eq!(round_flow(123_456, 3), 123_000);
        assert_eq!(round_flow(123_456, 0), 123_456);
        assert_eq!(round_flow(999, 3), 0);
    }
}
