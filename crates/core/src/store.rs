//! Store records and their lifecycle.
//!
//! A store's persisted state moves monotonically Up -> Offline -> Tombstone;
//! once tombstoned it never comes back. "Disconnected" is a derived
//! read-only state for stores that stopped heartbeating.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Engine label key carried by storage nodes.
pub const ENGINE_LABEL_KEY: &str = "engine";
/// Engine label value of columnar stores.
pub const ENGINE_TIFLASH: &str = "tiflash";
/// Engine value assumed when no engine label is present.
pub const ENGINE_TIKV: &str = "tikv";

/// Persisted store state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    /// Serving reads and writes.
    Up,
    /// Draining; regions are being moved away.
    Offline,
    /// Fully removed; the record awaits purge.
    Tombstone,
}

/// Node state derived from [`StoreState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The node participates in placement.
    Serving,
    /// The node is being drained.
    Removing,
    /// The node is gone.
    Removed,
}

/// Persisted store meta record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Stable 64-bit store id.
    pub id: u64,
    /// Network address the store serves on.
    pub address: String,
    /// Persisted lifecycle state.
    pub state: StoreState,
    /// String labels (zone, host, engine, ...).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Statistics reported by store heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total capacity in bytes.
    pub capacity: u64,
    /// Available capacity in bytes.
    pub available: u64,
    /// Regions hosted on the store.
    pub region_count: u64,
    /// Regions led by the store.
    pub leader_count: u64,
    /// Snapshots currently being sent.
    pub sending_snap_count: u64,
    /// Snapshots currently being received.
    pub receiving_snap_count: u64,
}

/// In-memory store record: persisted meta plus runtime statistics.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    /// Persisted meta record.
    pub meta: StoreMeta,
    /// Last reported statistics.
    pub stats: StoreStats,
    /// Weight applied to leader scores, non-negative.
    pub leader_weight: f64,
    /// Weight applied to region scores, non-negative.
    pub region_weight: f64,
    /// When the last heartbeat arrived.
    pub last_heartbeat: Option<Instant>,
}

impl StoreInfo {
    /// Wraps a fresh meta record with default runtime state.
    pub fn new(meta: StoreMeta) -> Self {
        Self {
            meta,
            stats: StoreStats::default(),
            leader_weight: 1.0,
            region_weight: 1.0,
            last_heartbeat: None,
        }
    }

    /// Store id.
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Network address.
    pub fn address(&self) -> &str {
        &self.meta.address
    }

    /// Whether the store is in the Up state.
    pub fn is_up(&self) -> bool {
        self.meta.state == StoreState::Up
    }

    /// Whether the store is draining.
    pub fn is_offline(&self) -> bool {
        self.meta.state == StoreState::Offline
    }

    /// Whether the store is tombstoned.
    pub fn is_tombstone(&self) -> bool {
        self.meta.state == StoreState::Tombstone
    }

    /// Node state derived from the persisted state.
    pub fn node_state(&self) -> NodeState {
        match self.meta.state {
            StoreState::Up => NodeState::Serving,
            StoreState::Offline => NodeState::Removing,
            StoreState::Tombstone => NodeState::Removed,
        }
    }

    /// Whether the store went silent for longer than `threshold`.
    pub fn is_disconnected(&self, threshold: Duration) -> bool {
        match self.last_heartbeat {
            Some(at) => at.elapsed() > threshold,
            None => false,
        }
    }

    /// Engine reported through the labels, defaulting to tikv.
    pub fn engine(&self) -> &str {
        self.meta
            .labels
            .get(ENGINE_LABEL_KEY)
            .map(String::as_str)
            .unwrap_or(ENGINE_TIKV)
    }

    /// Whether this store runs the columnar engine.
    pub fn is_tiflash(&self) -> bool {
        self.engine() == ENGINE_TIFLASH
    }

    /// Whether a snapshot is currently in flight on this store.
    pub fn has_snapshot_in_flight(&self) -> bool {
        self.stats.sending_snap_count > 0 || self.stats.receiving_snap_count > 0
    }
}

/// Validates store labels: keys and values must be non-empty, keys use the
/// restricted label charset, and the tiflash engine label is only accepted
/// when placement rules are enabled.
pub fn validate_labels(
    labels: &BTreeMap<String, String>,
    placement_rules_enabled: bool,
) -> Result<(), String> {
    for (key, value) in labels {
        if key.is_empty() {
            return Err("label key must not be empty".to_string());
        }
        if value.is_empty() {
            return Err(format!("label {key} has an empty value"));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(format!("invalid label key {key}"));
        }
    }
    if !placement_rules_enabled
        && labels.get(ENGINE_LABEL_KEY).map(String::as_str) == Some(ENGINE_TIFLASH)
    {
        return Err("placement rules must be enabled to accept tiflash stores".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: u64, state: StoreState) -> StoreMeta {
        StoreMeta {
            id,
            address: format!("127.0.0.1:2016{id}"),
            state,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn node_state_is_derived() {
        assert_eq!(
            StoreInfo::new(meta(1, StoreState::Up)).node_state(),
            NodeState::Serving
        );
        assert_eq!(
            StoreInfo::new(meta(1, StoreState::Offline)).node_state(),
            NodeState::Removing
        );
        assert_eq!(
            StoreInfo::new(meta(1, StoreState::Tombstone)).node_state(),
            NodeState::Removed
        );
    }

    #[test]
    fn disconnection_requires_a_prior_heartbeat() {
        let mut store = StoreInfo::new(meta(1, StoreState::Up));
        assert!(!store.is_disconnected(Duration::from_millis(1)));
        store.last_heartbeat = Some(Instant::now() - Duration::from_secs(60));
        assert!(store.is_disconnected(Duration::from_secs(20)));
        assert!(!store.is_disconnected(Duration::from_secs(120)));
    }

    #[test]
    fn label_validation() {
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "z1".to_string());
        assert!(validate_labels(&labels, false).is_ok());

        labels.insert("Zone".to_string(), "z1".to_string());
        assert!(validate_labels(&labels, false).is_err());
        labels.remove("Zone");

        labels.insert("host".to_string(), String::new());
        assert!(validate_labels(&labels, false).is_err());
        labels.remove("host");

        labels.insert(ENGINE_LABEL_KEY.to_string(), ENGINE_TIFLASH.to_string());
        assert!(validate_labels(&labels, false).is_err());
        assert!(validate_labels(&labels, true).is_ok());
    }

    #[test]
    fn engine_defaults_to_tikv() {
        let store = StoreInfo::new(meta(1, StoreState::Up));
        assert_eq!(store.engine(), ENGINE_TIKV);
        assert!(!store.is_tiflash());
    }
}
