//! Generated gRPC bindings and proto/core conversion glue.
//!
//! RPC schema source: `proto/rangekeeper.proto`.
//!
//! Key control-plane RPCs (generated under [`v1`]):
//! - `Tso` (bidi stream), `RegionHeartbeat` (bidi stream), `ReportBuckets`
//!   (client stream)
//! - `Bootstrap`, `AllocId`, `PutStore`/`GetStore`, `StoreHeartbeat`
//! - `GetRegion`/`GetPrevRegion`/`GetRegionById`, `ScanRegions`,
//!   `BatchScanRegions`
//! - `AskSplit`/`AskBatchSplit`/`ReportSplit`, `ScatterRegion`,
//!   `SplitRegions`, `GetOperator`
//! - `StoreGlobalConfig`/`LoadGlobalConfig`/`WatchGlobalConfig`

use rk_common::RkError;
use rk_core::{
    Peer, PeerRole, RegionEpoch, RegionInfo, RegionMeta, StoreInfo, StoreMeta, StoreState,
    StoreStats,
};
use tonic::Status;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("rangekeeper.v1");
}

pub use v1::placement_driver_client::PlacementDriverClient;
pub use v1::placement_driver_server::{PlacementDriver, PlacementDriverServer};
pub use v1::scheduling_client::SchedulingClient;
pub use v1::scheduling_server::{Scheduling, SchedulingServer};
pub use v1::tso_client::TsoClient;
pub use v1::tso_server::{Tso, TsoServer};

/// Metadata key carrying the address of the member a request was
/// originally sent to, set by transparent forwarding.
pub const FORWARDED_HOST_KEY: &str = "forwarded-host";

/// A header with no error.
pub fn wrap_header(cluster_id: u64) -> v1::ResponseHeader {
    v1::ResponseHeader {
        cluster_id,
        error: None,
    }
}

/// A header carrying an explicit error record.
pub fn error_header(cluster_id: u64, error_type: v1::ErrorType, message: String) -> v1::ResponseHeader {
    v1::ResponseHeader {
        cluster_id,
        error: Some(v1::Error {
            r#type: error_type as i32,
            message,
        }),
    }
}

/// The not-bootstrapped header used before the first bootstrap.
pub fn not_bootstrapped_header(cluster_id: u64) -> v1::ResponseHeader {
    error_header(
        cluster_id,
        v1::ErrorType::NotBootstrapped,
        "cluster is not bootstrapped".to_string(),
    )
}

/// Maps an [`RkError`] onto the in-band header error taxonomy.
pub fn header_from_error(cluster_id: u64, err: &RkError) -> v1::ResponseHeader {
    let error_type = match err {
        RkError::NotBootstrapped => v1::ErrorType::NotBootstrapped,
        RkError::AlreadyBootstrapped => v1::ErrorType::AlreadyBootstrapped,
        RkError::StoreTombstone(_) => v1::ErrorType::StoreTombstone,
        RkError::RegionNotFound(_) => v1::ErrorType::RegionNotFound,
        RkError::IncompatibleVersion(_) => v1::ErrorType::IncompatibleVersion,
        RkError::InvalidValue(_) => v1::ErrorType::InvalidValue,
        RkError::DataCompacted { .. } => v1::ErrorType::DataCompacted,
        RkError::RegionsNotContainAllKeyRange(_) => {
            v1::ErrorType::RegionsNotContainAllKeyRange
        }
        RkError::NotLeader(_) | RkError::LeaderNil => v1::ErrorType::NotLeader,
        // Key-range shape errors surface as UNKNOWN with their message, the
        // way clients already parse them.
        _ => v1::ErrorType::Unknown,
    };
    error_header(cluster_id, error_type, err.to_string())
}

/// Maps an [`RkError`] onto a transport-level status, for paths where the
/// in-band channel is gone.
pub fn to_status(err: RkError) -> Status {
    match &err {
        RkError::NotStarted | RkError::NotLeader(_) | RkError::LeaderNil => {
            Status::unavailable(err.to_string())
        }
        RkError::RateLimitExceeded(_) | RkError::MaxConcurrentProxyExceeded => {
            Status::resource_exhausted(err.to_string())
        }
        RkError::SendTimeout(_) | RkError::RecvTimeout(_) => {
            Status::deadline_exceeded(err.to_string())
        }
        RkError::StreamClosed(_) => Status::aborted(err.to_string()),
        RkError::MismatchClusterId { .. } => Status::failed_precondition(err.to_string()),
        RkError::InvalidValue(_) | RkError::InvalidKeyRange(_) => {
            Status::invalid_argument(err.to_string())
        }
        RkError::Internal(_) | RkError::TxnInternal(_) | RkError::Io(_) => {
            Status::internal(err.to_string())
        }
        _ => Status::unknown(err.to_string()),
    }
}

// ---- store conversions ----

/// Core store record to its wire form.
pub fn store_to_proto(store: &StoreInfo) -> v1::Store {
    v1::Store {
        id: store.meta.id,
        address: store.meta.address.clone(),
        state: match store.meta.state {
            StoreState::Up => v1::StoreState::Up,
            StoreState::Offline => v1::StoreState::Offline,
            StoreState::Tombstone => v1::StoreState::Tombstone,
        } as i32,
        labels: store
            .meta
            .labels
            .iter()
            .map(|(key, value)| v1::StoreLabel {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}

/// Wire store record to the persisted meta form.
pub fn store_meta_from_proto(store: v1::Store) -> Result<StoreMeta, RkError> {
    if store.id == 0 {
        return Err(RkError::InvalidValue("store id must not be zero".to_string()));
    }
    if store.address.is_empty() {
        return Err(RkError::InvalidValue(
            "store address must not be empty".to_string(),
        ));
    }
    let state = match v1::StoreState::try_from(store.state) {
        Ok(v1::StoreState::Up) => StoreState::Up,
        Ok(v1::StoreState::Offline) => StoreState::Offline,
        Ok(v1::StoreState::Tombstone) => StoreState::Tombstone,
        Err(_) => {
            return Err(RkError::InvalidValue(format!(
                "unknown store state value {}",
                store.state
            )))
        }
    };
    Ok(StoreMeta {
        id: store.id,
        address: store.address,
        state,
        labels: store
            .labels
            .into_iter()
            .map(|l| (l.key, l.value))
            .collect(),
    })
}

/// Wire statistics to the core form.
pub fn stats_from_proto(stats: &v1::StoreStats) -> StoreStats {
    StoreStats {
        capacity: stats.capacity,
        available: stats.available,
        region_count: stats.region_count,
        leader_count: stats.leader_count,
        sending_snap_count: stats.sending_snap_count,
        receiving_snap_count: stats.receiving_snap_count,
    }
}

/// Core statistics to their wire form.
pub fn stats_to_proto(store_id: u64, stats: &StoreStats) -> v1::StoreStats {
    v1::StoreStats {
        store_id,
        capacity: stats.capacity,
        available: stats.available,
        region_count: stats.region_count,
        leader_count: stats.leader_count,
        sending_snap_count: stats.sending_snap_count,
        receiving_snap_count: stats.receiving_snap_count,
    }
}

// ---- region conversions ----

/// Core peer to its wire form.
pub fn peer_to_proto(peer: &Peer) -> v1::Peer {
    v1::Peer {
        id: peer.id,
        store_id: peer.store_id,
        role: match peer.role {
            PeerRole::Voter => v1::PeerRole::Voter,
            PeerRole::Learner => v1::PeerRole::Learner,
            PeerRole::Witness => v1::PeerRole::Witness,
        } as i32,
    }
}

/// Wire peer to the core form.
pub fn peer_from_proto(peer: &v1::Peer) -> Peer {
    Peer {
        id: peer.id,
        store_id: peer.store_id,
        role: match v1::PeerRole::try_from(peer.role) {
            Ok(v1::PeerRole::Learner) => PeerRole::Learner,
            Ok(v1::PeerRole::Witness) => PeerRole::Witness,
            _ => PeerRole::Voter,
        },
    }
}

/// Core region meta to its wire form.
pub fn region_to_proto(meta: &RegionMeta) -> v1::Region {
    v1::Region {
        id: meta.id,
        start_key: meta.start_key.clone(),
        end_key: meta.end_key.clone(),
        epoch: Some(v1::RegionEpoch {
            version: meta.epoch.version,
            conf_ver: meta.epoch.conf_ver,
        }),
        peers: meta.peers.iter().map(peer_to_proto).collect(),
    }
}

/// Wire region to the core meta form.
pub fn region_meta_from_proto(region: v1::Region) -> RegionMeta {
    let epoch = region
        .epoch
        .map(|e| RegionEpoch::new(e.version, e.conf_ver))
        .unwrap_or_default();
    RegionMeta {
        id: region.id,
        start_key: region.start_key,
        end_key: region.end_key,
        epoch,
        peers: region.peers.iter().map(peer_from_proto).collect(),
    }
}

/// Core region record to the wire record returned by queries.
pub fn region_record(region: &RegionInfo, need_buckets: bool) -> v1::RegionRecord {
    v1::RegionRecord {
        region: Some(region_to_proto(&region.meta)),
        // Queries always carry a leader slot; unknown leaders are an empty
        // peer, matching what clients expect.
        leader: Some(
            region
                .leader
                .as_ref()
                .map(peer_to_proto)
                .unwrap_or_default(),
        ),
        down_peers: region.down_peers.iter().map(peer_to_proto).collect(),
        pending_peers: region.pending_peers.iter().map(peer_to_proto).collect(),
        buckets: if need_buckets {
            region.buckets.as_ref().map(|b| v1::Buckets {
                region_id: region.id(),
                version: b.version,
                keys: b.keys.clone(),
            })
        } else {
            None
        },
    }
}

/// Normalizes a heartbeat request into a core region record, rounding the
/// reported flow statistics by the configured digit.
pub fn region_from_heartbeat(
    request: v1::RegionHeartbeatRequest,
    flow_round_by_digit: u32,
) -> Result<RegionInfo, RkError> {
    let Some(region) = request.region else {
        return Err(RkError::InvalidValue(
            "heartbeat request has no region".to_string(),
        ));
    };
    let meta = region_meta_from_proto(region);
    let leader = request.leader.as_ref().map(peer_from_proto);
    let mut info = RegionInfo::new(meta, leader);
    info.down_peers = request.down_peers.iter().map(peer_from_proto).collect();
    info.pending_peers = request.pending_peers.iter().map(peer_from_proto).collect();
    info.approximate_size = request.approximate_size;
    info.approximate_keys = request.approximate_keys;
    info.written_bytes = rk_core::region::round_flow(request.bytes_written, flow_round_by_digit);
    info.written_keys = rk_core::region::round_flow(request.keys_written, flow_round_by_digit);
    info.read_bytes = rk_core::region::round_flow(request.bytes_read, flow_round_by_digit);
    info.read_keys = rk_core::region::round_flow(request.keys_read, flow_round_by_digit);
    info.term = request.term;
    Ok(info)
}

/// Core timestamp to its wire form.
pub fn timestamp_to_proto(ts: rk_tso::Timestamp) -> v1::Timestamp {
    v1::Timestamp {
        physical: ts.physical,
        logical: ts.logical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_taxonomy_maps_onto_header_types() {
        let header = header_from_error(7, &RkError::NotBootstrapped);
        assert_eq!(header.cluster_id, 7);
        assert_eq!(
            header.error.unwrap().r#type,
            v1::ErrorType::NotBootstrapped as i32
        );

        let header = header_from_error(7, &RkError::InvalidKeyRange("ranges overlapped".into()));
        let error = header.error.unwrap();
        assert_eq!(error.r#type, v1::ErrorType::Unknown as i32);
        assert_eq!(error.message, "invalid key range, ranges overlapped");

        let header = header_from_error(
            7,
            &RkError::RegionsNotContainAllKeyRange("range 61-62".into()),
        );
        assert_eq!(
            header.error.unwrap().r#type,
            v1::ErrorType::RegionsNotContainAllKeyRange as i32
        );
    }

    #[test]
    fn transport_status_codes() {
        assert_eq!(
            to_status(RkError::MaxConcurrentProxyExceeded).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            to_status(RkError::NotLeader("m2".into())).code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            to_status(RkError::SendTimeout("heartbeat".into())).code(),
            tonic::Code::DeadlineExceeded
        );
    }

    #[test]
    fn store_round_trip() {
        let mut meta = StoreMeta {
            id: 4,
            address: "127.0.0.1:20160".to_string(),
            state: StoreState::Offline,
            labels: Default::default(),
        };
        meta.labels.insert("zone".into(), "z1".into());
        let proto = store_to_proto(&StoreInfo::new(meta.clone()));
        let back = store_meta_from_proto(proto).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn heartbeat_flow_statistics_are_rounded() {
        let region = v1::Region {
            id: 1,
            start_key: b"a".to_vec(),
            end_key: b"b".to_vec(),
            epoch: Some(v1::RegionEpoch {
                version: 1,
                conf_ver: 1,
            }),
            peers: vec![v1::Peer {
                id: 11,
                store_id: 1,
                role: v1::PeerRole::Voter as i32,
            }],
        };
        let request = v1::RegionHeartbeatRequest {
            header: None,
            region: Some(region),
            leader: Some(v1::Peer {
                id: 11,
                store_id: 1,
                role: v1::PeerRole::Voter as i32,
            }),
            bytes_written: 123_456,
            keys_written: 9_999,
            ..Default::default()
        };
        let info = region_from_heartbeat(request, 3).unwrap();
        assert_eq!(info.written_bytes, 123_000);
        assert_eq!(info.written_keys, 9_000);
        assert_eq!(info.leader_store_id(), Some(1));
    }
}
