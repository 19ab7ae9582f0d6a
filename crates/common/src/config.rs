use serde::{Deserialize, Serialize};

/// Store-limit versioning scheme.
///
/// Only [`StoreLimitVersion::V1`] supports dynamic per-store, per-type rate
/// changes through the admin surface; later versions are recognized but
/// reject on-the-fly changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreLimitVersion {
    /// Per-store add-peer/remove-peer rates, adjustable at runtime.
    V1,
    /// Reserved; store limits are static under this version.
    V2,
}

impl Default for StoreLimitVersion {
    fn default() -> Self {
        Self::V1
    }
}

impl StoreLimitVersion {
    /// Returns whether runtime limit changes are accepted.
    pub fn allows_dynamic_changes(self) -> bool {
        matches!(self, Self::V1)
    }
}

/// Member/server-level configuration shared across the RPC front-end, the
/// TSO allocator, and the heartbeat pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdConfig {
    /// Cluster name used as the root prefix for every persisted key.
    pub cluster_name: String,
    /// Client address advertised to peers and stores.
    pub advertise_addr: String,
    /// TSO physical refresh tick in milliseconds.
    #[serde(default = "default_update_physical_interval_ms")]
    pub update_physical_interval_ms: u64,
    /// HWM window size written ahead of the in-memory physical, milliseconds.
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
    /// Maximum forward jump accepted by a user TSO reset, milliseconds.
    #[serde(default = "default_max_reset_ts_gap_ms")]
    pub max_reset_ts_gap_ms: u64,
    /// How often the heartbeat pipeline re-binds a leader-to-stream mapping,
    /// milliseconds.
    #[serde(default = "default_heartbeat_stream_bind_interval_ms")]
    pub heartbeat_stream_bind_interval_ms: u64,
    /// Rounding digits applied to heartbeat-reported flow statistics to
    /// control response churn.
    #[serde(default = "default_flow_round_by_digit")]
    pub flow_round_by_digit: u32,
    /// Wall-time deadline for one heartbeat-stream send, milliseconds.
    #[serde(default = "default_heartbeat_send_timeout_ms")]
    pub heartbeat_send_timeout_ms: u64,
    /// Timeout for one recv from a proxied TSO client, milliseconds.
    #[serde(default = "default_tso_proxy_recv_from_client_timeout_ms")]
    pub tso_proxy_recv_from_client_timeout_ms: u64,
    /// Deadline for one forwarded TSO round-trip, milliseconds.
    #[serde(default = "default_tso_proxy_timeout_ms")]
    pub tso_proxy_timeout_ms: u64,
    /// Cap on concurrent TSO proxy streamings; exceeding it fails fast.
    #[serde(default = "default_max_concurrent_tso_proxy_streamings")]
    pub max_concurrent_tso_proxy_streamings: usize,
    /// Deadline for dialing one forward host, milliseconds.
    #[serde(default = "default_grpc_dial_timeout_ms")]
    pub grpc_dial_timeout_ms: u64,
    /// Lease TTL for leader election, milliseconds.
    #[serde(default = "default_leader_lease_ms")]
    pub leader_lease_ms: u64,
}

fn default_update_physical_interval_ms() -> u64 {
    50
}

fn default_save_interval_ms() -> u64 {
    3_000
}

fn default_max_reset_ts_gap_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_heartbeat_stream_bind_interval_ms() -> u64 {
    60_000
}

fn default_flow_round_by_digit() -> u32 {
    3
}

fn default_heartbeat_send_timeout_ms() -> u64 {
    5_000
}

fn default_tso_proxy_recv_from_client_timeout_ms() -> u64 {
    5_000
}

fn default_tso_proxy_timeout_ms() -> u64 {
    3_000
}

fn default_max_concurrent_tso_proxy_streamings() -> usize {
    5_000
}

fn default_grpc_dial_timeout_ms() -> u64 {
    3_000
}

fn default_leader_lease_ms() -> u64 {
    3_000
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            cluster_name: "pd".to_string(),
            advertise_addr: "127.0.0.1:2379".to_string(),
            update_physical_interval_ms: default_update_physical_interval_ms(),
            save_interval_ms: default_save_interval_ms(),
            max_reset_ts_gap_ms: default_max_reset_ts_gap_ms(),
            heartbeat_stream_bind_interval_ms: default_heartbeat_stream_bind_interval_ms(),
            flow_round_by_digit: default_flow_round_by_digit(),
            heartbeat_send_timeout_ms: default_heartbeat_send_timeout_ms(),
            tso_proxy_recv_from_client_timeout_ms: default_tso_proxy_recv_from_client_timeout_ms(),
            tso_proxy_timeout_ms: default_tso_proxy_timeout_ms(),
            max_concurrent_tso_proxy_streamings: default_max_concurrent_tso_proxy_streamings(),
            grpc_dial_timeout_ms: default_grpc_dial_timeout_ms(),
            leader_lease_ms: default_leader_lease_ms(),
        }
    }
}

/// Scheduling caps and knobs read by the scheduler framework and the
/// operator controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Max concurrent region-movement operators across the cluster.
    #[serde(default = "default_region_schedule_limit")]
    pub region_schedule_limit: u64,
    /// Max concurrent leader-transfer operators.
    #[serde(default = "default_leader_schedule_limit")]
    pub leader_schedule_limit: u64,
    /// Max concurrent hot-region operators.
    #[serde(default = "default_hot_region_schedule_limit")]
    pub hot_region_schedule_limit: u64,
    /// Max concurrent replica-repair operators.
    #[serde(default = "default_replica_schedule_limit")]
    pub replica_schedule_limit: u64,
    /// Max concurrent merge operators.
    #[serde(default = "default_merge_schedule_limit")]
    pub merge_schedule_limit: u64,
    /// Max operators a single scheduler may keep waiting for dispatch.
    #[serde(default = "default_scheduler_max_waiting_operator")]
    pub scheduler_max_waiting_operator: u64,
    /// Store-limit versioning scheme in effect.
    #[serde(default)]
    pub store_limit_version: StoreLimitVersion,
    /// Gates acceptance of stores labeled with special engines.
    #[serde(default = "default_enable_placement_rules")]
    pub enable_placement_rules: bool,
    /// Scheduler tick interval in milliseconds.
    #[serde(default = "default_schedule_interval_ms")]
    pub schedule_interval_ms: u64,
    /// Duration after which a silent store counts as disconnected,
    /// milliseconds.
    #[serde(default = "default_store_disconnect_duration_ms")]
    pub store_disconnect_duration_ms: u64,
    /// Duration after which a silent store may be transitioned to offline,
    /// milliseconds.
    #[serde(default = "default_max_store_down_time_ms")]
    pub max_store_down_time_ms: u64,
    /// Default per-store add-peer rate, operators per minute.
    #[serde(default = "default_store_limit_rate")]
    pub store_limit_add_peer_per_min: f64,
    /// Default per-store remove-peer rate, operators per minute.
    #[serde(default = "default_store_limit_rate")]
    pub store_limit_remove_peer_per_min: f64,
    /// Lifetime of one operator before it expires, milliseconds.
    #[serde(default = "default_operator_timeout_ms")]
    pub operator_timeout_ms: u64,
}

fn default_region_schedule_limit() -> u64 {
    2_048
}

fn default_leader_schedule_limit() -> u64 {
    4
}

fn default_hot_region_schedule_limit() -> u64 {
    4
}

fn default_replica_schedule_limit() -> u64 {
    64
}

fn default_merge_schedule_limit() -> u64 {
    8
}

fn default_scheduler_max_waiting_operator() -> u64 {
    5
}

fn default_enable_placement_rules() -> bool {
    true
}

fn default_schedule_interval_ms() -> u64 {
    1_000
}

fn default_store_disconnect_duration_ms() -> u64 {
    20_000
}

fn default_max_store_down_time_ms() -> u64 {
    30 * 60 * 1000
}

fn default_store_limit_rate() -> f64 {
    15.0
}

fn default_operator_timeout_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            region_schedule_limit: default_region_schedule_limit(),
            leader_schedule_limit: default_leader_schedule_limit(),
            hot_region_schedule_limit: default_hot_region_schedule_limit(),
            replica_schedule_limit: default_replica_schedule_limit(),
            merge_schedule_limit: default_merge_schedule_limit(),
            scheduler_max_waiting_operator: default_scheduler_max_waiting_operator(),
            store_limit_version: StoreLimitVersion::default(),
            enable_placement_rules: default_enable_placement_rules(),
            schedule_interval_ms: default_schedule_interval_ms(),
            store_disconnect_duration_ms: default_store_disconnect_duration_ms(),
            max_store_down_time_ms: default_max_store_down_time_ms(),
            store_limit_add_peer_per_min: default_store_limit_rate(),
            store_limit_remove_peer_per_min: default_store_limit_rate(),
            operator_timeout_ms: default_operator_timeout_ms(),
        }
    }
}
