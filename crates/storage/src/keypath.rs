//! Persisted key layout.
//!
//! Every key is rooted at the cluster name so multiple clusters can share
//! one backing store. Numeric ids are zero-padded to keep prefix scans in
//! id order.

/// Leadership anchor for the main service.
pub fn leader_path(cluster: &str) -> String {
    format!("/{cluster}/leader")
}

/// Leadership anchor for one TSO keyspace-group primary.
pub fn tso_primary_path(cluster: &str, group: u32) -> String {
    format!("/{cluster}/keyspaces/tso/{group:05}/primary")
}

/// Leadership anchor for a dedicated microservice primary.
pub fn ms_primary_path(cluster: &str, service: &str) -> String {
    format!("/{cluster}/ms/{service}/primary")
}

/// Persisted cluster meta record (presence marks the cluster bootstrapped).
pub fn cluster_meta_path(cluster: &str) -> String {
    format!("/{cluster}/raft")
}

/// Persisted store meta record.
pub fn store_path(cluster: &str, store_id: u64) -> String {
    format!("/{cluster}/raft/s/{store_id:020}")
}

/// Prefix under which every store meta record lives.
pub fn store_prefix(cluster: &str) -> String {
    format!("/{cluster}/raft/s/")
}

/// Persisted region meta record.
pub fn region_path(cluster: &str, region_id: u64) -> String {
    format!("/{cluster}/raft/r/{region_id:020}")
}

/// Prefix under which every region meta record lives.
pub fn region_prefix(cluster: &str) -> String {
    format!("/{cluster}/raft/r/")
}

/// TSO high-water mark for one keyspace-group.
pub fn timestamp_path(cluster: &str, group: u32) -> String {
    format!("/{cluster}/timestamp/{group:05}")
}

/// Serialized config of one scheduler.
pub fn scheduler_config_path(cluster: &str, name: &str) -> String {
    format!("/{cluster}/scheduler_config/{name}")
}

/// Prefix under which every scheduler config lives.
pub fn scheduler_config_prefix(cluster: &str) -> String {
    format!("/{cluster}/scheduler_config/")
}

/// Cluster-level external timestamp.
pub fn external_timestamp_path(cluster: &str) -> String {
    format!("/{cluster}/external_timestamp")
}

/// Cluster-level minimal resolved timestamp.
pub fn min_resolved_ts_path(cluster: &str) -> String {
    format!("/{cluster}/min_resolved_ts")
}

/// Persisted cluster-wide replication/storage config record.
pub fn cluster_config_path(cluster: &str) -> String {
    format!("/{cluster}/config")
}

/// Allocator position for batched id allocation.
pub fn id_alloc_path(cluster: &str) -> String {
    format!("/{cluster}/alloc_id")
}

/// Keyspace meta record.
pub fn keyspace_path(cluster: &str, keyspace_id: u32) -> String {
    format!("/{cluster}/keyspaces/meta/{keyspace_id:08}")
}

/// Namespace of the CDC-compatible global configuration.
pub const GLOBAL_CONFIG_PREFIX: &str = "/global/config/";

/// One entry in the global configuration namespace.
pub fn global_config_path(name: &str) -> String {
    // Absolute names address foreign namespaces verbatim.
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{GLOBAL_CONFIG_PREFIX}{name}")
    }
}
