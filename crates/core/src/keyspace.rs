//! Keyspace metadata: logical tenants partitioning the key domain.
//!
//! The core treats keyspaces as metadata only; the bootstrap keyspace is
//! protected from modification.

use serde::{Deserialize, Serialize};

/// Well-known id of the bootstrap keyspace.
pub const BOOTSTRAP_KEYSPACE_ID: u32 = 0;
/// Well-known name of the bootstrap keyspace.
pub const BOOTSTRAP_KEYSPACE_NAME: &str = "DEFAULT";

/// Keyspace lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyspaceState {
    /// Serving.
    Enabled,
    /// Temporarily not serving; may be re-enabled.
    Disabled,
    /// Retired but retained; may only move toward removal.
    Archived,
    /// Terminal.
    Tombstone,
}

impl KeyspaceState {
    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: KeyspaceState) -> bool {
        use KeyspaceState::*;
        matches!(
            (self, next),
            (Enabled, Enabled)
                | (Enabled, Disabled)
                | (Disabled, Disabled)
                | (Disabled, Enabled)
                | (Disabled, Archived)
                | (Archived, Archived)
                | (Archived, Tombstone)
                | (Tombstone, Tombstone)
        )
    }
}

/// Persisted keyspace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceMeta {
    /// Stable keyspace id.
    pub id: u32,
    /// Unique keyspace name.
    pub name: String,
    /// Lifecycle state.
    pub state: KeyspaceState,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
}

/// Whether the keyspace id is protected from modification.
pub fn is_protected_keyspace_id(id: u32) -> bool {
    id == BOOTSTRAP_KEYSPACE_ID
}

/// Whether the keyspace name is protected from modification.
pub fn is_protected_keyspace_name(name: &str) -> bool {
    name == BOOTSTRAP_KEYSPACE_NAME
}
