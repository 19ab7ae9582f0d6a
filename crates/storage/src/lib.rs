//! Persistence abstraction and leader election for Rangekeeper.
//!
//! Architecture role:
//! - transactional KV contract with leases and prefix watches, plus an
//!   in-process backend for tests and single-node runs
//! - persisted key layout shared by every component
//! - lease-based leader election and guarded leader-only writes
//! - typed endpoints for the records the control plane persists
//!
//! Key modules:
//! - [`kv`]
//! - [`keypath`]
//! - [`election`]
//! - [`endpoint`]

pub mod election;
pub mod endpoint;
pub mod keypath;
pub mod kv;

pub use election::{Election, Leadership};
pub use endpoint::Storage;
pub use kv::{Compare, EventKind, Kv, KvRef, LeaseId, MemoryKv, Txn, TxnOp, WatchEvent};
