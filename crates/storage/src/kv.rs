//! Transactional key-value abstraction over the backing consensus store.
//!
//! Contract:
//! - prefix range reads return entries in key order;
//! - a txn is (compares on keys) -> (then ops) -> succeeded/not, applied
//!   atomically at one revision;
//! - leases are holder-bound and auto-expire unless renewed; keys attached
//!   to an expired lease are deleted as if by the holder;
//! - a watch over a prefix emits PUT/DELETE events with a monotonically
//!   increasing revision; resuming below the compacted revision fails with
//!   [`RkError::DataCompacted`] and the caller re-lists.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rk_common::{Result, RkError};
use tokio::sync::mpsc;

/// Identifier of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

/// A txn precondition on one key.
#[derive(Debug, Clone)]
pub enum Compare {
    /// The key must exist.
    Exists(String),
    /// The key must not exist.
    NotExists(String),
    /// The key must exist with exactly this value.
    ValueEquals(String, Vec<u8>),
}

/// A txn mutation applied when the compares hold (or when they do not,
/// for the failure branch).
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write a value, optionally bound to a lease.
    Put {
        /// Target key.
        key: String,
        /// Value bytes.
        value: Vec<u8>,
        /// Lease the key lives under, if any.
        lease: Option<LeaseId>,
    },
    /// Remove a key.
    Delete {
        /// Target key.
        key: String,
    },
}

/// One atomic compare-and-swap transaction.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    /// Preconditions; all must hold for the success branch.
    pub compares: Vec<Compare>,
    /// Ops applied when every compare holds.
    pub success: Vec<TxnOp>,
    /// Ops applied when any compare fails.
    pub failure: Vec<TxnOp>,
}

impl Txn {
    /// Starts an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a precondition.
    pub fn compare(mut self, cmp: Compare) -> Self {
        self.compares.push(cmp);
        self
    }

    /// Adds a success-branch op.
    pub fn then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    /// Adds a failure-branch op.
    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

/// Result of one transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxnOutcome {
    /// Whether the success branch was taken.
    pub succeeded: bool,
    /// Revision the txn committed at.
    pub revision: u64,
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A key was created or updated.
    Put,
    /// A key was removed.
    Delete,
}

/// One watch event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Affected key.
    pub key: String,
    /// New value for PUT, last value for DELETE.
    pub value: Vec<u8>,
    /// Revision the mutation committed at.
    pub revision: u64,
}

/// Receiving half of a prefix watch.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Backing store handle shared across components.
pub type KvRef = std::sync::Arc<dyn Kv>;

/// Transactional KV with prefix reads, leases, and prefix watches.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Reads one key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads every key under a prefix, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Writes one key unconditionally.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Removes one key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Applies one transaction atomically.
    async fn txn(&self, txn: Txn) -> Result<TxnOutcome>;

    /// Watches a prefix from `start_revision` (0 = next revision only).
    ///
    /// Replays history from `start_revision` when it is still retained,
    /// otherwise fails with [`RkError::DataCompacted`].
    async fn watch_prefix(&self, prefix: &str, start_revision: u64) -> Result<WatchStream>;

    /// Grants a lease auto-expiring after `ttl` unless renewed.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renews a lease; fails if it already expired.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes a lease, deleting its attached keys.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Drops retained watch history strictly below `revision`.
    async fn compact(&self, revision: u64) -> Result<()>;

    /// Revision of the latest committed mutation.
    async fn current_revision(&self) -> Result<u64>;
}

struct ValueRecord {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct MemoryState {
    map: BTreeMap<String, ValueRecord>,
    revision: u64,
    compacted: u64,
    next_lease: u64,
    leases: HashMap<LeaseId, LeaseRecord>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

/// In-process implementation of the full [`Kv`] contract.
///
/// Backs tests and single-node runs; every mutation commits at its own
/// revision, lease expiry is evaluated lazily on access, and watch history
/// is retained until [`Kv::compact`] is called.
pub struct MemoryKv {
    state: Mutex<MemoryState>,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn emit(&mut self, kind: EventKind, key: String, value: Vec<u8>, revision: u64) {
        let event = WatchEvent {
            kind,
            key,
            value,
            revision,
        };
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
        self.history.push(event);
    }

    fn purge_expired_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) {
        let Some(lease) = self.leases.remove(&id) else {
            return;
        };
        for key in lease.keys {
            if let Some(record) = self.map.remove(&key) {
                let revision = self.bump();
                self.emit(EventKind::Delete, key, record.value, revision);
            }
        }
    }

    fn apply(&mut self, op: TxnOp) {
        match op {
            TxnOp::Put { key, value, lease } => {
                if let Some(lease_id) = lease {
                    if let Some(rec) = self.leases.get_mut(&lease_id) {
                        rec.keys.insert(key.clone());
                    }
                }
                self.map.insert(
                    key.clone(),
                    ValueRecord {
                        value: value.clone(),
                        lease,
                    },
                );
                let revision = self.bump();
                self.emit(EventKind::Put, key, value, revision);
            }
            TxnOp::Delete { key } => {
                if let Some(record) = self.map.remove(&key) {
                    let revision = self.bump();
                    self.emit(EventKind::Delete, key, record.value, revision);
                }
            }
        }
    }

    fn check(&self, cmp: &Compare) -> bool {
        match cmp {
            Compare::Exists(key) => self.map.contains_key(key),
            Compare::NotExists(key) => !self.map.contains_key(key),
            Compare::ValueEquals(key, value) => {
                self.map.get(key).is_some_and(|r| r.value == *value)
            }
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        Ok(state.map.get(key).map(|r| r.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        Ok(state
            .map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        state.apply(TxnOp::Put {
            key: key.to_string(),
            value,
            lease: None,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        let existed = state.map.contains_key(key);
        state.apply(TxnOp::Delete {
            key: key.to_string(),
        });
        Ok(existed)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnOutcome> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        let succeeded = txn.compares.iter().all(|cmp| state.check(cmp));
        let ops = if succeeded { txn.success } else { txn.failure };
        for op in ops {
            state.apply(op);
        }
        Ok(TxnOutcome {
            succeeded,
            revision: state.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: u64) -> Result<WatchStream> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        if start_revision > 0 && start_revision <= state.compacted {
            return Err(RkError::DataCompacted {
                requested: start_revision,
                compacted: state.compacted,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if start_revision > 0 {
            for event in &state.history {
                if event.revision >= start_revision && event.key.starts_with(prefix) {
                    // Replay into the unbounded buffer; the receiver drains it
                    // before any live event.
                    let _ = tx.send(event.clone());
                }
            }
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);
        state.leases.insert(
            id,
            LeaseRecord {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().expect("kv state lock");
        state.purge_expired_leases(Instant::now());
        match state.leases.get_mut(&lease) {
            Some(rec) => {
                rec.expires_at = Instant::now() + rec.ttl;
                Ok(())
            }
            None => Err(RkError::TxnInternal(format!(
                "lease {} not found or expired",
                lease.0
            ))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().expect("kv state lock");
        state.drop_lease(lease);
        Ok(())
    }

    async fn compact(&self, revision: u64) -> Result<()> {
        let mut state = self.state.lock().expect("kv state lock");
        state.compacted = state.compacted.max(revision.min(state.revision));
        let compacted = state.compacted;
        state.history.retain(|e| e.revision >= compacted);
        Ok(())
    }

    async fn current_revision(&self) -> Result<u64> {
        let state = self.state.lock().expect("kv state lock");
        Ok(state.revision)
    }
}
