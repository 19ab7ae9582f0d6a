//! Lease-based leader election and membership.
//!
//! Exactly one of N members holds the lease behind the leadership anchor
//! key; the holder's client address is the key's value, so followers and
//! forwarding layers resolve the serving member with one read. Any write
//! that must be serialized under leadership goes through a
//! [`Leadership::guarded_txn`], which re-checks the anchor inside the same
//! transaction, so a lease lost mid-operation fails the write instead of
//! corrupting state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rk_common::{Result, RkError};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::kv::{Compare, Kv, KvRef, LeaseId, Txn, TxnOp};

/// A capability to issue writes guarded by the current leadership.
#[derive(Debug, Clone)]
pub struct Leadership {
    path: String,
    identity: String,
}

impl Leadership {
    /// The compare asserting the anchor is still held by this member.
    pub fn guard(&self) -> Compare {
        Compare::ValueEquals(self.path.clone(), self.identity.as_bytes().to_vec())
    }

    /// Builds a txn whose success branch runs only while leadership holds.
    pub fn guarded_txn(&self, ops: Vec<TxnOp>) -> Txn {
        let mut txn = Txn::new().compare(self.guard());
        txn.success = ops;
        txn
    }

    /// Executes `ops` under the leadership guard.
    ///
    /// Fails with [`RkError::NotLeader`] when the lease was lost, which the
    /// caller must treat as fatal for its in-flight leader work.
    pub async fn commit(&self, kv: &dyn Kv, ops: Vec<TxnOp>) -> Result<()> {
        let outcome = kv.txn(self.guarded_txn(ops)).await?;
        if !outcome.succeeded {
            return Err(RkError::NotLeader(format!(
                "leadership on {} lost by {}",
                self.path, self.identity
            )));
        }
        Ok(())
    }
}

/// Membership/election handle for one anchor key.
pub struct Election {
    kv: KvRef,
    path: String,
    identity: String,
    lease_ttl: Duration,
    lease: Mutex<Option<LeaseId>>,
    serving: AtomicBool,
    leader_tx: watch::Sender<Option<String>>,
}

impl Election {
    /// Creates an election participant advertising `identity` at `path`.
    pub fn new(kv: KvRef, path: String, identity: String, lease_ttl: Duration) -> Arc<Self> {
        let (leader_tx, _) = watch::channel(None);
        Arc::new(Self {
            kv,
            path,
            identity,
            lease_ttl,
            lease: Mutex::new(None),
            serving: AtomicBool::new(false),
            leader_tx,
        })
    }

    /// Whether this member currently believes it holds the lease.
    ///
    /// The flag is advisory; correctness comes from the txn guard on every
    /// serialized write.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Address advertised by this member.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Currently-advertised leader address, or `None` when unknown.
    pub fn leader_address(&self) -> Option<String> {
        self.leader_tx.borrow().clone()
    }

    /// Subscribes to leader-change notifications.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.leader_tx.subscribe()
    }

    /// Leadership capability for guarded writes.
    pub fn leadership(&self) -> Leadership {
        Leadership {
            path: self.path.clone(),
            identity: self.identity.clone(),
        }
    }

    /// One election round: campaign when not serving, renew when serving.
    ///
    /// Returns whether this member serves after the round.
    pub async fn tick(&self) -> Result<bool> {
        if self.is_serving() {
            self.renew().await
        } else {
            self.campaign().await
        }
    }

    /// Tries to take the anchor with a fresh lease.
    pub async fn campaign(&self) -> Result<bool> {
        let lease = self.kv.grant_lease(self.lease_ttl).await?;
        let outcome = self
            .kv
            .txn(
                Txn::new()
                    .compare(Compare::NotExists(self.path.clone()))
                    .then(TxnOp::Put {
                        key: self.path.clone(),
                        value: self.identity.as_bytes().to_vec(),
                        lease: Some(lease),
                    }),
            )
            .await?;
        if outcome.succeeded {
            *self.lease.lock().expect("lease lock") = Some(lease);
            self.serving.store(true, Ordering::SeqCst);
            self.publish(Some(self.identity.clone()));
            info!(
                path = %self.path,
                identity = %self.identity,
                operator = "ElectionCampaign",
                "won leadership"
            );
            return Ok(true);
        }
        // Lost the race; drop the unused lease and learn the winner.
        self.kv.revoke_lease(lease).await?;
        self.refresh_leader().await?;
        Ok(false)
    }

    /// Renews the held lease and re-verifies the anchor.
    async fn renew(&self) -> Result<bool> {
        let lease = *self.lease.lock().expect("lease lock");
        let Some(lease) = lease else {
            self.step_down().await;
            return Ok(false);
        };
        if self.kv.keep_alive(lease).await.is_err() {
            warn!(
                path = %self.path,
                identity = %self.identity,
                operator = "ElectionRenew",
                "lease expired, stepping down"
            );
            self.step_down().await;
            return Ok(false);
        }
        let holder = self.kv.get(&self.path).await?;
        if holder.as_deref() != Some(self.identity.as_bytes()) {
            warn!(
                path = %self.path,
                identity = %self.identity,
                operator = "ElectionRenew",
                "anchor held by another member, stepping down"
            );
            self.step_down().await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Voluntarily releases leadership.
    pub async fn resign(&self) -> Result<()> {
        if !self.is_serving() {
            return Ok(());
        }
        let leadership = self.leadership();
        let _ = self
            .kv
            .txn(leadership.guarded_txn(vec![TxnOp::Delete {
                key: self.path.clone(),
            }]))
            .await?;
        self.step_down().await;
        info!(
            path = %self.path,
            identity = %self.identity,
            operator = "ElectionResign",
            "resigned leadership"
        );
        Ok(())
    }

    /// Re-reads the anchor and publishes the current holder.
    pub async fn refresh_leader(&self) -> Result<Option<String>> {
        let holder = self
            .kv
            .get(&self.path)
            .await?
            .map(|v| String::from_utf8_lossy(&v).to_string());
        self.publish(holder.clone());
        Ok(holder)
    }

    async fn step_down(&self) {
        self.serving.store(false, Ordering::SeqCst);
        let lease = self.lease.lock().expect("lease lock").take();
        if let Some(lease) = lease {
            let _ = self.kv.revoke_lease(lease).await;
        }
        let _ = self.refresh_leader().await;
    }

    fn publish(&self, holder: Option<String>) {
        self.leader_tx.send_if_modified(|current| {
            if *current == holder {
                false
            } else {
                *current = holder;
                true
            }
        });
    }

    /// Background election loop: ticks at a third of the lease TTL until
    /// `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.lease_ttl / 3;
        loop {
            if let Err(err) = self.tick().await {
                warn!(
                    path = %self.path,
                    error = %err,
                    operator = "ElectionTick",
                    "election round failed, retrying next tick"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = self.resign().await;
                        return;
                    }
                }
            }
        }
    }
}
