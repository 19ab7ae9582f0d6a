//! Operators: finite movement plans targeting one region.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use rk_core::{PeerRole, RegionEpoch, RegionInfo};

/// Primary kind of an operator, used for limit accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Leadership movement only.
    Leader,
    /// Peer movement.
    Region,
    /// Replica repair.
    Replica,
    /// Region merge.
    Merge,
    /// Region split.
    Split,
    /// Range-job movement (balance-range).
    Range,
    /// Administrator-issued.
    Admin,
}

impl OpKind {
    /// Stable label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Leader => "leader",
            OpKind::Region => "region",
            OpKind::Replica => "replica",
            OpKind::Merge => "merge",
            OpKind::Split => "split",
            OpKind::Range => "range",
            OpKind::Admin => "admin",
        }
    }
}

/// Scheduling priority; a higher-priority operator may replace a live
/// lower-priority one on the same region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpPriority {
    /// Background work.
    Low,
    /// Default.
    Medium,
    /// Urgent repair.
    High,
}

/// One step of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStep {
    /// Add a voter peer on a store.
    AddPeer {
        /// Target store.
        store_id: u64,
        /// Pre-allocated peer id.
        peer_id: u64,
    },
    /// Add a learner peer on a store.
    AddLearner {
        /// Target store.
        store_id: u64,
        /// Pre-allocated peer id.
        peer_id: u64,
    },
    /// Promote a learner to voter.
    PromoteLearner {
        /// Learner peer id.
        peer_id: u64,
    },
    /// Remove the peer on a store.
    RemovePeer {
        /// Source store.
        store_id: u64,
    },
    /// Move the leadership between stores.
    TransferLeader {
        /// Current leader store.
        from_store: u64,
        /// Target store; must already hold a peer.
        to_store: u64,
    },
    /// Merge this region into a neighbor.
    MergeRegion {
        /// Neighbor absorbing the range.
        target_region_id: u64,
    },
    /// Split this region at the given keys.
    SplitRegion {
        /// Explicit split keys; empty means split by size.
        keys: Vec<Vec<u8>>,
    },
}

impl OpStep {
    /// Whether the region already reflects this step.
    pub fn is_finished(&self, region: &RegionInfo) -> bool {
        match self {
            OpStep::AddPeer { store_id, .. } => region
                .get_store_peer(*store_id)
                .is_some_and(|p| p.role == PeerRole::Voter),
            OpStep::AddLearner { store_id, .. } => region.get_store_peer(*store_id).is_some(),
            OpStep::PromoteLearner { peer_id } => region
                .get_peer(*peer_id)
                .is_some_and(|p| p.role == PeerRole::Voter),
            OpStep::RemovePeer { store_id } => region.get_store_peer(*store_id).is_none(),
            OpStep::TransferLeader { to_store, .. } => {
                region.leader_store_id() == Some(*to_store)
            }
            // Merge and split complete through epoch changes observed by the
            // controller, not through step inspection.
            OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. } => false,
        }
    }
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::AddPeer { store_id, peer_id } => {
                write!(f, "add peer {peer_id} on store {store_id}")
            }
            OpStep::AddLearner { store_id, peer_id } => {
                write!(f, "add learner {peer_id} on store {store_id}")
            }
            OpStep::PromoteLearner { peer_id } => write!(f, "promote learner {peer_id}"),
            OpStep::RemovePeer { store_id } => write!(f, "remove peer on store {store_id}"),
            OpStep::TransferLeader { to_store, .. } => {
                write!(f, "transfer leader to store {to_store}")
            }
            OpStep::MergeRegion { target_region_id } => {
                write!(f, "merge into region {target_region_id}")
            }
            OpStep::SplitRegion { .. } => write!(f, "split region"),
        }
    }
}

/// Lifecycle status of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStatus {
    /// Built but not yet accepted by the controller.
    Created,
    /// Accepted; waiting for the first heartbeat to dispatch.
    Started,
    /// Steps are being dispatched and observed.
    Running,
    /// Every step finished.
    Success,
    /// Ran past its timeout.
    Expired,
    /// Canceled by replacement, epoch advance, or admin action.
    Canceled,
    /// A step was rejected by the store.
    Failed,
}

impl OperatorStatus {
    /// Whether the status releases the per-region slot.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperatorStatus::Success
                | OperatorStatus::Expired
                | OperatorStatus::Canceled
                | OperatorStatus::Failed
        )
    }

    /// Stable label used in responses and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorStatus::Created => "created",
            OperatorStatus::Started => "started",
            OperatorStatus::Running => "running",
            OperatorStatus::Success => "success",
            OperatorStatus::Expired => "expired",
            OperatorStatus::Canceled => "canceled",
            OperatorStatus::Failed => "failed",
        }
    }
}

/// A finite movement plan targeting one region.
///
/// At most one operator is live per region at a time; the controller
/// cancels it when the region's epoch advances past the one the operator
/// was planned against.
#[derive(Debug, Clone)]
pub struct Operator {
    /// Target region.
    pub region_id: u64,
    /// Epoch the plan was computed against.
    pub region_epoch: RegionEpoch,
    /// Originating scheduler (or admin surface) name.
    pub desc: String,
    /// Accounting kind.
    pub kind: OpKind,
    /// Replacement priority.
    pub priority: OpPriority,
    /// Ordered steps.
    pub steps: Vec<OpStep>,
    /// Index of the next unfinished step.
    pub current_step: usize,
    /// Lifecycle status.
    pub status: OperatorStatus,
    /// When the operator was built.
    pub created_at: Instant,
    /// When the controller accepted it.
    pub started_at: Option<Instant>,
    /// Wall-time budget from acceptance to expiry.
    pub timeout: Duration,
}

impl Operator {
    /// Builds an operator in the Created state.
    pub fn new(
        desc: impl Into<String>,
        region: &RegionInfo,
        kind: OpKind,
        priority: OpPriority,
        steps: Vec<OpStep>,
        timeout: Duration,
    ) -> Self {
        Self {
            region_id: region.id(),
            region_epoch: region.epoch(),
            desc: desc.into(),
            kind,
            priority,
            steps,
            current_step: 0,
            status: OperatorStatus::Created,
            created_at: Instant::now(),
            started_at: None,
            timeout,
        }
    }

    /// Whether every step has completed.
    pub fn is_finished(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    /// Whether the accepted operator outlived its budget.
    pub fn is_expired(&self) -> bool {
        match self.started_at {
            Some(at) => at.elapsed() > self.timeout,
            None => false,
        }
    }

    /// Advances past the steps `region` already reflects and returns the
    /// next step to dispatch, if any.
    pub fn advance(&mut self, region: &RegionInfo) -> Option<&OpStep> {
        while self.current_step < self.steps.len() {
            if self.steps[self.current_step].is_finished(region) {
                self.current_step += 1;
            } else {
                break;
            }
        }
        if self.is_finished() {
            None
        } else {
            self.status = OperatorStatus::Running;
            self.steps.get(self.current_step)
        }
    }

    /// Applies the remaining steps' projected effect onto `influence`.
    pub fn apply_influence(&self, influence: &mut OpInfluence) {
        for step in self.steps.iter().skip(self.current_step) {
            match step {
                OpStep::AddPeer { store_id, .. } => {
                    let entry = influence.entry(*store_id);
                    entry.region_count += 1;
                }
                OpStep::AddLearner { store_id, .. } => {
                    let entry = influence.entry(*store_id);
                    entry.learner_count += 1;
                    entry.region_count += 1;
                }
                OpStep::PromoteLearner { .. } => {}
                OpStep::RemovePeer { store_id } => {
                    let entry = influence.entry(*store_id);
                    entry.region_count -= 1;
                }
                OpStep::TransferLeader {
                    from_store,
                    to_store,
                } => {
                    influence.entry(*from_store).leader_count -= 1;
                    influence.entry(*to_store).leader_count += 1;
                }
                OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. } => {}
            }
        }
    }

    /// Short human-readable plan, used by get-operator responses.
    pub fn brief(&self) -> String {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        format!("{} (region {}): {}", self.desc, self.region_id, steps.join(", "))
    }
}

/// Projected per-store effect of completing an operator set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreInfluence {
    /// Net leader count change.
    pub leader_count: i64,
    /// Net region (peer) count change.
    pub region_count: i64,
    /// Net learner count change.
    pub learner_count: i64,
}

impl StoreInfluence {
    /// Influence along one balancing role.
    pub fn by_role(&self, role: rk_core::RegionRole) -> i64 {
        match role {
            rk_core::RegionRole::Leader => self.leader_count,
            rk_core::RegionRole::Follower => self.region_count,
            rk_core::RegionRole::Learner => self.learner_count,
        }
    }
}

/// Projection of what would happen if all current operators completed.
#[derive(Debug, Clone, Default)]
pub struct OpInfluence {
    stores: HashMap<u64, StoreInfluence>,
}

impl OpInfluence {
    /// Mutable per-store slot.
    fn entry(&mut self, store_id: u64) -> &mut StoreInfluence {
        self.stores.entry(store_id).or_default()
    }

    /// Influence recorded for a store (zero when untouched).
    pub fn get_store_influence(&self, store_id: u64) -> StoreInfluence {
        self.stores.get(&store_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_core::{Peer, RegionMeta};

    fn region(voters: &[u64]) -> RegionInfo {
        let peers: Vec<Peer> = voters
            .iter()
            .enumerate()
            .map(|(i, s)| Peer::voter(100 + i as u64, *s))
            .collect();
        let leader = peers.first().copied();
        RegionInfo::new(
            RegionMeta {
                id: 1,
                start_key: b"a".to_vec(),
                end_key: b"b".to_vec(),
                epoch: RegionEpoch::new(1, 1),
                peers,
            },
            leader,
        )
    }

    #[test]
    fn advance_skips_completed_steps() {
        let before = region(&[1, 2]);
        let mut op = Operator::new(
            "balance-range-scheduler",
            &before,
            OpKind::Range,
            OpPriority::Medium,
            vec![
                OpStep::AddPeer {
                    store_id: 3,
                    peer_id: 300,
                },
                OpStep::RemovePeer { store_id: 1 },
            ],
            Duration::from_secs(600),
        );

        // Nothing applied yet: the first step is pending.
        assert_eq!(
            op.advance(&before),
            Some(&OpStep::AddPeer {
                store_id: 3,
                peer_id: 300
            })
        );

        // After the peer appears the plan moves to removal.
        let mut mid = region(&[1, 2]);
        mid.meta.peers.push(Peer::voter(300, 3));
        assert_eq!(op.advance(&mid), Some(&OpStep::RemovePeer { store_id: 1 }));

        // Once the source peer is gone the operator is finished.
        let mut done = region(&[2]);
        done.meta.peers.push(Peer::voter(300, 3));
        assert_eq!(op.advance(&done), None);
        assert!(op.is_finished());
    }

    #[test]
    fn transfer_leader_step_completion() {
        let r = region(&[1, 2]);
        let step = OpStep::TransferLeader {
            from_store: 1,
            to_store: 2,
        };
        assert!(!step.is_finished(&r));
        let mut moved = region(&[1, 2]);
        moved.leader = moved.meta.peers.iter().find(|p| p.store_id == 2).copied();
        assert!(step.is_finished(&moved));
    }

    #[test]
    fn influence_projects_remaining_steps() {
        let r = region(&[1, 2]);
        let op = Operator::new(
            "balance-range-scheduler",
            &r,
            OpKind::Range,
            OpPriority::Medium,
            vec![
                OpStep::AddPeer {
                    store_id: 3,
                    peer_id: 300,
                },
                OpStep::TransferLeader {
                    from_store: 1,
                    to_store: 3,
                },
                OpStep::RemovePeer { store_id: 1 },
            ],
            Duration::from_secs(600),
        );
        let mut influence = OpInfluence::default();
        op.apply_influence(&mut influence);
        assert_eq!(influence.get_store_influence(3).region_count, 1);
        assert_eq!(influence.get_store_influence(3).leader_count, 1);
        assert_eq!(influence.get_store_influence(1).region_count, -1);
        assert_eq!(influence.get_store_influence(1).leader_count, -1);
        assert_eq!(influence.get_store_influence(2), StoreInfluence::default());
    }

    #[test]
    fn priority_ordering() {
        assert!(OpPriority::High > OpPriority::Medium);
        assert!(OpPriority::Medium > OpPriority::Low);
    }

    #[test]
    fn expiry_counts_from_acceptance() {
        let r = region(&[1]);
        let mut op = Operator::new(
            "admin",
            &r,
            OpKind::Admin,
            OpPriority::High,
            vec![OpStep::TransferLeader {
                from_store: 1,
                to_store: 2,
            }],
            Duration::from_millis(0),
        );
        assert!(!op.is_expired());
        op.started_at = Some(Instant::now() - Duration::from_millis(5));
        assert!(op.is_expired());
    }
}
