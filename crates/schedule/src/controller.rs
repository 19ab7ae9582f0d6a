//! The operator controller: tracks in-flight operators, enforces per-kind
//! caps and per-store limits, and dispatches steps onto heartbeats.

use std::collections::HashMap;
use std::sync::Mutex;

use rk_common::config::ScheduleConfig;
use rk_common::metrics::global_metrics;
use rk_common::{Result, RkError};
use rk_core::RegionInfo;
use tracing::{debug, info};

use crate::operator::{OpInfluence, OpKind, OpStep, Operator, OperatorStatus};
use crate::store_limit::{StoreLimitType, StoreLimiter};

struct ControllerInner {
    /// One live operator per region.
    operators: HashMap<u64, Operator>,
    /// Latest terminal operator per region, kept for get-operator queries.
    records: HashMap<u64, Operator>,
}

/// Tracks in-flight operators keyed by region id.
pub struct OperatorController {
    config: ScheduleConfig,
    limiter: StoreLimiter,
    inner: Mutex<ControllerInner>,
}

impl OperatorController {
    /// Builds a controller and its store limiter from the config.
    pub fn new(config: ScheduleConfig) -> Self {
        let limiter = StoreLimiter::new(&config);
        Self {
            config,
            limiter,
            inner: Mutex::new(ControllerInner {
                operators: HashMap::new(),
                records: HashMap::new(),
            }),
        }
    }

    /// The store limiter, exposed for the admin surface.
    pub fn store_limiter(&self) -> &StoreLimiter {
        &self.limiter
    }

    fn kind_limit(&self, kind: OpKind) -> u64 {
        match kind {
            OpKind::Leader => self.config.leader_schedule_limit,
            OpKind::Region | OpKind::Range | OpKind::Split => self.config.region_schedule_limit,
            OpKind::Replica => self.config.replica_schedule_limit,
            OpKind::Merge => self.config.merge_schedule_limit,
            OpKind::Admin => u64::MAX,
        }
    }

    /// Number of live operators of `kind`.
    pub fn operator_count(&self, kind: OpKind) -> u64 {
        let inner = self.inner.lock().expect("controller lock");
        inner
            .operators
            .values()
            .filter(|op| op.kind == kind)
            .count() as u64
    }

    /// Accepts one operator, subject to the per-region slot, the per-kind
    /// cap, and the per-store rate limits.
    pub fn add_operator(&self, mut op: Operator) -> Result<()> {
        let mut inner = self.inner.lock().expect("controller lock");
        let live_of_kind = inner
            .operators
            .values()
            .filter(|o| o.kind == op.kind)
            .count() as u64;
        if live_of_kind >= self.kind_limit(op.kind) {
            global_metrics().inc_operator_event(&op.desc, "limit");
            return Err(RkError::RateLimitExceeded(format!(
                "{} schedule limit reached",
                op.kind.as_str()
            )));
        }

        if let Some(existing) = inner.operators.get(&op.region_id) {
            if op.priority > existing.priority {
                let mut replaced = inner
                    .operators
                    .remove(&op.region_id)
                    .expect("checked entry");
                replaced.status = OperatorStatus::Canceled;
                global_metrics().inc_operator_event(&replaced.desc, "replace");
                info!(
                    region_id = op.region_id,
                    old = %replaced.desc,
                    new = %op.desc,
                    operator = "OperatorAdd",
                    "higher-priority operator replaces the live one"
                );
                inner.records.insert(replaced.region_id, replaced);
            } else {
                return Err(RkError::Internal(format!(
                    "operator for region {} already exists",
                    op.region_id
                )));
            }
        }

        for step in &op.steps {
            let allowed = match step {
                OpStep::AddPeer { store_id, .. } | OpStep::AddLearner { store_id, .. } => {
                    self.limiter.allow(*store_id, StoreLimitType::AddPeer)
                }
                OpStep::RemovePeer { store_id } => {
                    self.limiter.allow(*store_id, StoreLimitType::RemovePeer)
                }
                _ => true,
            };
            if !allowed {
                global_metrics().inc_operator_event(&op.desc, "store_limit");
                return Err(RkError::RateLimitExceeded(format!(
                    "store limit exhausted for step: {step}"
                )));
            }
        }

        op.status = OperatorStatus::Started;
        op.started_at = Some(std::time::Instant::now());
        global_metrics().inc_operator_event(&op.desc, "create");
        let kind = op.kind;
        inner.operators.insert(op.region_id, op);
        let count = inner.operators.values().filter(|o| o.kind == kind).count() as u64;
        global_metrics().set_operators_inflight(kind.as_str(), count);
        Ok(())
    }

    /// Checks the live operator against a fresh heartbeat and returns the
    /// next step to piggy-back onto the response.
    ///
    /// Cancels the operator when the region's geometry version advanced
    /// past the one it was planned against (and the plan is not itself a
    /// split or merge); retires it on expiry or completion.
    pub fn check_and_dispatch(&self, region: &RegionInfo) -> Option<OpStep> {
        let mut inner = self.inner.lock().expect("controller lock");
        let op = inner.operators.get_mut(&region.id())?;

        let geometry_step = op
            .steps
            .iter()
            .any(|s| matches!(s, OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. }));
        if !geometry_step && region.epoch().version > op.region_epoch.version {
            let mut canceled = inner
                .operators
                .remove(&region.id())
                .expect("checked entry");
            canceled.status = OperatorStatus::Canceled;
            global_metrics().inc_operator_event(&canceled.desc, "cancel");
            debug!(
                region_id = region.id(),
                operator = "OperatorCheck",
                "epoch advanced unexpectedly, operator canceled"
            );
            inner.records.insert(region.id(), canceled);
            return None;
        }

        if op.is_expired() {
            let mut expired = inner
                .operators
                .remove(&region.id())
                .expect("checked entry");
            expired.status = OperatorStatus::Expired;
            global_metrics().inc_operator_event(&expired.desc, "expire");
            inner.records.insert(region.id(), expired);
            return None;
        }

        match op.advance(region).cloned() {
            Some(step) => Some(step),
            None => {
                let mut finished = inner
                    .operators
                    .remove(&region.id())
                    .expect("checked entry");
                finished.status = OperatorStatus::Success;
                global_metrics().inc_operator_event(&finished.desc, "finish");
                info!(
                    region_id = region.id(),
                    desc = %finished.desc,
                    operator = "OperatorCheck",
                    "operator finished"
                );
                inner.records.insert(region.id(), finished);
                None
            }
        }
    }

    /// The live or most recent terminal operator for a region.
    pub fn get_operator(&self, region_id: u64) -> Option<Operator> {
        let mut inner = self.inner.lock().expect("controller lock");
        if let Some(op) = inner.operators.get(&region_id) {
            if op.is_expired() {
                let mut expired = inner
                    .operators
                    .remove(&region_id)
                    .expect("checked entry");
                expired.status = OperatorStatus::Expired;
                global_metrics().inc_operator_event(&expired.desc, "expire");
                let snapshot = expired.clone();
                inner.records.insert(region_id, expired);
                return Some(snapshot);
            }
            return inner.operators.get(&region_id).cloned();
        }
        inner.records.get(&region_id).cloned()
    }

    /// Cancels the live operator for a region, if any.
    pub fn cancel_operator(&self, region_id: u64) -> bool {
        let mut inner = self.inner.lock().expect("controller lock");
        match inner.operators.remove(&region_id) {
            Some(mut op) => {
                op.status = OperatorStatus::Canceled;
                global_metrics().inc_operator_event(&op.desc, "cancel");
                inner.records.insert(region_id, op);
                true
            }
            None => false,
        }
    }

    /// Every live operator.
    pub fn list_operators(&self) -> Vec<Operator> {
        let inner = self.inner.lock().expect("controller lock");
        inner.operators.values().cloned().collect()
    }

    /// Projects the effect of completing every live operator.
    pub fn op_influence(&self) -> OpInfluence {
        let inner = self.inner.lock().expect("controller lock");
        let mut influence = OpInfluence::default();
        for op in inner.operators.values() {
            op.apply_influence(&mut influence);
        }
        influence
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
