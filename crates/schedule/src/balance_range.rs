//! Balance-range scheduler: run-to-completion jobs that scatter leaders,
//! peers, or learners evenly across stores within chosen key ranges.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rk_common::metrics::global_metrics;
use rk_common::{KeyRange, Result, RkError};
use rk_core::{PeerRole, RegionInfo, RegionRole, StoreInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::OperatorController;
use crate::filter::{
    select_one_region, select_source_stores, select_target_stores, EngineFilter, ExcludedFilter,
    RegionDownFilter, RegionFilter, RegionPendingFilter, RegionReplicatedFilter, SnapshotFilter,
    StoreFilter, StoreStateFilter,
};
use crate::operator::{OpKind, OpPriority, OpStep, Operator};
use crate::scheduler::{Plan, Scheduler, SchedulerCluster};

/// Registry name of the balance-range scheduler.
pub const BALANCE_RANGE_SCHEDULER_NAME: &str = "balance-range-scheduler";

/// Default run budget for one job.
const DEFAULT_JOB_TIMEOUT_MS: u64 = 30 * 60 * 1000;
/// Completed jobs are retained this long before garbage collection.
const RESERVE_DURATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Fraction of the total score tolerated as imbalance.
const ADJUST_RATIO: f64 = 0.05;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What a job scatters within its ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobRule {
    /// Spread region leadership.
    #[serde(rename = "leader-scatter")]
    LeaderScatter,
    /// Spread voter peers.
    #[serde(rename = "peer-scatter")]
    PeerScatter,
    /// Spread learner peers.
    #[serde(rename = "learner-scatter")]
    LearnerScatter,
}

impl JobRule {
    fn role(self) -> RegionRole {
        match self {
            JobRule::LeaderScatter => RegionRole::Leader,
            JobRule::PeerScatter => RegionRole::Follower,
            JobRule::LearnerScatter => RegionRole::Learner,
        }
    }
}

/// Engine a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEngine {
    /// Row stores.
    Tikv,
    /// Columnar stores.
    Tiflash,
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued behind older jobs.
    Pending,
    /// Currently driving operators.
    Running,
    /// Ran to completion or timed out.
    Finished,
    /// Deleted before completion.
    Cancelled,
}

/// One run-to-completion balancing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRangeJob {
    /// Auto-incremented id.
    #[serde(rename = "job-id")]
    pub job_id: u64,
    /// What to scatter.
    pub rule: JobRule,
    /// Engine the job targets.
    pub engine: JobEngine,
    /// Unique alias across non-completed jobs.
    pub alias: String,
    /// Run budget in milliseconds.
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
    /// Ranges the job balances within.
    pub ranges: Vec<KeyRange>,
    /// Creation time, unix milliseconds.
    #[serde(rename = "create-ms")]
    pub create_at_ms: u64,
    /// When the job entered Running.
    #[serde(rename = "start-ms", skip_serializing_if = "Option::is_none")]
    pub start_at_ms: Option<u64>,
    /// When the job completed.
    #[serde(rename = "finish-ms", skip_serializing_if = "Option::is_none")]
    pub finish_at_ms: Option<u64>,
    /// Lifecycle state.
    pub status: JobStatus,
}

impl BalanceRangeJob {
    fn is_complete(&self) -> bool {
        matches!(self.status, JobStatus::Finished | JobStatus::Cancelled)
    }

    fn expired(&self, retention_ms: u64, now: u64) -> bool {
        match self.finish_at_ms {
            Some(finish) => now.saturating_sub(finish) > retention_ms,
            None => false,
        }
    }
}

/// Request to add one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// What to scatter.
    pub rule: JobRule,
    /// Engine the job targets.
    pub engine: JobEngine,
    /// Unique alias across non-completed jobs.
    pub alias: String,
    /// Run budget in milliseconds; defaults to 30 minutes.
    #[serde(rename = "timeout-ms", default)]
    pub timeout_ms: Option<u64>,
    /// Ranges the job balances within.
    pub ranges: Vec<KeyRange>,
}

/// Range-targeted balancing scheduler driven by its job queue.
pub struct BalanceRangeScheduler {
    controller: Arc<OperatorController>,
    jobs: Mutex<Vec<BalanceRangeJob>>,
    /// Set when the job list changed and should be re-persisted.
    dirty: AtomicBool,
}

impl BalanceRangeScheduler {
    /// An empty scheduler submitting through `controller`.
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            controller,
            jobs: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Queues one job; the alias must be unique among non-completed jobs.
    pub fn add_job(&self, spec: JobSpec) -> Result<u64> {
        if spec.ranges.is_empty() {
            return Err(RkError::InvalidValue(
                "job requires at least one key range".to_string(),
            ));
        }
        let mut jobs = self.jobs.lock().expect("jobs lock");
        if jobs
            .iter()
            .any(|j| !j.is_complete() && j.alias == spec.alias)
        {
            return Err(RkError::InvalidValue("job already exists".to_string()));
        }
        let job_id = jobs.last().map(|j| j.job_id + 1).unwrap_or(1);
        info!(
            job_id,
            alias = %spec.alias,
            operator = "BalanceRangeAddJob",
            "add balance key range job"
        );
        jobs.push(BalanceRangeJob {
            job_id,
            rule: spec.rule,
            engine: spec.engine,
            alias: spec.alias,
            timeout_ms: spec.timeout_ms.unwrap_or(DEFAULT_JOB_TIMEOUT_MS),
            ranges: spec.ranges,
            create_at_ms: now_ms(),
            start_at_ms: None,
            finish_at_ms: None,
            status: JobStatus::Pending,
        });
        self.dirty.store(true, Ordering::SeqCst);
        Ok(job_id)
    }

    /// Cancels a job that has not completed yet.
    pub fn delete_job(&self, job_id: u64) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let job = jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| RkError::InvalidValue(format!("job {job_id} not found")))?;
        if job.is_complete() {
            return Err(RkError::InvalidValue(format!(
                "the job {job_id} has been completed and cannot be cancelled"
            )));
        }
        let now = now_ms();
        job.status = JobStatus::Cancelled;
        job.start_at_ms.get_or_insert(now);
        job.finish_at_ms = Some(now);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Snapshot of every known job.
    pub fn list_jobs(&self) -> Vec<BalanceRangeJob> {
        self.jobs.lock().expect("jobs lock").clone()
    }

    /// One job by id.
    pub fn get_job(&self, job_id: u64) -> Option<BalanceRangeJob> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned()
    }

    /// Clears and returns the pending-persist flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Drops completed jobs past their retention, oldest-first.
    fn gc(&self) {
        let now = now_ms();
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let mut cut = 0;
        for job in jobs.iter() {
            // Jobs run in submission order, so GC stops at the first job
            // still worth retaining.
            if job.is_complete() && job.expired(RESERVE_DURATION_MS, now) {
                cut += 1;
            } else {
                break;
            }
        }
        if cut > 0 {
            jobs.drain(..cut);
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Oldest non-completed job, if any.
    fn peek(&self) -> Option<BalanceRangeJob> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .iter()
            .find(|j| !j.is_complete())
            .cloned()
    }

    fn set_status(&self, job_id: u64, status: JobStatus) {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        if let Some(job) = jobs.iter_mut().find(|j| j.job_id == job_id) {
            let now = now_ms();
            match status {
                JobStatus::Running => {
                    job.start_at_ms = Some(now);
                }
                JobStatus::Finished | JobStatus::Cancelled => {
                    job.finish_at_ms = Some(now);
                }
                JobStatus::Pending => {}
            }
            job.status = status;
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    fn transfer_peer(
        &self,
        cluster: &dyn SchedulerCluster,
        job: &BalanceRangeJob,
        region: &RegionInfo,
        source: &StoreInfo,
        dst_stores: &[StoreInfo],
        scores: &ScoreBoard,
    ) -> Option<Operator> {
        let mut excluded: HashSet<u64> = region.store_ids().into_iter().collect();
        if job.rule == JobRule::LeaderScatter {
            excluded = region.leader_store_id().into_iter().collect();
        }
        let config = cluster.schedule_config();
        let state_filter = StoreStateFilter {
            disconnect_threshold: Duration::from_millis(config.store_disconnect_duration_ms),
        };
        let engine_filter = match job.engine {
            JobEngine::Tikv => EngineFilter::tikv(),
            JobEngine::Tiflash => EngineFilter::tiflash(),
        };
        let excluded_filter = ExcludedFilter::new(excluded);
        let filters: Vec<&dyn StoreFilter> = vec![
            &state_filter,
            &engine_filter,
            &excluded_filter,
            &SnapshotFilter,
        ];
        let candidates = select_target_stores(dst_stores.to_vec(), &filters);

        // Targets ascend by score: the emptiest store is tried first.
        for target in candidates.iter().rev() {
            let target_score = scores.score(target.id());
            if target_score > scores.average {
                break;
            }
            if !scores.should_balance(source.id(), target.id(), job.rule.role()) {
                debug!(
                    scheduler = BALANCE_RANGE_SCHEDULER_NAME,
                    region_id = region.id(),
                    source_store = source.id(),
                    target_store = target.id(),
                    operator = "BalanceRangeSchedule",
                    "skip balance within tolerance"
                );
                continue;
            }
            let old_peer = region.get_store_peer(source.id())?;
            let exist = job.rule == JobRule::LeaderScatter
                && region.get_store_peer(target.id()).is_some();
            let timeout = Duration::from_millis(config.operator_timeout_ms);
            let op = if exist {
                Operator::new(
                    BALANCE_RANGE_SCHEDULER_NAME,
                    region,
                    OpKind::Range,
                    OpPriority::Medium,
                    vec![OpStep::TransferLeader {
                        from_store: source.id(),
                        to_store: target.id(),
                    }],
                    timeout,
                )
            } else {
                let peer_id = cluster.alloc_peer_id();
                let add_step = if old_peer.role == PeerRole::Learner {
                    OpStep::AddLearner {
                        store_id: target.id(),
                        peer_id,
                    }
                } else {
                    OpStep::AddPeer {
                        store_id: target.id(),
                        peer_id,
                    }
                };
                let mut steps = vec![add_step];
                if region.leader_store_id() == Some(source.id()) {
                    steps.push(OpStep::TransferLeader {
                        from_store: source.id(),
                        to_store: target.id(),
                    });
                }
                steps.push(OpStep::RemovePeer {
                    store_id: source.id(),
                });
                Operator::new(
                    BALANCE_RANGE_SCHEDULER_NAME,
                    region,
                    OpKind::Range,
                    OpPriority::Medium,
                    steps,
                    timeout,
                )
            };
            global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "new_operator");
            return Some(op);
        }
        global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "no_replacement");
        None
    }
}

/// Per-store scores with operator influence applied.
struct ScoreBoard {
    scores: std::collections::HashMap<u64, i64>,
    influence: crate::operator::OpInfluence,
    average: i64,
    tolerate: i64,
}

impl ScoreBoard {
    fn score(&self, store_id: u64) -> i64 {
        self.scores.get(&store_id).copied().unwrap_or(0)
    }

    fn should_balance(&self, source: u64, target: u64, role: RegionRole) -> bool {
        let source_inf = self.influence.get_store_influence(source).by_role(role).abs();
        let target_inf = self.influence.get_store_influence(target).by_role(role).abs();
        // Influence and tolerance shrink the gap so concurrent operators do
        // not overshoot the average.
        let source_score = self.score(source) - source_inf - self.tolerate;
        let target_score = self.score(target) + target_inf + self.tolerate;
        source_score >= target_score
    }
}

impl Scheduler for BalanceRangeScheduler {
    fn name(&self) -> &str {
        BALANCE_RANGE_SCHEDULER_NAME
    }

    fn kind(&self) -> OpKind {
        OpKind::Range
    }

    fn encode_config(&self) -> Result<Vec<u8>> {
        let jobs = self.jobs.lock().expect("jobs lock");
        serde_json::to_vec(&*jobs).map_err(|e| RkError::Internal(format!("encode jobs: {e}")))
    }

    fn reload_config(&self, raw: &[u8]) -> Result<()> {
        let jobs: Vec<BalanceRangeJob> = serde_json::from_slice(raw)
            .map_err(|e| RkError::Internal(format!("decode jobs: {e}")))?;
        *self.jobs.lock().expect("jobs lock") = jobs;
        Ok(())
    }

    fn is_schedule_allowed(&self, cluster: &dyn SchedulerCluster) -> bool {
        let allowed = self.controller.operator_count(OpKind::Range)
            < cluster.schedule_config().region_schedule_limit;
        if !allowed {
            global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "limit");
        }
        self.gc();
        if let Some(job) = self.peek() {
            if job.status == JobStatus::Pending {
                self.set_status(job.job_id, JobStatus::Running);
                cluster.key_range_manager().append(&job.ranges);
            }
            if let Some(start) = job.start_at_ms {
                if now_ms().saturating_sub(start) > job.timeout_ms {
                    info!(
                        job_id = job.job_id,
                        alias = %job.alias,
                        operator = "BalanceRangeSchedule",
                        "job ran past its timeout"
                    );
                    self.set_status(job.job_id, JobStatus::Finished);
                    cluster.key_range_manager().delete(&job.ranges);
                    global_metrics()
                        .inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "expired_job");
                }
            }
        }
        allowed
    }

    fn schedule(
        &self,
        cluster: &dyn SchedulerCluster,
        _dry_run: bool,
    ) -> (Vec<Operator>, Vec<Plan>) {
        let mut plans = Vec::new();
        let Some(job) = self.peek() else {
            global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "no_job");
            return (vec![], plans);
        };
        let config = cluster.schedule_config();
        let basic = cluster.basic();
        let role = job.rule.role();

        let state_filter = StoreStateFilter {
            disconnect_threshold: Duration::from_millis(config.store_disconnect_duration_ms),
        };
        let engine_filter = match job.engine {
            JobEngine::Tikv => EngineFilter::tikv(),
            JobEngine::Tiflash => EngineFilter::tiflash(),
        };
        let source_filters: Vec<&dyn StoreFilter> = vec![&state_filter, &engine_filter];
        let mut sources = select_source_stores(basic.get_stores(), &source_filters);
        if sources.len() <= 1 {
            plans.push(Plan {
                scheduler: BALANCE_RANGE_SCHEDULER_NAME.to_string(),
                region_id: None,
                reason: "no store to select".to_string(),
            });
            return (vec![], plans);
        }

        let influence = self.controller.op_influence();
        let mut scores = std::collections::HashMap::new();
        let mut total: i64 = 0;
        for source in &sources {
            let mut count = 0usize;
            for range in &job.ranges {
                count += basic.get_store_count_by_range(
                    source.id(),
                    role,
                    &range.start_key,
                    &range.end_key,
                );
            }
            scores.insert(source.id(), count as i64);
            total += count as i64;
        }
        sources.sort_by(|a, b| {
            let a_score = scores.get(&a.id()).copied().unwrap_or(0)
                + influence.get_store_influence(a.id()).by_role(role);
            let b_score = scores.get(&b.id()).copied().unwrap_or(0)
                + influence.get_store_influence(b.id()).by_role(role);
            b_score.cmp(&a_score)
        });
        let board = ScoreBoard {
            average: total / sources.len() as i64,
            tolerate: ((total as f64 * ADJUST_RATIO) as i64).max(1),
            scores,
            influence,
        };

        let down_filter = RegionDownFilter;
        let pending_filter = RegionPendingFilter;
        let replicated_filter = RegionReplicatedFilter {
            replicas: cluster.expected_replicas(),
        };
        let region_filters: Vec<&dyn RegionFilter> =
            vec![&down_filter, &pending_filter, &replicated_filter];

        for (index, source) in sources.iter().enumerate() {
            if board.score(source.id()) < board.average {
                break;
            }
            let region = match job.rule {
                JobRule::LeaderScatter => select_one_region(
                    basic.rand_leader_regions(source.id(), &job.ranges),
                    &region_filters,
                ),
                JobRule::LearnerScatter => select_one_region(
                    basic.rand_learner_regions(source.id(), &job.ranges),
                    &region_filters,
                ),
                JobRule::PeerScatter => select_one_region(
                    basic.rand_follower_regions(source.id(), &job.ranges),
                    &region_filters,
                )
                .or_else(|| {
                    select_one_region(
                        basic.rand_leader_regions(source.id(), &job.ranges),
                        &region_filters,
                    )
                })
                .or_else(|| {
                    select_one_region(
                        basic.rand_learner_regions(source.id(), &job.ranges),
                        &region_filters,
                    )
                }),
            };
            let Some(region) = region else {
                global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "no_region");
                continue;
            };
            debug!(
                scheduler = BALANCE_RANGE_SCHEDULER_NAME,
                region_id = region.id(),
                operator = "BalanceRangeSchedule",
                "select region"
            );
            if cluster.is_region_hot(&region) {
                global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "region_hot");
                continue;
            }
            if region.leader.is_none() {
                warn!(
                    scheduler = BALANCE_RANGE_SCHEDULER_NAME,
                    region_id = region.id(),
                    operator = "BalanceRangeSchedule",
                    "region has no leader"
                );
                global_metrics().inc_scheduler_event(BALANCE_RANGE_SCHEDULER_NAME, "no_leader");
                continue;
            }
            if let Some(op) =
                self.transfer_peer(cluster, &job, &region, source, &sources[index + 1..], &board)
            {
                plans.push(Plan {
                    scheduler: BALANCE_RANGE_SCHEDULER_NAME.to_string(),
                    region_id: Some(region.id()),
                    reason: "operator created".to_string(),
                });
                return (vec![op], plans);
            }
        }
        (vec![], plans)
    }
}

#[cfg(test)]
#[path = "balance_range_tests.rs"]
mod tests;
