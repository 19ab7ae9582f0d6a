//! The scheduler framework: pluggable policies ticked on an interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rk_common::config::ScheduleConfig;
use rk_common::metrics::global_metrics;
use rk_common::{Result, RkError};
use rk_core::{BasicCluster, RegionInfo};
use tracing::{debug, info};

use crate::controller::OperatorController;
use crate::key_range_manager::KeyRangeManager;
use crate::operator::{OpKind, Operator};

/// Flow rate above which a region counts as hot and is skipped by the
/// balancing schedulers, bytes per reporting interval.
const HOT_REGION_FLOW_THRESHOLD: u64 = 60 * 1024 * 1024;

/// Read-only cluster handle given to schedulers on each tick.
pub trait SchedulerCluster: Send + Sync {
    /// The store/region registry.
    fn basic(&self) -> &BasicCluster;

    /// Current scheduling config snapshot.
    fn schedule_config(&self) -> ScheduleConfig;

    /// Ranges claimed by running range jobs.
    fn key_range_manager(&self) -> &KeyRangeManager;

    /// Allocates an id for a peer an operator is about to add.
    fn alloc_peer_id(&self) -> u64;

    /// Whether the region's flow marks it hot.
    fn is_region_hot(&self, region: &RegionInfo) -> bool {
        region.written_bytes + region.read_bytes > HOT_REGION_FLOW_THRESHOLD
    }

    /// Expected voter count per region.
    fn expected_replicas(&self) -> usize {
        3
    }
}

/// Why a scheduler produced no operator for a candidate.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Producing scheduler.
    pub scheduler: String,
    /// Candidate region, when one was selected.
    pub region_id: Option<u64>,
    /// Human-readable reason.
    pub reason: String,
}

/// A long-lived scheduling policy.
pub trait Scheduler: Send + Sync {
    /// Unique scheduler name; also the persistence key for its config.
    fn name(&self) -> &str;

    /// Operator kind used for limit accounting.
    fn kind(&self) -> OpKind;

    /// Serializes the current config for persistence.
    fn encode_config(&self) -> Result<Vec<u8>>;

    /// Replaces the in-memory config from its persisted form.
    fn reload_config(&self, raw: &[u8]) -> Result<()>;

    /// Gate evaluated before each tick; also the place for cheap
    /// housekeeping like job state transitions.
    fn is_schedule_allowed(&self, cluster: &dyn SchedulerCluster) -> bool;

    /// Produces operators (and diagnostic plans) from the cluster state.
    fn schedule(&self, cluster: &dyn SchedulerCluster, dry_run: bool)
        -> (Vec<Operator>, Vec<Plan>);
}

struct Entry {
    scheduler: Arc<dyn Scheduler>,
    paused: bool,
}

/// Holds registered schedulers and runs them against the controller.
pub struct SchedulerManager {
    controller: Arc<OperatorController>,
    inner: Mutex<HashMap<String, Entry>>,
}

impl SchedulerManager {
    /// An empty manager submitting into `controller`.
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self {
            controller,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The operator controller schedulers submit into.
    pub fn controller(&self) -> &Arc<OperatorController> {
        &self.controller
    }

    /// Registers a scheduler under its unique name.
    pub fn add_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> Result<()> {
        let mut inner = self.inner.lock().expect("scheduler manager lock");
        let name = scheduler.name().to_string();
        if inner.contains_key(&name) {
            return Err(RkError::SchedulerExisted(name));
        }
        info!(scheduler = %name, operator = "SchedulerAdd", "scheduler registered");
        inner.insert(name, Entry {
            scheduler,
            paused: false,
        });
        Ok(())
    }

    /// Unregisters a scheduler; the caller also removes its persisted
    /// config.
    pub fn remove_scheduler(&self, name: &str) -> Result<Arc<dyn Scheduler>> {
        let mut inner = self.inner.lock().expect("scheduler manager lock");
        let entry = inner
            .remove(name)
            .ok_or_else(|| RkError::SchedulerNotFound(name.to_string()))?;
        info!(scheduler = %name, operator = "SchedulerRemove", "scheduler removed");
        Ok(entry.scheduler)
    }

    /// Pauses or resumes a scheduler; paused schedulers are retained but
    /// skipped on tick.
    pub fn set_paused(&self, name: &str, paused: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("scheduler manager lock");
        let entry = inner
            .get_mut(name)
            .ok_or_else(|| RkError::SchedulerNotFound(name.to_string()))?;
        entry.paused = paused;
        Ok(())
    }

    /// A registered scheduler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.inner
            .lock()
            .expect("scheduler manager lock")
            .get(name)
            .map(|e| e.scheduler.clone())
    }

    /// Registered scheduler names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .expect("scheduler manager lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Serialized configs of every registered scheduler, for persistence.
    pub fn encode_configs(&self) -> Vec<(String, Vec<u8>)> {
        let inner = self.inner.lock().expect("scheduler manager lock");
        let mut out = Vec::with_capacity(inner.len());
        for (name, entry) in inner.iter() {
            if let Ok(payload) = entry.scheduler.encode_config() {
                out.push((name.clone(), payload));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Runs one tick over every enabled scheduler, submitting produced
    /// operators to the controller. Returns how many were accepted.
    pub fn tick(&self, cluster: &dyn SchedulerCluster) -> usize {
        let schedulers: Vec<(String, Arc<dyn Scheduler>, bool)> = {
            let inner = self.inner.lock().expect("scheduler manager lock");
            let mut entries: Vec<_> = inner
                .iter()
                .map(|(name, e)| (name.clone(), e.scheduler.clone(), e.paused))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        let mut accepted = 0;
        for (name, scheduler, paused) in schedulers {
            if paused {
                global_metrics().inc_scheduler_event(&name, "paused");
                continue;
            }
            if !scheduler.is_schedule_allowed(cluster) {
                global_metrics().inc_scheduler_event(&name, "not_allowed");
                continue;
            }
            global_metrics().inc_scheduler_event(&name, "schedule");
            let (operators, plans) = scheduler.schedule(cluster, false);
            for plan in &plans {
                debug!(
                    scheduler = %plan.scheduler,
                    region_id = plan.region_id,
                    reason = %plan.reason,
                    operator = "SchedulerTick",
                    "no operator produced"
                );
            }
            for op in operators {
                match self.controller.add_operator(op) {
                    Ok(()) => accepted += 1,
                    Err(err) => {
                        debug!(
                            scheduler = %name,
                            error = %err,
                            operator = "SchedulerTick",
                            "operator rejected by controller"
                        );
                        global_metrics().inc_scheduler_event(&name, "operator_rejected");
                    }
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::operator::{OpPriority, OpStep};
    use rk_core::{Peer, RegionEpoch, RegionMeta};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Minimal cluster handle for framework tests.
    pub(crate) struct TestCluster {
        pub basic: BasicCluster,
        pub config: ScheduleConfig,
        pub ranges: KeyRangeManager,
        pub next_id: AtomicU64,
    }

    impl TestCluster {
        pub(crate) fn new() -> Self {
            Self {
                basic: BasicCluster::new(true),
                config: ScheduleConfig::default(),
                ranges: KeyRangeManager::new(),
                next_id: AtomicU64::new(10_000),
            }
        }
    }

    impl SchedulerCluster for TestCluster {
        fn basic(&self) -> &BasicCluster {
            &self.basic
        }

        fn schedule_config(&self) -> ScheduleConfig {
            self.config.clone()
        }

        fn key_range_manager(&self) -> &KeyRangeManager {
            &self.ranges
        }

        fn alloc_peer_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    struct StaticScheduler {
        produced: Mutex<Vec<Operator>>,
    }

    impl Scheduler for StaticScheduler {
        fn name(&self) -> &str {
            "static-scheduler"
        }

        fn kind(&self) -> OpKind {
            OpKind::Leader
        }

        fn encode_config(&self) -> Result<Vec<u8>> {
            Ok(b"{}".to_vec())
        }

        fn reload_config(&self, _raw: &[u8]) -> Result<()> {
            Ok(())
        }

        fn is_schedule_allowed(&self, _cluster: &dyn SchedulerCluster) -> bool {
            true
        }

        fn schedule(
            &self,
            _cluster: &dyn SchedulerCluster,
            _dry_run: bool,
        ) -> (Vec<Operator>, Vec<Plan>) {
            (std::mem::take(&mut *self.produced.lock().unwrap()), vec![])
        }
    }

    fn transfer_op(region_id: u64) -> Operator {
        let peers = vec![Peer::voter(1, 1), Peer::voter(2, 2)];
        let region = RegionInfo::new(
            RegionMeta {
                id: region_id,
                start_key: vec![region_id as u8],
                end_key: vec![region_id as u8 + 1],
                epoch: RegionEpoch::new(1, 1),
                peers: peers.clone(),
            },
            Some(peers[0]),
        );
        Operator::new(
            "static-scheduler",
            &region,
            OpKind::Leader,
            OpPriority::Medium,
            vec![OpStep::TransferLeader {
                from_store: 1,
                to_store: 2,
            }],
            Duration::from_secs(600),
        )
    }

    #[test]
    fn registration_is_unique_and_removal_is_checked() {
        let manager = SchedulerManager::new(Arc::new(OperatorController::new(
            ScheduleConfig::default(),
        )));
        let scheduler = Arc::new(StaticScheduler {
            produced: Mutex::new(vec![]),
        });
        manager.add_scheduler(scheduler.clone()).unwrap();
        assert!(matches!(
            manager.add_scheduler(scheduler),
            Err(RkError::SchedulerExisted(_))
        ));

        manager.remove_scheduler("static-scheduler").unwrap();
        // The second remove reports the scheduler as unknown.
        assert!(matches!(
            manager.remove_scheduler("static-scheduler"),
            Err(RkError::SchedulerNotFound(_))
        ));
    }

    #[test]
    fn tick_submits_operators_and_respects_pause() {
        let manager = SchedulerManager::new(Arc::new(OperatorController::new(
            ScheduleConfig::default(),
        )));
        let scheduler = Arc::new(StaticScheduler {
            produced: Mutex::new(vec![transfer_op(1)]),
        });
        manager.add_scheduler(scheduler.clone()).unwrap();
        let cluster = TestCluster::new();

        manager.set_paused("static-scheduler", true).unwrap();
        assert_eq!(manager.tick(&cluster), 0);
        // The paused scheduler kept its pending work.
        assert_eq!(scheduler.produced.lock().unwrap().len(), 1);

        manager.set_paused("static-scheduler", false).unwrap();
        assert_eq!(manager.tick(&cluster), 1);
        assert_eq!(manager.controller().operator_count(OpKind::Leader), 1);
    }

    #[test]
    fn configs_are_encoded_per_scheduler() {
        let manager = SchedulerManager::new(Arc::new(OperatorController::new(
            ScheduleConfig::default(),
        )));
        manager
            .add_scheduler(Arc::new(StaticScheduler {
                produced: Mutex::new(vec![]),
            }))
            .unwrap();
        let configs = manager.encode_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, "static-scheduler");
    }
}
