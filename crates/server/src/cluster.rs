//! Server-side cluster runtime: wires the in-memory registry, persistence,
//! the operator controller, and the scheduler framework together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rk_common::config::{PdConfig, ScheduleConfig};
use rk_common::{Result, RkError};
use rk_core::{BasicCluster, HeartbeatOutcome, RegionInfo, RegionMeta, StoreMeta, StoreStats};
use rk_schedule::balance_range::BalanceRangeScheduler;
use rk_schedule::operator::{OpKind, OpPriority, OpStep, Operator};
use rk_schedule::scheduler::{Scheduler, SchedulerCluster, SchedulerManager};
use rk_schedule::{KeyRangeManager, OperatorController};
use rk_storage::kv::{Compare, Txn, TxnOp};
use rk_storage::{KvRef, Storage};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Peer ids are pre-fetched from the persisted allocator in blocks this
/// large so the sync scheduling path never waits on storage.
const PEER_ID_BLOCK: u64 = 10_000;

/// Persisted cluster meta record; its presence marks the cluster
/// bootstrapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMeta {
    /// Stable cluster id checked against every request header.
    pub id: u64,
    /// Max voters per region.
    pub max_peer_count: u32,
    /// Cluster version string negotiated with stores.
    pub cluster_version: String,
}

impl Default for ClusterMeta {
    fn default() -> Self {
        Self {
            id: 0,
            max_peer_count: 3,
            cluster_version: "1.0.0".to_string(),
        }
    }
}

/// The serving-side cluster state machine.
pub struct PdCluster {
    cluster_id: u64,
    config: PdConfig,
    schedule_config: ScheduleConfig,
    basic: BasicCluster,
    storage: Storage,
    controller: Arc<OperatorController>,
    schedulers: SchedulerManager,
    balance_range: Arc<BalanceRangeScheduler>,
    key_ranges: KeyRangeManager,
    bootstrapped: AtomicBool,
    /// Pre-fetched peer-id block: next id and the exclusive block end.
    peer_id_next: AtomicU64,
    peer_id_end: AtomicU64,
    /// Latest min-resolved-ts report per store.
    min_resolved: Mutex<HashMap<u64, u64>>,
    external_ts: AtomicU64,
    cluster_meta: Mutex<ClusterMeta>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PdCluster {
    /// Builds the runtime and registers the built-in schedulers.
    pub async fn new(
        kv: KvRef,
        config: PdConfig,
        schedule_config: ScheduleConfig,
    ) -> Result<Arc<Self>> {
        let storage = Storage::new(kv.clone(), config.cluster_name.clone());
        let cluster_id = init_cluster_id(&kv, &config.cluster_name).await?;
        let controller = Arc::new(OperatorController::new(schedule_config.clone()));
        let schedulers = SchedulerManager::new(controller.clone());
        let balance_range = Arc::new(BalanceRangeScheduler::new(controller.clone()));
        schedulers.add_scheduler(balance_range.clone() as Arc<dyn Scheduler>)?;

        let cluster = Arc::new(Self {
            cluster_id,
            config,
            schedule_config: schedule_config.clone(),
            basic: BasicCluster::new(schedule_config.enable_placement_rules),
            storage,
            controller,
            schedulers,
            balance_range,
            key_ranges: KeyRangeManager::new(),
            bootstrapped: AtomicBool::new(false),
            peer_id_next: AtomicU64::new(0),
            peer_id_end: AtomicU64::new(0),
            min_resolved: Mutex::new(HashMap::new()),
            external_ts: AtomicU64::new(0),
            cluster_meta: Mutex::new(ClusterMeta::default()),
        });
        cluster.reload().await?;
        Ok(cluster)
    }

    /// Stable cluster id.
    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Member configuration.
    pub fn config(&self) -> &PdConfig {
        &self.config
    }

    /// The in-memory registry.
    pub fn basic(&self) -> &BasicCluster {
        &self.basic
    }

    /// The persistence facade.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The operator controller.
    pub fn controller(&self) -> &Arc<OperatorController> {
        &self.controller
    }

    /// The scheduler registry.
    pub fn schedulers(&self) -> &SchedulerManager {
        &self.schedulers
    }

    /// The balance-range scheduler's job surface.
    pub fn balance_range(&self) -> &Arc<BalanceRangeScheduler> {
        &self.balance_range
    }

    /// Whether a bootstrap has been observed.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    /// Validates a request's cluster id.
    pub fn check_cluster_id(&self, request_cluster_id: u64) -> Result<()> {
        if request_cluster_id != self.cluster_id {
            return Err(RkError::MismatchClusterId {
                expected: self.cluster_id,
                actual: request_cluster_id,
            });
        }
        Ok(())
    }

    /// Reloads persisted state into memory; called at startup and when this
    /// member becomes leader.
    pub async fn reload(&self) -> Result<()> {
        if let Some(meta) = self.storage.load_cluster_meta::<ClusterMeta>().await? {
            *self.cluster_meta.lock().expect("cluster meta lock") = meta;
            self.bootstrapped.store(true, Ordering::SeqCst);
        }
        let stores: Vec<StoreMeta> = self.storage.load_all_stores().await?;
        for meta in stores {
            // Persisted records were validated on the way in.
            if let Err(err) = self.basic.put_meta_store(meta) {
                warn!(error = %err, operator = "ClusterReload", "skip store record");
            }
        }
        let regions: Vec<RegionMeta> = self.storage.load_all_regions().await?;
        for meta in regions {
            let region = RegionInfo::new(meta, None);
            if let Err(err) = self.basic.handle_region_heartbeat(region) {
                warn!(error = %err, operator = "ClusterReload", "skip region record");
            }
        }
        if let Some(ts) = self.storage.load_external_timestamp().await? {
            self.external_ts.store(ts, Ordering::SeqCst);
        }
        for (name, payload) in self.storage.load_all_scheduler_configs().await? {
            if let Some(scheduler) = self.schedulers.get(&name) {
                if let Err(err) = scheduler.reload_config(&payload) {
                    warn!(
                        scheduler = %name,
                        error = %err,
                        operator = "ClusterReload",
                        "scheduler config reload failed"
                    );
                }
            }
        }
        info!(
            cluster_id = self.cluster_id,
            stores = self.basic.get_stores().len(),
            regions = self.basic.region_count(),
            operator = "ClusterReload",
            "cluster state loaded"
        );
        Ok(())
    }

    /// Bootstraps the cluster with its first store and region.
    pub async fn bootstrap(&self, store: StoreMeta, region: RegionMeta) -> Result<()> {
        let meta = ClusterMeta {
            id: self.cluster_id,
            ..ClusterMeta::default()
        };
        if !self.storage.bootstrap_cluster(&meta).await? {
            return Err(RkError::AlreadyBootstrapped);
        }
        self.basic.put_meta_store(store.clone())?;
        self.storage.save_store(store.id, &store).await?;
        let leader = region.peers.first().copied();
        let region_id = region.id;
        self.basic
            .handle_region_heartbeat(RegionInfo::new(region.clone(), leader))?;
        self.storage.save_region(region_id, &region).await?;
        *self.cluster_meta.lock().expect("cluster meta lock") = meta;
        self.bootstrapped.store(true, Ordering::SeqCst);
        info!(
            cluster_id = self.cluster_id,
            store_id = store.id,
            region_id,
            operator = "ClusterBootstrap",
            "cluster bootstrapped"
        );
        Ok(())
    }

    /// The persisted cluster-wide config record.
    pub fn cluster_meta(&self) -> ClusterMeta {
        self.cluster_meta.lock().expect("cluster meta lock").clone()
    }

    /// Replaces the cluster-wide config record.
    pub async fn put_cluster_meta(&self, mut meta: ClusterMeta) -> Result<()> {
        meta.id = self.cluster_id;
        if meta.max_peer_count == 0 {
            return Err(RkError::InvalidValue(
                "max peer count must be positive".to_string(),
            ));
        }
        self.storage.save_cluster_config(&meta).await?;
        *self.cluster_meta.lock().expect("cluster meta lock") = meta;
        Ok(())
    }

    /// Allocates `count` fresh cluster-unique ids; returns the first.
    pub async fn alloc_id(&self, count: u64) -> Result<u64> {
        if count == 0 {
            return Err(RkError::InvalidValue("alloc count must be positive".to_string()));
        }
        self.storage.alloc_id(count).await
    }

    /// Tops up the pre-fetched peer-id block when it runs low; called from
    /// the async scheduler loop before each tick.
    pub async fn ensure_peer_id_block(&self) -> Result<()> {
        let next = self.peer_id_next.load(Ordering::SeqCst);
        let end = self.peer_id_end.load(Ordering::SeqCst);
        if end.saturating_sub(next) >= PEER_ID_BLOCK / 10 {
            return Ok(());
        }
        let base = self.storage.alloc_id(PEER_ID_BLOCK).await?;
        self.peer_id_next.store(base, Ordering::SeqCst);
        self.peer_id_end.store(base + PEER_ID_BLOCK, Ordering::SeqCst);
        Ok(())
    }

    /// Validates and upserts a store record, then persists it.
    pub async fn put_store(&self, meta: StoreMeta) -> Result<()> {
        self.basic.put_meta_store(meta.clone())?;
        self.storage.save_store(meta.id, &meta).await
    }

    /// Applies one store heartbeat.
    pub fn store_heartbeat(&self, store_id: u64, stats: StoreStats) -> Result<()> {
        self.basic.update_store_stats(store_id, stats)
    }

    /// Reconciles one region heartbeat and returns the next operator step
    /// to piggy-back onto the response, if any.
    pub fn handle_region_heartbeat(&self, region: RegionInfo) -> Result<Option<OpStep>> {
        let outcome = self.basic.handle_region_heartbeat(region.clone())?;
        if let HeartbeatOutcome::Updated { evicted } = &outcome {
            // Persist asynchronously; a crash loses only what the next
            // heartbeat round re-establishes.
            let storage = self.storage.clone();
            let meta = region.meta.clone();
            let evicted = evicted.clone();
            tokio::spawn(async move {
                if let Err(err) = storage.save_region(meta.id, &meta).await {
                    warn!(
                        region_id = meta.id,
                        error = %err,
                        operator = "ClusterRegionHeartbeat",
                        "region persist failed"
                    );
                }
                for id in evicted {
                    let _ = storage.delete_region(id).await;
                }
            });
        }
        Ok(self.controller.check_and_dispatch(&region))
    }

    /// Builds scatter operators for the given regions. Returns how many
    /// were accepted.
    pub fn scatter_regions(&self, region_ids: &[u64], _group: &str) -> Result<(usize, Vec<u64>)> {
        let mut accepted = 0;
        let mut failed = Vec::new();
        for &region_id in region_ids {
            let Some(region) = self.basic.get_region(region_id) else {
                failed.push(region_id);
                continue;
            };
            match self.build_scatter_operator(&region) {
                Some(op) => match self.controller.add_operator(op) {
                    Ok(()) => accepted += 1,
                    Err(err) => {
                        warn!(
                            region_id,
                            error = %err,
                            operator = "ClusterScatter",
                            "scatter operator rejected"
                        );
                        failed.push(region_id);
                    }
                },
                None => failed.push(region_id),
            }
        }
        Ok((accepted, failed))
    }

    fn build_scatter_operator(&self, region: &RegionInfo) -> Option<Operator> {
        let holders: Vec<u64> = region.store_ids();
        let stores = self.basic.get_stores();
        // Spread onto the emptiest up store without a peer; fall back to a
        // leader shuffle when every store already holds one.
        let mut candidates: Vec<_> = stores
            .iter()
            .filter(|s| s.is_up() && !holders.contains(&s.id()))
            .collect();
        candidates.sort_by_key(|s| {
            self.basic
                .get_store_count_by_range(s.id(), rk_core::RegionRole::Follower, b"", b"")
        });
        let timeout = Duration::from_millis(self.schedule_config.operator_timeout_ms);
        if let Some(target) = candidates.first() {
            let peer_id = self.alloc_peer_id();
            return Some(Operator::new(
                "scatter-region",
                region,
                OpKind::Region,
                OpPriority::Medium,
                vec![OpStep::AddPeer {
                    store_id: target.id(),
                    peer_id,
                }],
                timeout,
            ));
        }
        let leader_store = region.leader_store_id()?;
        let target = holders.iter().find(|id| **id != leader_store)?;
        Some(Operator::new(
            "scatter-region",
            region,
            OpKind::Region,
            OpPriority::Medium,
            vec![OpStep::TransferLeader {
                from_store: leader_store,
                to_store: *target,
            }],
            timeout,
        ))
    }

    /// Creates split operators for the regions containing `split_keys`.
    pub fn split_regions(&self, split_keys: &[Vec<u8>]) -> Result<(usize, Vec<u64>)> {
        let mut by_region: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();
        for key in split_keys {
            let Some(region) = self.basic.get_region_by_key(key) else {
                continue;
            };
            by_region.entry(region.id()).or_default().push(key.clone());
        }
        let timeout = Duration::from_millis(self.schedule_config.operator_timeout_ms);
        let mut accepted = 0;
        let mut region_ids = Vec::new();
        for (region_id, keys) in by_region {
            let Some(region) = self.basic.get_region(region_id) else {
                continue;
            };
            let op = Operator::new(
                "split-region",
                &region,
                OpKind::Split,
                OpPriority::High,
                vec![OpStep::SplitRegion { keys }],
                timeout,
            );
            if self.controller.add_operator(op).is_ok() {
                accepted += 1;
                region_ids.push(region_id);
            }
        }
        Ok((accepted, region_ids))
    }

    /// Records one store's min-resolved-ts report and persists the cluster
    /// minimum.
    pub async fn report_min_resolved_ts(&self, store_id: u64, ts: u64) -> Result<()> {
        let min = {
            let mut reports = self.min_resolved.lock().expect("min resolved lock");
            reports.insert(store_id, ts);
            reports.values().copied().min().unwrap_or(0)
        };
        self.storage.save_min_resolved_ts(min).await
    }

    /// Externally-set timestamp visible to clients.
    pub fn external_timestamp(&self) -> u64 {
        self.external_ts.load(Ordering::SeqCst)
    }

    /// Persists a new external timestamp; it must not regress.
    pub async fn set_external_timestamp(&self, ts: u64) -> Result<()> {
        let current = self.external_ts.load(Ordering::SeqCst);
        if ts < current {
            return Err(RkError::InvalidValue(format!(
                "external timestamp {ts} is smaller than now {current}"
            )));
        }
        self.storage.save_external_timestamp(ts).await?;
        self.external_ts.store(ts, Ordering::SeqCst);
        Ok(())
    }

    /// Persists every dirty scheduler config; called from the tick loop.
    pub async fn persist_scheduler_configs(&self) -> Result<()> {
        if !self.balance_range.take_dirty() {
            return Ok(());
        }
        for (name, payload) in self.schedulers.encode_configs() {
            self.storage.save_scheduler_config(&name, payload).await?;
        }
        Ok(())
    }
}

impl SchedulerCluster for PdCluster {
    fn basic(&self) -> &BasicCluster {
        &self.basic
    }

    fn schedule_config(&self) -> ScheduleConfig {
        self.schedule_config.clone()
    }

    fn key_range_manager(&self) -> &KeyRangeManager {
        &self.key_ranges
    }

    fn alloc_peer_id(&self) -> u64 {
        // The async loop keeps the block topped up; falling past the end
        // still hands out ids from the reserved block tail.
        self.peer_id_next.fetch_add(1, Ordering::SeqCst)
    }

    fn expected_replicas(&self) -> usize {
        self.cluster_meta().max_peer_count as usize
    }
}

/// Loads or creates the stable cluster id under the cluster root.
async fn init_cluster_id(kv: &KvRef, cluster_name: &str) -> Result<u64> {
    let key = format!("/{cluster_name}/cluster_id");
    if let Some(raw) = kv.get(&key).await? {
        let text = String::from_utf8_lossy(&raw);
        return text
            .parse::<u64>()
            .map_err(|e| RkError::Internal(format!("decode cluster id: {e}")));
    }
    let candidate = now_ms();
    let outcome = kv
        .txn(
            Txn::new()
                .compare(Compare::NotExists(key.clone()))
                .then(TxnOp::Put {
                    key: key.clone(),
                    value: candidate.to_string().into_bytes(),
                    lease: None,
                }),
        )
        .await?;
    if outcome.succeeded {
        info!(
            cluster_id = candidate,
            operator = "ClusterInit",
            "allocated cluster id"
        );
        return Ok(candidate);
    }
    // Lost the creation race; read the winner's id.
    let raw = kv.get(&key).await?.ok_or(RkError::KvNotStarted)?;
    String::from_utf8_lossy(&raw)
        .parse::<u64>()
        .map_err(|e| RkError::Internal(format!("decode cluster id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_core::{Peer, RegionEpoch, StoreState};
    use rk_storage::MemoryKv;
    use std::collections::BTreeMap;

    async fn cluster() -> Arc<PdCluster> {
        PdCluster::new(
            Arc::new(MemoryKv::new()),
            PdConfig::default(),
            ScheduleConfig::default(),
        )
        .await
        .unwrap()
    }

    fn store_meta(id: u64) -> StoreMeta {
        StoreMeta {
            id,
            address: format!("127.0.0.1:2016{id}"),
            state: StoreState::Up,
            labels: BTreeMap::new(),
        }
    }

    fn region_meta(id: u64, voters: &[u64]) -> RegionMeta {
        RegionMeta {
            id,
            start_key: vec![],
            end_key: vec![],
            epoch: RegionEpoch::new(1, 1),
            peers: voters
                .iter()
                .enumerate()
                .map(|(i, s)| Peer::voter(id * 10 + i as u64, *s))
                .collect(),
        }
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent_error() {
        let cluster = cluster().await;
        assert!(!cluster.is_bootstrapped());
        cluster
            .bootstrap(store_meta(1), region_meta(2, &[1]))
            .await
            .unwrap();
        assert!(cluster.is_bootstrapped());

        let err = cluster
            .bootstrap(store_meta(1), region_meta(2, &[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, RkError::AlreadyBootstrapped));
    }

    #[tokio::test]
    async fn cluster_id_is_stable_across_instances() {
        let kv: KvRef = Arc::new(MemoryKv::new());
        let a = PdCluster::new(kv.clone(), PdConfig::default(), ScheduleConfig::default())
            .await
            .unwrap();
        let b = PdCluster::new(kv, PdConfig::default(), ScheduleConfig::default())
            .await
            .unwrap();
        assert_eq!(a.cluster_id(), b.cluster_id());
        assert!(a.check_cluster_id(a.cluster_id()).is_ok());
        assert!(matches!(
            a.check_cluster_id(a.cluster_id() + 1),
            Err(RkError::MismatchClusterId { .. })
        ));
    }

    #[tokio::test]
    async fn reload_recovers_persisted_state() {
        let kv: KvRef = Arc::new(MemoryKv::new());
        {
            let cluster =
                PdCluster::new(kv.clone(), PdConfig::default(), ScheduleConfig::default())
                    .await
                    .unwrap();
            cluster
                .bootstrap(store_meta(1), region_meta(2, &[1]))
                .await
                .unwrap();
            cluster.put_store(store_meta(3)).await.unwrap();
        }
        let revived = PdCluster::new(kv, PdConfig::default(), ScheduleConfig::default())
            .await
            .unwrap();
        assert!(revived.is_bootstrapped());
        assert!(revived.basic().get_store(3).is_some());
        assert!(revived.basic().get_region(2).is_some());
    }

    #[tokio::test]
    async fn scatter_builds_an_operator_per_region() {
        let cluster = cluster().await;
        cluster
            .bootstrap(store_meta(1), region_meta(10, &[1]))
            .await
            .unwrap();
        cluster.put_store(store_meta(2)).await.unwrap();
        cluster.put_store(store_meta(3)).await.unwrap();
        cluster.ensure_peer_id_block().await.unwrap();

        let (accepted, failed) = cluster.scatter_regions(&[10, 99], "").unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(failed, vec![99]);
        let op = cluster.controller().get_operator(10).unwrap();
        assert_eq!(op.desc, "scatter-region");
    }

    #[tokio::test]
    async fn external_timestamp_never_regresses() {
        let cluster = cluster().await;
        cluster.set_external_timestamp(100).await.unwrap();
        assert_eq!(cluster.external_timestamp(), 100);
        assert!(cluster.set_external_timestamp(99).await.is_err());
        cluster.set_external_timestamp(100).await.unwrap();
    }

    #[tokio::test]
    async fn split_regions_targets_containing_regions() {
        let cluster = cluster().await;
        cluster
            .bootstrap(store_meta(1), region_meta(10, &[1]))
            .await
            .unwrap();
        let (accepted, region_ids) = cluster
            .split_regions(&[b"g".to_vec(), b"n".to_vec()])
            .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(region_ids, vec![10]);
        let op = cluster.controller().get_operator(10).unwrap();
        assert_eq!(op.desc, "split-region");
    }
}
