//! The gRPC front-end: per-method rate limiting, transparent forwarding,
//! role validation, and dispatch into the cluster runtime.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::Stream;
use rk_common::{Result, RkError};
use rk_core::Buckets;
use rk_schedule::operator::OperatorStatus as CoreOperatorStatus;
use rk_storage::{Election, KvRef};
use rk_tso::TimestampOracle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::cluster::{ClusterMeta, PdCluster};
use crate::forward::{forwarded_host, set_forwarded_host, ConnectionPool};
use crate::grpc::{self, v1, PlacementDriver};
use crate::heartbeat::{HeartbeatStreams, RegionHeartbeatWorker};
use crate::tso_stream::TsoHandler;

/// Per-method in-flight limiter checked at the top of every endpoint.
///
/// Methods without a configured cap pass through untouched.
pub struct ServiceLimiter {
    caps: Mutex<HashMap<String, usize>>,
    inflight: Mutex<HashMap<String, usize>>,
}

/// Releases the method slot on drop.
pub struct InflightGuard<'a> {
    limiter: &'a ServiceLimiter,
    method: Option<String>,
}

impl ServiceLimiter {
    /// A limiter with no caps configured.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            caps: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Caps one method's concurrent requests; 0 removes the cap.
    pub fn set_limit(&self, method: &str, max_inflight: usize) {
        let mut caps = self.caps.lock().expect("limiter lock");
        if max_inflight == 0 {
            caps.remove(method);
        } else {
            caps.insert(method.to_string(), max_inflight);
        }
    }

    /// Takes one slot for `method`, failing fast when the cap is reached.
    pub fn check(&self, method: &str) -> Result<InflightGuard<'_>> {
        let cap = self
            .caps
            .lock()
            .expect("limiter lock")
            .get(method)
            .copied();
        let Some(cap) = cap else {
            return Ok(InflightGuard {
                limiter: self,
                method: None,
            });
        };
        let mut inflight = self.inflight.lock().expect("limiter lock");
        let count = inflight.entry(method.to_string()).or_insert(0);
        if *count >= cap {
            return Err(RkError::RateLimitExceeded(format!(
                "method {method} concurrency {cap} reached"
            )));
        }
        *count += 1;
        Ok(InflightGuard {
            limiter: self,
            method: Some(method.to_string()),
        })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(method) = self.method.take() {
            let mut inflight = self.limiter.inflight.lock().expect("limiter lock");
            if let Some(count) = inflight.get_mut(&method) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// The placement-driver gRPC service.
pub struct PdService {
    /// Shared cluster runtime.
    pub cluster: Arc<PdCluster>,
    /// Leadership handle.
    pub election: Arc<Election>,
    /// Local timestamp allocator.
    pub oracle: Arc<TimestampOracle>,
    /// Store-to-stream heartbeat bindings.
    pub hb_streams: Arc<HeartbeatStreams>,
    /// Shared forward connection pool.
    pub pool: Arc<ConnectionPool>,
    /// TSO stream dispatch.
    pub tso_handler: Arc<TsoHandler>,
    /// Per-method rate limiter.
    pub limiter: Arc<ServiceLimiter>,
    /// Whether heartbeats are mirrored to the scheduling service.
    pub scheduling_enabled: bool,
    /// Backing KV for primary-address resolution.
    pub kv: KvRef,
}

type StreamOf<T> = Pin<Box<dyn Stream<Item = std::result::Result<T, Status>> + Send>>;

impl PdService {
    fn header(&self) -> v1::ResponseHeader {
        grpc::wrap_header(self.cluster.cluster_id())
    }

    fn err_header(&self, err: &RkError) -> v1::ResponseHeader {
        grpc::header_from_error(self.cluster.cluster_id(), err)
    }

    /// The forward target when a marker points at another member.
    fn forward_target<T>(&self, request: &Request<T>) -> Option<String> {
        forwarded_host(request.metadata())
            .filter(|host| host != self.election.identity())
    }

    /// Validates cluster id and leader role for a leader-only endpoint.
    fn validate(&self, header: Option<&v1::RequestHeader>) -> std::result::Result<(), Status> {
        let cluster_id = header.map(|h| h.cluster_id).unwrap_or_default();
        self.cluster
            .check_cluster_id(cluster_id)
            .map_err(grpc::to_status)?;
        if !self.election.is_serving() {
            return Err(grpc::to_status(RkError::NotLeader(
                self.election.leader_address().unwrap_or_default(),
            )));
        }
        Ok(())
    }

    fn rate_limit(&self, method: &str) -> std::result::Result<InflightGuard<'_>, Status> {
        self.limiter.check(method).map_err(grpc::to_status)
    }

    async fn forward_unary<Req, Resp, Fut, F>(
        &self,
        host: String,
        req: Req,
        call: F,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        F: FnOnce(grpc::PlacementDriverClient<tonic::transport::Channel>, Request<Req>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        let client = self.pool.pd_client(&host).await.map_err(grpc::to_status)?;
        let mut out = Request::new(req);
        set_forwarded_host(&mut out, &host);
        call(client, out).await
    }
}

#[tonic::async_trait]
impl PlacementDriver for PdService {
    type TsoStream = StreamOf<v1::TsoResponse>;

    async fn tso(
        &self,
        request: Request<Streaming<v1::TsoRequest>>,
    ) -> std::result::Result<Response<Self::TsoStream>, Status> {
        let _guard = self.rate_limit("Tso")?;
        let forwarded = self.forward_target(&request);
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        self.tso_handler.clone().handle(forwarded, inbound, tx)?;
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn bootstrap(
        &self,
        request: Request<v1::BootstrapRequest>,
    ) -> std::result::Result<Response<v1::BootstrapResponse>, Status> {
        let _guard = self.rate_limit("Bootstrap")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move { c.bootstrap(r).await })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let Some(store) = req.store else {
            return Err(Status::invalid_argument("bootstrap request has no store"));
        };
        let Some(region) = req.region else {
            return Err(Status::invalid_argument("bootstrap request has no region"));
        };
        let store = grpc::store_meta_from_proto(store).map_err(grpc::to_status)?;
        let region = grpc::region_meta_from_proto(region);
        let header = match self.cluster.bootstrap(store, region).await {
            Ok(()) => self.header(),
            Err(err) => self.err_header(&err),
        };
        Ok(Response::new(v1::BootstrapResponse {
            header: Some(header),
        }))
    }

    async fn is_bootstrapped(
        &self,
        request: Request<v1::IsBootstrappedRequest>,
    ) -> std::result::Result<Response<v1::IsBootstrappedResponse>, Status> {
        let _guard = self.rate_limit("IsBootstrapped")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.is_bootstrapped(r).await
                })
                .await;
        }
        let _req = request.into_inner();
        Ok(Response::new(v1::IsBootstrappedResponse {
            header: Some(self.header()),
            bootstrapped: self.cluster.is_bootstrapped(),
        }))
    }

    async fn alloc_id(
        &self,
        request: Request<v1::AllocIdRequest>,
    ) -> std::result::Result<Response<v1::AllocIdResponse>, Status> {
        let _guard = self.rate_limit("AllocId")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move { c.alloc_id(r).await })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let count = u64::from(req.count.max(1));
        match self.cluster.alloc_id(count).await {
            Ok(id) => Ok(Response::new(v1::AllocIdResponse {
                header: Some(self.header()),
                id,
                count: count as u32,
            })),
            Err(err) => Ok(Response::new(v1::AllocIdResponse {
                header: Some(self.err_header(&err)),
                id: 0,
                count: 0,
            })),
        }
    }

    async fn get_members(
        &self,
        request: Request<v1::GetMembersRequest>,
    ) -> std::result::Result<Response<v1::GetMembersResponse>, Status> {
        let _guard = self.rate_limit("GetMembers")?;
        let _req = request.into_inner();
        let leader_addr = self.election.leader_address();
        let me = v1::Member {
            name: self.election.identity().to_string(),
            client_url: self.election.identity().to_string(),
            is_leader: self.election.is_serving(),
        };
        let leader = leader_addr.map(|addr| v1::Member {
            name: addr.clone(),
            client_url: addr,
            is_leader: true,
        });
        Ok(Response::new(v1::GetMembersResponse {
            header: Some(self.header()),
            members: vec![me],
            leader,
        }))
    }

    async fn get_store(
        &self,
        request: Request<v1::GetStoreRequest>,
    ) -> std::result::Result<Response<v1::GetStoreResponse>, Status> {
        let _guard = self.rate_limit("GetStore")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move { c.get_store(r).await })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        if !self.cluster.is_bootstrapped() {
            return Ok(Response::new(v1::GetStoreResponse {
                header: Some(grpc::not_bootstrapped_header(self.cluster.cluster_id())),
                store: None,
                stats: None,
            }));
        }
        match self.cluster.basic().get_store(req.store_id) {
            Some(store) => Ok(Response::new(v1::GetStoreResponse {
                header: Some(self.header()),
                stats: Some(grpc::stats_to_proto(store.id(), &store.stats)),
                store: Some(grpc::store_to_proto(&store)),
            })),
            None => Ok(Response::new(v1::GetStoreResponse {
                header: Some(self.err_header(&RkError::StoreNotFound(req.store_id))),
                store: None,
                stats: None,
            })),
        }
    }

    async fn put_store(
        &self,
        request: Request<v1::PutStoreRequest>,
    ) -> std::result::Result<Response<v1::PutStoreResponse>, Status> {
        let _guard = self.rate_limit("PutStore")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move { c.put_store(r).await })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        if !self.cluster.is_bootstrapped() {
            return Ok(Response::new(v1::PutStoreResponse {
                header: Some(grpc::not_bootstrapped_header(self.cluster.cluster_id())),
            }));
        }
        let Some(store) = req.store else {
            return Err(Status::invalid_argument("put store request has no store"));
        };
        let header = match grpc::store_meta_from_proto(store) {
            Ok(meta) => match self.cluster.put_store(meta.clone()).await {
                Ok(()) => {
                    info!(
                        store_id = meta.id,
                        address = %meta.address,
                        operator = "ServicePutStore",
                        "put store ok"
                    );
                    self.header()
                }
                Err(err) => self.err_header(&err),
            },
            Err(err) => self.err_header(&err),
        };
        Ok(Response::new(v1::PutStoreResponse {
            header: Some(header),
        }))
    }

    async fn get_all_stores(
        &self,
        request: Request<v1::GetAllStoresRequest>,
    ) -> std::result::Result<Response<v1::GetAllStoresResponse>, Status> {
        let _guard = self.rate_limit("GetAllStores")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.get_all_stores(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let stores = self
            .cluster
            .basic()
            .get_stores()
            .into_iter()
            .filter(|s| !(req.exclude_tombstone_stores && s.is_tombstone()))
            .map(|s| grpc::store_to_proto(&s))
            .collect();
        Ok(Response::new(v1::GetAllStoresResponse {
            header: Some(self.header()),
            stores,
        }))
    }

    async fn store_heartbeat(
        &self,
        request: Request<v1::StoreHeartbeatRequest>,
    ) -> std::result::Result<Response<v1::StoreHeartbeatResponse>, Status> {
        let _guard = self.rate_limit("StoreHeartbeat")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.store_heartbeat(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        if !self.cluster.is_bootstrapped() {
            return Ok(Response::new(v1::StoreHeartbeatResponse {
                header: Some(grpc::not_bootstrapped_header(self.cluster.cluster_id())),
                cluster_version: String::new(),
            }));
        }
        let Some(stats) = req.stats else {
            return Err(Status::invalid_argument("store heartbeat has no stats"));
        };
        let store_id = stats.store_id;
        let header = match self
            .cluster
            .store_heartbeat(store_id, grpc::stats_from_proto(&stats))
        {
            Ok(()) => {
                if let Some(store) = self.cluster.basic().get_store(store_id) {
                    rk_common::metrics::global_metrics()
                        .inc_store_heartbeat(store.address(), store_id);
                }
                self.header()
            }
            Err(err) => self.err_header(&err),
        };
        Ok(Response::new(v1::StoreHeartbeatResponse {
            header: Some(header),
            cluster_version: self.cluster.cluster_meta().cluster_version,
        }))
    }

    type RegionHeartbeatStream = StreamOf<v1::RegionHeartbeatResponse>;

    async fn region_heartbeat(
        &self,
        request: Request<Streaming<v1::RegionHeartbeatRequest>>,
    ) -> std::result::Result<Response<Self::RegionHeartbeatStream>, Status> {
        let _guard = self.rate_limit("RegionHeartbeat")?;
        let forwarded = self.forward_target(&request);
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(256);
        let worker = RegionHeartbeatWorker {
            cluster: self.cluster.clone(),
            election: self.election.clone(),
            hb_streams: self.hb_streams.clone(),
            pool: self.pool.clone(),
            scheduling_enabled: self.scheduling_enabled,
            kv: self.kv.clone(),
        };
        match forwarded {
            Some(host) => {
                tokio::spawn(worker.run_forwarded(host, inbound, tx));
            }
            None => {
                tokio::spawn(worker.run(inbound, tx));
            }
        }
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn report_buckets(
        &self,
        request: Request<Streaming<v1::ReportBucketsRequest>>,
    ) -> std::result::Result<Response<v1::ReportBucketsResponse>, Status> {
        let _guard = self.rate_limit("ReportBuckets")?;
        let mut inbound = request.into_inner();
        while let Some(req) = inbound.message().await? {
            self.validate(req.header.as_ref())?;
            let Some(buckets) = req.buckets else {
                continue;
            };
            let region_id = buckets.region_id;
            let update = Buckets {
                keys: buckets.keys,
                version: buckets.version,
            };
            if let Err(err) = self.cluster.basic().update_region_buckets(region_id, update) {
                warn!(
                    region_id,
                    error = %err,
                    operator = "ServiceReportBuckets",
                    "bucket report dropped"
                );
            }
        }
        Ok(Response::new(v1::ReportBucketsResponse {
            header: Some(self.header()),
        }))
    }

    async fn get_region(
        &self,
        request: Request<v1::GetRegionRequest>,
    ) -> std::result::Result<Response<v1::GetRegionResponse>, Status> {
        let _guard = self.rate_limit("GetRegion")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move { c.get_region(r).await })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let record = self
            .cluster
            .basic()
            .get_region_by_key(&req.region_key)
            .map(|region| grpc::region_record(&region, req.need_buckets));
        Ok(Response::new(v1::GetRegionResponse {
            header: Some(self.header()),
            record,
        }))
    }

    async fn get_prev_region(
        &self,
        request: Request<v1::GetRegionRequest>,
    ) -> std::result::Result<Response<v1::GetRegionResponse>, Status> {
        let _guard = self.rate_limit("GetPrevRegion")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.get_prev_region(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let record = self
            .cluster
            .basic()
            .get_prev_region(&req.region_key)
            .map(|region| grpc::region_record(&region, req.need_buckets));
        Ok(Response::new(v1::GetRegionResponse {
            header: Some(self.header()),
            record,
        }))
    }

    async fn get_region_by_id(
        &self,
        request: Request<v1::GetRegionByIdRequest>,
    ) -> std::result::Result<Response<v1::GetRegionResponse>, Status> {
        let _guard = self.rate_limit("GetRegionById")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.get_region_by_id(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let record = self
            .cluster
            .basic()
            .get_region(req.region_id)
            .map(|region| grpc::region_record(&region, req.need_buckets));
        Ok(Response::new(v1::GetRegionResponse {
            header: Some(self.header()),
            record,
        }))
    }

    async fn scan_regions(
        &self,
        request: Request<v1::ScanRegionsRequest>,
    ) -> std::result::Result<Response<v1::ScanRegionsResponse>, Status> {
        let _guard = self.rate_limit("ScanRegions")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.scan_regions(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let regions = self
            .cluster
            .basic()
            .scan_regions(&req.start_key, &req.end_key, req.limit as usize)
            .into_iter()
            .map(|region| grpc::region_record(&region, false))
            .collect();
        Ok(Response::new(v1::ScanRegionsResponse {
            header: Some(self.header()),
            regions,
        }))
    }

    async fn batch_scan_regions(
        &self,
        request: Request<v1::BatchScanRegionsRequest>,
    ) -> std::result::Result<Response<v1::BatchScanRegionsResponse>, Status> {
        let _guard = self.rate_limit("BatchScanRegions")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.batch_scan_regions(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let ranges: Vec<rk_common::KeyRange> = req
            .ranges
            .into_iter()
            .map(|r| rk_common::KeyRange::new(r.start_key, r.end_key))
            .collect();
        match self.cluster.basic().batch_scan_regions(
            &ranges,
            req.limit as usize,
            req.contain_all_key_range,
        ) {
            Ok(regions) => Ok(Response::new(v1::BatchScanRegionsResponse {
                header: Some(self.header()),
                regions: regions
                    .into_iter()
                    .map(|region| grpc::region_record(&region, req.need_buckets))
                    .collect(),
            })),
            Err(err) => Ok(Response::new(v1::BatchScanRegionsResponse {
                header: Some(self.err_header(&err)),
                regions: vec![],
            })),
        }
    }

    async fn ask_split(
        &self,
        request: Request<v1::AskSplitRequest>,
    ) -> std::result::Result<Response<v1::AskSplitResponse>, Status> {
        let _guard = self.rate_limit("AskSplit")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move { c.ask_split(r).await })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let Some(region) = req.region else {
            return Ok(Response::new(v1::AskSplitResponse {
                header: Some(self.err_header(&RkError::InvalidValue(
                    "missing region for split".to_string(),
                ))),
                new_region_id: 0,
                new_peer_ids: vec![],
            }));
        };
        let peer_count = region.peers.len() as u64;
        match self.cluster.alloc_id(1 + peer_count).await {
            Ok(base) => Ok(Response::new(v1::AskSplitResponse {
                header: Some(self.header()),
                new_region_id: base,
                new_peer_ids: (base + 1..base + 1 + peer_count).collect(),
            })),
            Err(err) => Ok(Response::new(v1::AskSplitResponse {
                header: Some(self.err_header(&err)),
                new_region_id: 0,
                new_peer_ids: vec![],
            })),
        }
    }

    async fn ask_batch_split(
        &self,
        request: Request<v1::AskBatchSplitRequest>,
    ) -> std::result::Result<Response<v1::AskBatchSplitResponse>, Status> {
        let _guard = self.rate_limit("AskBatchSplit")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.ask_batch_split(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let Some(region) = req.region else {
            return Ok(Response::new(v1::AskBatchSplitResponse {
                header: Some(self.err_header(&RkError::InvalidValue(
                    "missing region for split".to_string(),
                ))),
                ids: vec![],
            }));
        };
        if req.split_count == 0 {
            return Ok(Response::new(v1::AskBatchSplitResponse {
                header: Some(self.err_header(&RkError::InvalidValue(
                    "split count should be positive".to_string(),
                ))),
                ids: vec![],
            }));
        }
        let peer_count = region.peers.len() as u64;
        let per_split = 1 + peer_count;
        match self
            .cluster
            .alloc_id(per_split * u64::from(req.split_count))
            .await
        {
            Ok(base) => {
                let ids = (0..u64::from(req.split_count))
                    .map(|i| {
                        let start = base + i * per_split;
                        v1::SplitId {
                            new_region_id: start,
                            new_peer_ids: (start + 1..start + per_split).collect(),
                        }
                    })
                    .collect();
                Ok(Response::new(v1::AskBatchSplitResponse {
                    header: Some(self.header()),
                    ids,
                }))
            }
            Err(err) => Ok(Response::new(v1::AskBatchSplitResponse {
                header: Some(self.err_header(&err)),
                ids: vec![],
            })),
        }
    }

    async fn report_split(
        &self,
        request: Request<v1::ReportSplitRequest>,
    ) -> std::result::Result<Response<v1::ReportSplitResponse>, Status> {
        let _guard = self.rate_limit("ReportSplit")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.report_split(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        info!(
            left = req.left.as_ref().map(|r| r.id).unwrap_or_default(),
            right = req.right.as_ref().map(|r| r.id).unwrap_or_default(),
            operator = "ServiceReportSplit",
            "region split reported"
        );
        Ok(Response::new(v1::ReportSplitResponse {
            header: Some(self.header()),
        }))
    }

    async fn report_batch_split(
        &self,
        request: Request<v1::ReportBatchSplitRequest>,
    ) -> std::result::Result<Response<v1::ReportBatchSplitResponse>, Status> {
        let _guard = self.rate_limit("ReportBatchSplit")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.report_batch_split(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        info!(
            regions = req.regions.len(),
            operator = "ServiceReportSplit",
            "batch region split reported"
        );
        Ok(Response::new(v1::ReportBatchSplitResponse {
            header: Some(self.header()),
        }))
    }

    async fn scatter_region(
        &self,
        request: Request<v1::ScatterRegionRequest>,
    ) -> std::result::Result<Response<v1::ScatterRegionResponse>, Status> {
        let _guard = self.rate_limit("ScatterRegion")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.scatter_region(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        if !self.cluster.is_bootstrapped() {
            return Ok(Response::new(v1::ScatterRegionResponse {
                header: Some(grpc::not_bootstrapped_header(self.cluster.cluster_id())),
                finished_percentage: 0,
            }));
        }
        if req.region_ids.is_empty() {
            return Ok(Response::new(v1::ScatterRegionResponse {
                header: Some(self.err_header(&RkError::InvalidValue(
                    "no region to scatter".to_string(),
                ))),
                finished_percentage: 0,
            }));
        }
        match self.cluster.scatter_regions(&req.region_ids, &req.group) {
            Ok((accepted, _failed)) => Ok(Response::new(v1::ScatterRegionResponse {
                header: Some(self.header()),
                finished_percentage: (accepted as u64) * 100 / req.region_ids.len() as u64,
            })),
            Err(err) => Ok(Response::new(v1::ScatterRegionResponse {
                header: Some(self.err_header(&err)),
                finished_percentage: 0,
            })),
        }
    }

    async fn split_regions(
        &self,
        request: Request<v1::SplitRegionsRequest>,
    ) -> std::result::Result<Response<v1::SplitRegionsResponse>, Status> {
        let _guard = self.rate_limit("SplitRegions")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.split_regions(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        match self.cluster.split_regions(&req.split_keys) {
            Ok((accepted, regions_id)) => {
                let percentage = if req.split_keys.is_empty() {
                    0
                } else {
                    (accepted as u64) * 100 / req.split_keys.len() as u64
                };
                Ok(Response::new(v1::SplitRegionsResponse {
                    header: Some(self.header()),
                    finished_percentage: percentage.min(100),
                    regions_id,
                }))
            }
            Err(err) => Ok(Response::new(v1::SplitRegionsResponse {
                header: Some(self.err_header(&err)),
                finished_percentage: 0,
                regions_id: vec![],
            })),
        }
    }

    async fn split_and_scatter_regions(
        &self,
        request: Request<v1::SplitAndScatterRegionsRequest>,
    ) -> std::result::Result<Response<v1::SplitAndScatterRegionsResponse>, Status> {
        let _guard = self.rate_limit("SplitAndScatterRegions")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.split_and_scatter_regions(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let (split_accepted, regions_id) = self
            .cluster
            .split_regions(&req.split_keys)
            .map_err(grpc::to_status)?;
        let (scatter_accepted, _failed) = self
            .cluster
            .scatter_regions(&regions_id, &req.group)
            .map_err(grpc::to_status)?;
        let split_pct = if req.split_keys.is_empty() {
            0
        } else {
            (split_accepted as u64) * 100 / req.split_keys.len() as u64
        };
        let scatter_pct = if regions_id.is_empty() {
            0
        } else {
            (scatter_accepted as u64) * 100 / regions_id.len() as u64
        };
        Ok(Response::new(v1::SplitAndScatterRegionsResponse {
            header: Some(self.header()),
            split_finished_percentage: split_pct.min(100),
            scatter_finished_percentage: scatter_pct.min(100),
            regions_id,
        }))
    }

    async fn get_operator(
        &self,
        request: Request<v1::GetOperatorRequest>,
    ) -> std::result::Result<Response<v1::GetOperatorResponse>, Status> {
        let _guard = self.rate_limit("GetOperator")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.get_operator(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        match self.cluster.controller().get_operator(req.region_id) {
            Some(op) => {
                let status = match op.status {
                    CoreOperatorStatus::Success => v1::OperatorStatus::Success,
                    CoreOperatorStatus::Expired => v1::OperatorStatus::Timeout,
                    CoreOperatorStatus::Canceled | CoreOperatorStatus::Failed => {
                        v1::OperatorStatus::Cancel
                    }
                    _ => v1::OperatorStatus::Running,
                };
                Ok(Response::new(v1::GetOperatorResponse {
                    header: Some(self.header()),
                    region_id: req.region_id,
                    desc: op.desc.clone().into_bytes(),
                    status: status as i32,
                    kind: op.kind.as_str().as_bytes().to_vec(),
                }))
            }
            None => Ok(Response::new(v1::GetOperatorResponse {
                header: Some(self.err_header(&RkError::RegionNotFound(req.region_id))),
                region_id: req.region_id,
                desc: vec![],
                status: v1::OperatorStatus::Running as i32,
                kind: vec![],
            })),
        }
    }

    async fn set_external_timestamp(
        &self,
        request: Request<v1::SetExternalTimestampRequest>,
    ) -> std::result::Result<Response<v1::SetExternalTimestampResponse>, Status> {
        let _guard = self.rate_limit("SetExternalTimestamp")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.set_external_timestamp(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        // The external timestamp must stay behind what the allocator could
        // have issued.
        if self.oracle.is_initialized() {
            match self.oracle.generate(1).await {
                Ok(current) => {
                    if req.timestamp > current.compose() {
                        return Ok(Response::new(v1::SetExternalTimestampResponse {
                            header: Some(self.err_header(&RkError::InvalidValue(format!(
                                "external timestamp {} is greater than the current tso",
                                req.timestamp
                            )))),
                        }));
                    }
                }
                Err(err) => {
                    return Ok(Response::new(v1::SetExternalTimestampResponse {
                        header: Some(self.err_header(&err)),
                    }));
                }
            }
        }
        let header = match self.cluster.set_external_timestamp(req.timestamp).await {
            Ok(()) => self.header(),
            Err(err) => self.err_header(&err),
        };
        Ok(Response::new(v1::SetExternalTimestampResponse {
            header: Some(header),
        }))
    }

    async fn get_external_timestamp(
        &self,
        request: Request<v1::GetExternalTimestampRequest>,
    ) -> std::result::Result<Response<v1::GetExternalTimestampResponse>, Status> {
        let _guard = self.rate_limit("GetExternalTimestamp")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.get_external_timestamp(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        Ok(Response::new(v1::GetExternalTimestampResponse {
            header: Some(self.header()),
            timestamp: self.cluster.external_timestamp(),
        }))
    }

    async fn report_min_resolved_ts(
        &self,
        request: Request<v1::ReportMinResolvedTsRequest>,
    ) -> std::result::Result<Response<v1::ReportMinResolvedTsResponse>, Status> {
        let _guard = self.rate_limit("ReportMinResolvedTs")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.report_min_resolved_ts(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let header = match self
            .cluster
            .report_min_resolved_ts(req.store_id, req.min_resolved_ts)
            .await
        {
            Ok(()) => self.header(),
            Err(err) => self.err_header(&err),
        };
        Ok(Response::new(v1::ReportMinResolvedTsResponse {
            header: Some(header),
        }))
    }

    async fn get_cluster_config(
        &self,
        request: Request<v1::GetClusterConfigRequest>,
    ) -> std::result::Result<Response<v1::GetClusterConfigResponse>, Status> {
        let _guard = self.rate_limit("GetClusterConfig")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.get_cluster_config(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let meta = self.cluster.cluster_meta();
        Ok(Response::new(v1::GetClusterConfigResponse {
            header: Some(self.header()),
            cluster: Some(v1::ClusterConfig {
                max_peer_count: u64::from(meta.max_peer_count),
                cluster_version: meta.cluster_version,
            }),
        }))
    }

    async fn put_cluster_config(
        &self,
        request: Request<v1::PutClusterConfigRequest>,
    ) -> std::result::Result<Response<v1::PutClusterConfigResponse>, Status> {
        let _guard = self.rate_limit("PutClusterConfig")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.put_cluster_config(r).await
                })
                .await;
        }
        let req = request.into_inner();
        self.validate(req.header.as_ref())?;
        let Some(config) = req.cluster else {
            return Err(Status::invalid_argument("put cluster config has no config"));
        };
        let header = match self
            .cluster
            .put_cluster_meta(ClusterMeta {
                id: self.cluster.cluster_id(),
                max_peer_count: config.max_peer_count as u32,
                cluster_version: config.cluster_version,
            })
            .await
        {
            Ok(()) => self.header(),
            Err(err) => self.err_header(&err),
        };
        Ok(Response::new(v1::PutClusterConfigResponse {
            header: Some(header),
        }))
    }

    async fn store_global_config(
        &self,
        request: Request<v1::StoreGlobalConfigRequest>,
    ) -> std::result::Result<Response<v1::StoreGlobalConfigResponse>, Status> {
        let _guard = self.rate_limit("StoreGlobalConfig")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.store_global_config(r).await
                })
                .await;
        }
        let req = request.into_inner();
        for change in req.changes {
            let result = if change.deleted {
                self.cluster.storage().delete_global_config(&change.name).await
            } else {
                self.cluster
                    .storage()
                    .store_global_config(&change.name, change.payload)
                    .await
            };
            result.map_err(grpc::to_status)?;
        }
        Ok(Response::new(v1::StoreGlobalConfigResponse {
            header: Some(self.header()),
        }))
    }

    async fn load_global_config(
        &self,
        request: Request<v1::LoadGlobalConfigRequest>,
    ) -> std::result::Result<Response<v1::LoadGlobalConfigResponse>, Status> {
        let _guard = self.rate_limit("LoadGlobalConfig")?;
        if let Some(host) = self.forward_target(&request) {
            let req = request.into_inner();
            return self
                .forward_unary(host, req, |mut c, r| async move {
                    c.load_global_config(r).await
                })
                .await;
        }
        let req = request.into_inner();
        let storage = self.cluster.storage();
        let items = if req.names.is_empty() {
            storage
                .list_global_config()
                .await
                .map_err(grpc::to_status)?
                .into_iter()
                .map(|(name, payload)| v1::GlobalConfigItem {
                    name,
                    payload,
                    deleted: false,
                })
                .collect()
        } else {
            storage
                .load_global_config(&req.names)
                .await
                .map_err(grpc::to_status)?
                .into_iter()
                .map(|(name, payload)| match payload {
                    Some(payload) => v1::GlobalConfigItem {
                        name,
                        payload,
                        deleted: false,
                    },
                    None => v1::GlobalConfigItem {
                        name,
                        payload: vec![],
                        deleted: true,
                    },
                })
                .collect()
        };
        let revision = storage
            .kv()
            .current_revision()
            .await
            .map_err(grpc::to_status)?;
        Ok(Response::new(v1::LoadGlobalConfigResponse {
            header: Some(self.header()),
            items,
            revision,
        }))
    }

    type WatchGlobalConfigStream = StreamOf<v1::WatchGlobalConfigResponse>;

    async fn watch_global_config(
        &self,
        request: Request<v1::WatchGlobalConfigRequest>,
    ) -> std::result::Result<Response<Self::WatchGlobalConfigStream>, Status> {
        let _guard = self.rate_limit("WatchGlobalConfig")?;
        let req = request.into_inner();
        let mut watch = self
            .cluster
            .storage()
            .watch_global_config(req.revision)
            .await
            .map_err(grpc::to_status)?;
        let cluster_id = self.cluster.cluster_id();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                let name = event
                    .key
                    .strip_prefix(rk_storage::keypath::GLOBAL_CONFIG_PREFIX)
                    .unwrap_or(&event.key)
                    .to_string();
                let item = v1::GlobalConfigItem {
                    name,
                    payload: event.value,
                    deleted: event.kind == rk_storage::EventKind::Delete,
                };
                let response = v1::WatchGlobalConfigResponse {
                    header: Some(grpc::wrap_header(cluster_id)),
                    changes: vec![item],
                    revision: event.revision,
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
