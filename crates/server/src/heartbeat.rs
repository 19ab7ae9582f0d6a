//! The heartbeat pipeline: per-store response-stream bindings, the region
//! heartbeat loop, and cross-service heartbeat forwarding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rk_common::metrics::global_metrics;
use rk_common::{Result, RkError};
use rk_core::RegionInfo;
use rk_schedule::operator::OpStep;
use rk_storage::{keypath, KvRef};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::cluster::PdCluster;
use crate::forward::{need_rebuild_connection, set_forwarded_host, ConnectionPool};
use crate::grpc::{self, v1};
use rk_storage::Election;

/// Sender half of one region-heartbeat response stream.
pub type RegionRespSender = mpsc::Sender<std::result::Result<v1::RegionHeartbeatResponse, Status>>;

/// Binds each store's leader to the stream that should receive scheduling
/// responses, and pushes responses with a bounded send deadline.
pub struct HeartbeatStreams {
    cluster_id: u64,
    send_timeout: Duration,
    senders: Mutex<HashMap<u64, RegionRespSender>>,
}

impl HeartbeatStreams {
    /// An empty binding table.
    pub fn new(cluster_id: u64, send_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cluster_id,
            send_timeout,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Cluster id stamped onto every pushed response.
    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Re-binds `store_id` to a response stream.
    pub fn bind(&self, store_id: u64, sender: RegionRespSender) {
        self.senders
            .lock()
            .expect("heartbeat streams lock")
            .insert(store_id, sender);
    }

    /// Drops the binding when a stream closes.
    pub fn unbind(&self, store_id: u64) {
        self.senders
            .lock()
            .expect("heartbeat streams lock")
            .remove(&store_id);
    }

    /// Pushes one response to the stream bound for `store_id`.
    ///
    /// A send that cannot complete within the deadline marks the stream
    /// closed: the binding is dropped and the caller sees `SendTimeout`.
    pub async fn send_response(
        &self,
        store_id: u64,
        response: v1::RegionHeartbeatResponse,
    ) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .expect("heartbeat streams lock")
            .get(&store_id)
            .cloned()
            .ok_or_else(|| {
                RkError::StreamClosed(format!("no heartbeat stream bound for store {store_id}"))
            })?;
        match tokio::time::timeout(self.send_timeout, sender.send(Ok(response))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.unbind(store_id);
                Err(RkError::StreamClosed(format!(
                    "heartbeat stream for store {store_id} is gone"
                )))
            }
            Err(_) => {
                self.unbind(store_id);
                Err(RkError::SendTimeout(format!(
                    "heartbeat response to store {store_id}"
                )))
            }
        }
    }

    /// Pushes an in-band error to the reporter's bound stream.
    pub async fn send_err(
        &self,
        store_id: u64,
        error_type: v1::ErrorType,
        message: String,
        target_peer: Option<v1::Peer>,
    ) -> Result<()> {
        let response = v1::RegionHeartbeatResponse {
            header: Some(grpc::error_header(self.cluster_id, error_type, message)),
            target_peer,
            ..Default::default()
        };
        self.send_response(store_id, response).await
    }
}

/// Renders one operator step as a region-heartbeat response.
pub fn step_to_response(
    cluster: &PdCluster,
    region: &RegionInfo,
    step: &OpStep,
) -> v1::RegionHeartbeatResponse {
    let mut response = v1::RegionHeartbeatResponse {
        header: Some(grpc::wrap_header(cluster.cluster_id())),
        region_id: region.id(),
        region_epoch: Some(v1::RegionEpoch {
            version: region.epoch().version,
            conf_ver: region.epoch().conf_ver,
        }),
        target_peer: region.leader.as_ref().map(grpc::peer_to_proto),
        ..Default::default()
    };
    match step {
        OpStep::AddPeer { store_id, peer_id } => {
            response.change_peer = Some(v1::ChangePeer {
                peer: Some(v1::Peer {
                    id: *peer_id,
                    store_id: *store_id,
                    role: v1::PeerRole::Voter as i32,
                }),
                remove: false,
            });
        }
        OpStep::AddLearner { store_id, peer_id } => {
            response.change_peer = Some(v1::ChangePeer {
                peer: Some(v1::Peer {
                    id: *peer_id,
                    store_id: *store_id,
                    role: v1::PeerRole::Learner as i32,
                }),
                remove: false,
            });
        }
        OpStep::PromoteLearner { peer_id } => {
            let store_id = region
                .get_peer(*peer_id)
                .map(|p| p.store_id)
                .unwrap_or_default();
            response.change_peer = Some(v1::ChangePeer {
                peer: Some(v1::Peer {
                    id: *peer_id,
                    store_id,
                    role: v1::PeerRole::Voter as i32,
                }),
                remove: false,
            });
        }
        OpStep::RemovePeer { store_id } => {
            response.change_peer = Some(v1::ChangePeer {
                peer: region.get_store_peer(*store_id).map(grpc::peer_to_proto),
                remove: true,
            });
        }
        OpStep::TransferLeader { to_store, .. } => {
            response.transfer_leader = Some(v1::TransferLeader {
                peer: region.get_store_peer(*to_store).map(grpc::peer_to_proto),
            });
        }
        OpStep::MergeRegion { target_region_id } => {
            response.merge = cluster.basic().get_region(*target_region_id).map(|target| {
                v1::Merge {
                    target: Some(grpc::region_to_proto(&target.meta)),
                }
            });
        }
        OpStep::SplitRegion { keys } => {
            response.split_region = Some(v1::SplitRegion { keys: keys.clone() });
        }
    }
    response
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Rewrites a forwarded response header so downstream error types stay
/// opaque to the client: OK passes through, everything else surfaces as
/// UNKNOWN with the original message.
fn convert_forwarded_header(header: Option<v1::ResponseHeader>) -> Option<v1::ResponseHeader> {
    let header = header?;
    let error = header.error.and_then(|error| {
        if error.r#type == v1::ErrorType::Ok as i32 {
            None
        } else {
            Some(v1::Error {
                r#type: v1::ErrorType::Unknown as i32,
                message: error.message,
            })
        }
    });
    Some(v1::ResponseHeader {
        cluster_id: header.cluster_id,
        error,
    })
}

/// Per-stream forward state toward the dedicated scheduling service.
struct SchedulingForward {
    host: String,
    tx: mpsc::Sender<v1::RegionHeartbeatRequest>,
}

/// Drives one region-heartbeat stream on the serving member.
pub struct RegionHeartbeatWorker {
    /// Shared cluster runtime.
    pub cluster: Arc<PdCluster>,
    /// Leadership handle for role validation.
    pub election: Arc<Election>,
    /// Store-to-stream binding table.
    pub hb_streams: Arc<HeartbeatStreams>,
    /// Shared forward connection pool.
    pub pool: Arc<ConnectionPool>,
    /// Whether heartbeats are mirrored to a dedicated scheduling service.
    pub scheduling_enabled: bool,
    /// Backing KV for primary-address resolution.
    pub kv: KvRef,
}

impl RegionHeartbeatWorker {
    async fn scheduling_primary(&self) -> Option<String> {
        let path = keypath::ms_primary_path(&self.cluster.config().cluster_name, "scheduling");
        self.kv
            .get(&path)
            .await
            .ok()
            .flatten()
            .map(|v| String::from_utf8_lossy(&v).to_string())
    }

    async fn ensure_scheduling_stream(
        &self,
        current: &mut Option<SchedulingForward>,
        client_tx: &RegionRespSender,
    ) -> Option<()> {
        let host = self.scheduling_primary().await?;
        if current.as_ref().is_some_and(|f| f.host == host) {
            return Some(());
        }
        let mut client = match self.pool.scheduling_client(&host).await {
            Ok(client) => client,
            Err(err) => {
                error!(
                    host = %host,
                    error = %err,
                    operator = "HeartbeatSchedulingForward",
                    "failed to get scheduling client"
                );
                return None;
            }
        };
        let (tx, rx) = mpsc::channel::<v1::RegionHeartbeatRequest>(128);
        let responses = match client
            .region_heartbeat(Request::new(ReceiverStream::new(rx)))
            .await
        {
            Ok(responses) => responses.into_inner(),
            Err(status) => {
                debug!(
                    host = %host,
                    status = %status,
                    operator = "HeartbeatSchedulingForward",
                    "failed to create scheduling forward stream"
                );
                return None;
            }
        };
        debug!(
            forwarded_host = %host,
            operator = "HeartbeatSchedulingForward",
            "create scheduling forwarding stream"
        );
        let back = client_tx.clone();
        tokio::spawn(async move {
            let mut responses = responses;
            loop {
                match responses.message().await {
                    Ok(Some(mut response)) => {
                        response.header = convert_forwarded_header(response.header);
                        if back.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        global_metrics().inc_forward_event("scheduling_recv_err");
                        debug!(
                            status = %status,
                            operator = "HeartbeatSchedulingForward",
                            "scheduling forward stream ended"
                        );
                        return;
                    }
                }
            }
        });
        *current = Some(SchedulingForward { host, tx });
        Some(())
    }

    /// The main leader-side loop for one stream.
    pub async fn run(
        self,
        mut inbound: Streaming<v1::RegionHeartbeatRequest>,
        tx: RegionRespSender,
    ) {
        let bind_interval =
            Duration::from_millis(self.cluster.config().heartbeat_stream_bind_interval_ms);
        let flow_round_by_digit = self.cluster.config().flow_round_by_digit;
        let mut last_bind: Option<Instant> = None;
        let mut bound_store = None;
        let mut sched_forward: Option<SchedulingForward> = None;

        loop {
            let request = match inbound.message().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(status) => {
                    debug!(
                        status = %status,
                        operator = "HeartbeatLoop",
                        "region heartbeat stream recv failed"
                    );
                    break;
                }
            };

            if !self.cluster.is_bootstrapped() {
                let response = v1::RegionHeartbeatResponse {
                    header: Some(grpc::not_bootstrapped_header(self.cluster.cluster_id())),
                    ..Default::default()
                };
                let _ = tx.send(Ok(response)).await;
                break;
            }
            let header_cluster_id = request
                .header
                .as_ref()
                .map(|h| h.cluster_id)
                .unwrap_or_default();
            if let Err(err) = self.cluster.check_cluster_id(header_cluster_id) {
                let _ = tx.send(Err(grpc::to_status(err))).await;
                break;
            }
            if !self.election.is_serving() {
                let _ = tx
                    .send(Err(grpc::to_status(RkError::NotLeader(
                        self.election.leader_address().unwrap_or_default(),
                    ))))
                    .await;
                break;
            }

            let leader = request.leader.clone();
            let store_id = leader.as_ref().map(|p| p.store_id).unwrap_or_default();
            let Some(store) = self.cluster.basic().get_store(store_id) else {
                let _ = tx
                    .send(Err(Status::invalid_argument(format!(
                        "invalid store ID {store_id}, not found"
                    ))))
                    .await;
                break;
            };
            let store_address = store.address().to_string();
            global_metrics().inc_region_heartbeat(&store_address, store_id, "recv");
            if request.interval_end_timestamp > 0 {
                let lag = now_secs().saturating_sub(request.interval_end_timestamp);
                global_metrics().observe_region_heartbeat_latency(
                    &store_address,
                    store_id,
                    lag as f64,
                );
            }

            if last_bind.map(|at| at.elapsed() > bind_interval).unwrap_or(true) {
                global_metrics().inc_region_heartbeat(&store_address, store_id, "bind");
                self.hb_streams.bind(store_id, tx.clone());
                bound_store = Some(store_id);
                last_bind = Some(Instant::now());
            }

            if leader.is_none() {
                error!(
                    operator = "HeartbeatLoop",
                    "invalid request, the leader is nil"
                );
                global_metrics().inc_region_heartbeat(&store_address, store_id, "invalid-leader");
                continue;
            }
            let region = match grpc::region_from_heartbeat(request.clone(), flow_round_by_digit) {
                Ok(region) => region,
                Err(err) => {
                    global_metrics().inc_region_heartbeat(&store_address, store_id, "invalid-region");
                    let _ = self
                        .hb_streams
                        .send_err(store_id, v1::ErrorType::Unknown, err.to_string(), leader)
                        .await;
                    continue;
                }
            };
            if region.id() == 0 {
                global_metrics().inc_region_heartbeat(&store_address, store_id, "invalid-region");
                let _ = self
                    .hb_streams
                    .send_err(
                        store_id,
                        v1::ErrorType::Unknown,
                        format!("invalid request region, id is zero: {:?}", region.meta),
                        leader,
                    )
                    .await;
                continue;
            }
            if region.meta.peers.is_empty() {
                warn!(
                    region_id = region.id(),
                    operator = "HeartbeatLoop",
                    "invalid region, zero region peer count"
                );
                global_metrics().inc_region_heartbeat(&store_address, store_id, "no-peer");
                let _ = self
                    .hb_streams
                    .send_err(
                        store_id,
                        v1::ErrorType::Unknown,
                        "invalid region, zero region peer count".to_string(),
                        leader,
                    )
                    .await;
                continue;
            }

            let start = Instant::now();
            match self.cluster.handle_region_heartbeat(region.clone()) {
                Ok(Some(step)) => {
                    let response = step_to_response(&self.cluster, &region, &step);
                    if let Err(err) = self.hb_streams.send_response(store_id, response).await {
                        warn!(
                            store_id,
                            error = %err,
                            operator = "HeartbeatLoop",
                            "operator dispatch failed"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    global_metrics().inc_region_heartbeat(&store_address, store_id, "err");
                    let _ = self
                        .hb_streams
                        .send_err(store_id, v1::ErrorType::Unknown, err.to_string(), leader)
                        .await;
                    continue;
                }
            }
            global_metrics().observe_region_heartbeat_handle(
                &store_address,
                store_id,
                start.elapsed().as_secs_f64(),
            );
            global_metrics().inc_region_heartbeat(&store_address, store_id, "ok");

            if self.scheduling_enabled {
                if self
                    .ensure_scheduling_stream(&mut sched_forward, &tx)
                    .await
                    .is_none()
                {
                    continue;
                }
                if let Some(forward) = &sched_forward {
                    if forward.tx.send(request).await.is_err() {
                        global_metrics().inc_forward_event("scheduling_send_err");
                        error!(
                            operator = "HeartbeatSchedulingForward",
                            "failed to send request to scheduling service"
                        );
                        let host = forward.host.clone();
                        self.pool.invalidate(&host);
                        sched_forward = None;
                    }
                }
            }
        }

        if let Some(store_id) = bound_store {
            self.hb_streams.unbind(store_id);
        }
    }

    /// Relays one stream verbatim to the member named by the forwarded-host
    /// marker (the follower-side path).
    pub async fn run_forwarded(
        self,
        host: String,
        mut inbound: Streaming<v1::RegionHeartbeatRequest>,
        tx: RegionRespSender,
    ) {
        info!(
            forwarded_host = %host,
            operator = "HeartbeatForward",
            "create region heartbeat forward stream"
        );
        let mut client = match self.pool.pd_client(&host).await {
            Ok(client) => client,
            Err(err) => {
                let _ = tx.send(Err(grpc::to_status(err))).await;
                return;
            }
        };
        let (fwd_tx, fwd_rx) = mpsc::channel::<v1::RegionHeartbeatRequest>(128);
        let mut outbound = Request::new(ReceiverStream::new(fwd_rx));
        set_forwarded_host(&mut outbound, &host);
        let mut responses = match client.region_heartbeat(outbound).await {
            Ok(responses) => responses.into_inner(),
            Err(status) => {
                if need_rebuild_connection(&status) {
                    self.pool.invalidate(&host);
                }
                let _ = tx.send(Err(status)).await;
                return;
            }
        };

        let back = tx.clone();
        let relay = tokio::spawn(async move {
            loop {
                match responses.message().await {
                    Ok(Some(response)) => {
                        if back.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = back.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        loop {
            match inbound.message().await {
                Ok(Some(request)) => {
                    if fwd_tx.send(request).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        drop(fwd_tx);
        let _ = relay.await;
    }
}
