//! Dedicated microservice surfaces: the standalone TSO service and the
//! standalone scheduling service, targeted by cross-service forwarding.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use rk_storage::Election;
use rk_tso::TimestampOracle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::cluster::PdCluster;
use crate::grpc::{self, v1, Scheduling, Tso};
use crate::heartbeat::step_to_response;

type StreamOf<T> = Pin<Box<dyn Stream<Item = std::result::Result<T, Status>> + Send>>;

/// Standalone TSO service backed by its own allocator and primary
/// election.
pub struct TsoService {
    /// Cluster id stamped onto responses.
    pub cluster_id: u64,
    /// The allocator for this keyspace-group.
    pub oracle: Arc<TimestampOracle>,
    /// Primary election for this service.
    pub election: Arc<Election>,
}

#[tonic::async_trait]
impl Tso for TsoService {
    type TsoStream = StreamOf<v1::TsoResponse>;

    async fn tso(
        &self,
        request: Request<Streaming<v1::TsoRequest>>,
    ) -> std::result::Result<Response<Self::TsoStream>, Status> {
        let mut inbound = request.into_inner();
        let oracle = self.oracle.clone();
        let cluster_id = self.cluster_id;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => return,
                    Err(_) => return,
                };
                match oracle.generate(request.count).await {
                    Ok(ts) => {
                        let response = v1::TsoResponse {
                            header: Some(grpc::wrap_header(cluster_id)),
                            count: request.count,
                            timestamp: Some(grpc::timestamp_to_proto(ts)),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        // Surface in-band so the forwarding member can map it
                        // for its own client.
                        let response = v1::TsoResponse {
                            header: Some(grpc::error_header(
                                cluster_id,
                                v1::ErrorType::Unknown,
                                err.to_string(),
                            )),
                            count: 0,
                            timestamp: None,
                        };
                        let _ = tx.send(Ok(response)).await;
                        return;
                    }
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Standalone scheduling service ingesting mirrored region heartbeats.
pub struct SchedulingService {
    /// Shared cluster runtime of the scheduling deployment.
    pub cluster: Arc<PdCluster>,
}

#[tonic::async_trait]
impl Scheduling for SchedulingService {
    type RegionHeartbeatStream = StreamOf<v1::RegionHeartbeatResponse>;

    async fn region_heartbeat(
        &self,
        request: Request<Streaming<v1::RegionHeartbeatRequest>>,
    ) -> std::result::Result<Response<Self::RegionHeartbeatStream>, Status> {
        let mut inbound = request.into_inner();
        let cluster = self.cluster.clone();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let flow_round_by_digit = cluster.config().flow_round_by_digit;
            loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => return,
                    Err(_) => return,
                };
                let region =
                    match grpc::region_from_heartbeat(request, flow_round_by_digit) {
                        Ok(region) => region,
                        Err(err) => {
                            debug!(
                                error = %err,
                                operator = "SchedulingHeartbeat",
                                "mirrored heartbeat dropped"
                            );
                            continue;
                        }
                    };
                match cluster.handle_region_heartbeat(region.clone()) {
                    Ok(Some(step)) => {
                        let response = step_to_response(&cluster, &region, &step);
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let response = v1::RegionHeartbeatResponse {
                            header: Some(grpc::error_header(
                                cluster.cluster_id(),
                                v1::ErrorType::Unknown,
                                err.to_string(),
                            )),
                            ..Default::default()
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
