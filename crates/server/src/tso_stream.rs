//! TSO stream handling: local allocation, member-to-member proxying, and
//! forwarding to a dedicated TSO service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rk_common::metrics::global_metrics;
use rk_common::RkError;
use rk_storage::{keypath, Election, KvRef};
use rk_tso::TimestampOracle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Status, Streaming};
use tracing::{debug, warn};

use crate::forward::{need_rebuild_connection, set_forwarded_host, ConnectionPool, TsoClientPool};
use crate::grpc::{self, v1};

/// Sender half of one TSO response stream.
pub type TsoRespSender = mpsc::Sender<std::result::Result<v1::TsoResponse, Status>>;

/// Releases one slot of the proxy concurrency budget on drop, covering
/// every exit path of a proxied stream.
struct ProxyGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared TSO stream handling for the front-end.
pub struct TsoHandler {
    /// Cluster id stamped onto responses and validated against requests.
    pub cluster_id: u64,
    /// Cluster name for primary-address resolution.
    pub cluster_name: String,
    /// Address this member advertises.
    pub self_addr: String,
    /// The local allocator.
    pub oracle: Arc<TimestampOracle>,
    /// Leadership handle.
    pub election: Arc<Election>,
    /// Shared forward connection pool.
    pub pool: Arc<ConnectionPool>,
    /// Cached forward streams toward the dedicated TSO service.
    pub tso_clients: Arc<TsoClientPool>,
    /// Backing KV for primary resolution.
    pub kv: KvRef,
    /// Whether the TSO runs as an independent service.
    pub tso_service_enabled: bool,
    /// Cap on concurrent proxied streamings.
    pub max_concurrent_proxy: usize,
    /// Live proxied streamings.
    pub concurrent_proxy: Arc<AtomicUsize>,
    /// Timeout for one recv from a proxied client.
    pub recv_timeout: Duration,
    /// Deadline for one forwarded round-trip.
    pub proxy_timeout: Duration,
}

impl TsoHandler {
    /// Dispatches one incoming TSO stream onto the right serving path.
    pub fn handle(
        self: Arc<Self>,
        forwarded: Option<String>,
        inbound: Streaming<v1::TsoRequest>,
        tx: TsoRespSender,
    ) -> std::result::Result<(), Status> {
        match forwarded {
            Some(host) if host != self.self_addr => {
                let count = self.concurrent_proxy.fetch_add(1, Ordering::SeqCst) + 1;
                let guard = ProxyGuard {
                    counter: self.concurrent_proxy.clone(),
                };
                if self.max_concurrent_proxy > 0 && count > self.max_concurrent_proxy {
                    return Err(grpc::to_status(RkError::MaxConcurrentProxyExceeded));
                }
                tokio::spawn(self.proxy_stream(host, inbound, tx, guard));
                Ok(())
            }
            _ if self.tso_service_enabled => {
                tokio::spawn(self.forward_to_tso_service(inbound, tx));
                Ok(())
            }
            _ => {
                tokio::spawn(self.serve_local(inbound, tx));
                Ok(())
            }
        }
    }

    /// Serves timestamps from the local allocator, strictly in request
    /// order.
    async fn serve_local(self: Arc<Self>, mut inbound: Streaming<v1::TsoRequest>, tx: TsoRespSender) {
        loop {
            let request = match inbound.message().await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(status) => {
                    debug!(status = %status, operator = "TsoStream", "tso stream recv failed");
                    return;
                }
            };
            let header_cluster_id = request
                .header
                .as_ref()
                .map(|h| h.cluster_id)
                .unwrap_or_default();
            if let Err(err) = check_cluster_id(self.cluster_id, header_cluster_id) {
                let _ = tx.send(Err(grpc::to_status(err))).await;
                return;
            }
            let start = Instant::now();
            match self.oracle.generate(request.count).await {
                Ok(ts) => {
                    global_metrics().observe_tso_handle("local", start.elapsed().as_secs_f64());
                    let response = v1::TsoResponse {
                        header: Some(grpc::wrap_header(self.cluster_id)),
                        count: request.count,
                        timestamp: Some(grpc::timestamp_to_proto(ts)),
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    // The stream ends on allocation failure; the client
                    // retries after re-resolving the leader.
                    let _ = tx.send(Err(Status::unknown(err.to_string()))).await;
                    return;
                }
            }
        }
    }

    /// Relays a whole stream to the member named by the forwarded-host
    /// marker, with bounded recv deadlines on the client side.
    async fn proxy_stream(
        self: Arc<Self>,
        host: String,
        mut inbound: Streaming<v1::TsoRequest>,
        tx: TsoRespSender,
        _guard: ProxyGuard,
    ) {
        let mut client = match self.pool.pd_client(&host).await {
            Ok(client) => client,
            Err(err) => {
                let _ = tx.send(Err(grpc::to_status(err))).await;
                return;
            }
        };
        let (fwd_tx, fwd_rx) = mpsc::channel::<v1::TsoRequest>(64);
        let mut outbound = Request::new(ReceiverStream::new(fwd_rx));
        set_forwarded_host(&mut outbound, &host);
        let mut responses = match client.tso(outbound).await {
            Ok(responses) => responses.into_inner(),
            Err(status) => {
                if need_rebuild_connection(&status) {
                    self.pool.invalidate(&host);
                }
                let _ = tx.send(Err(status)).await;
                return;
            }
        };

        loop {
            let request =
                match tokio::time::timeout(self.recv_timeout, inbound.message()).await {
                    Err(_) => {
                        let _ = tx
                            .send(Err(grpc::to_status(RkError::RecvTimeout(
                                "tso proxy recv from client".to_string(),
                            ))))
                            .await;
                        return;
                    }
                    Ok(Ok(Some(request))) => request,
                    Ok(Ok(None)) => return,
                    Ok(Err(_)) => return,
                };
            if request.count == 0 {
                let _ = tx
                    .send(Err(Status::unknown(
                        "generate timestamp failed: tso count should be positive",
                    )))
                    .await;
                return;
            }
            if fwd_tx.send(request).await.is_err() {
                let _ = tx
                    .send(Err(Status::unavailable("tso proxy stream closed")))
                    .await;
                return;
            }
            let response =
                match tokio::time::timeout(self.proxy_timeout, responses.message()).await {
                    Err(_) => {
                        self.pool.invalidate(&host);
                        let _ = tx
                            .send(Err(Status::deadline_exceeded("tso proxy deadline exceeded")))
                            .await;
                        return;
                    }
                    Ok(Ok(Some(response))) => response,
                    Ok(Ok(None)) => {
                        let _ = tx
                            .send(Err(Status::unavailable("tso proxy stream ended")))
                            .await;
                        return;
                    }
                    Ok(Err(status)) => {
                        if need_rebuild_connection(&status) {
                            self.pool.invalidate(&host);
                        }
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                };
            global_metrics().observe_tso_handle("proxy", 0.0);
            if tx.send(Ok(response)).await.is_err() {
                return;
            }
        }
    }

    /// Forwards each request as a round-trip over the cached stream to the
    /// TSO service primary.
    async fn forward_to_tso_service(
        self: Arc<Self>,
        mut inbound: Streaming<v1::TsoRequest>,
        tx: TsoRespSender,
    ) {
        loop {
            let request = match inbound.message().await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(_) => return,
            };
            if request.count == 0 {
                let _ = tx
                    .send(Err(Status::unknown(
                        "generate timestamp failed: tso count should be positive",
                    )))
                    .await;
                return;
            }
            let primary_path = keypath::ms_primary_path(&self.cluster_name, "tso");
            let host = match self.kv.get(&primary_path).await {
                Ok(Some(raw)) => String::from_utf8_lossy(&raw).to_string(),
                _ => {
                    let _ = tx
                        .send(Err(Status::unavailable("tso primary address not found")))
                        .await;
                    return;
                }
            };
            let stream = match self.tso_clients.get(&host).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = tx.send(Err(grpc::to_status(err))).await;
                    return;
                }
            };
            let start = Instant::now();
            match stream.call(request, self.proxy_timeout).await {
                Ok(mut response) => {
                    global_metrics().observe_tso_handle("forward", start.elapsed().as_secs_f64());
                    // Downstream error types stay opaque to the client.
                    response.header = response.header.map(|header| {
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
                        v1::ResponseHeader {
                            cluster_id: header.cluster_id,
                            error,
                        }
                    });
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                }
                Err(status) => {
                    if need_rebuild_connection(&status) {
                        warn!(
                            host = %host,
                            status = %status,
                            operator = "TsoForward",
                            "tso forward stream removed due to error"
                        );
                        self.tso_clients.invalidate(&host);
                        self.pool.invalidate(&host);
                    }
                    global_metrics().inc_forward_event("tso_forward_err");
                    let _ = tx.send(Err(status)).await;
                    return;
                }
            }
        }
    }
}

fn check_cluster_id(expected: u64, actual: u64) -> Result<(), RkError> {
    if expected != actual {
        return Err(RkError::MismatchClusterId { expected, actual });
    }
    Ok(())
}
