//! The forwarding layer: a shared per-host connection pool, cached TSO
//! forward streams, and the forwarded-host plumbing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rk_common::{Result, RkError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, warn};

use crate::grpc::{
    v1, PlacementDriverClient, SchedulingClient, TsoClient, FORWARDED_HOST_KEY,
};

/// Whether a stream error means the pooled connection behind it must be
/// rebuilt rather than retried.
pub fn need_rebuild_connection(status: &Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Cancelled | tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
    )
}

/// Reads the forwarded-host marker from request metadata.
pub fn forwarded_host(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get(FORWARDED_HOST_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Stamps the forwarded-host marker onto an outgoing request.
pub fn set_forwarded_host<T>(request: &mut Request<T>, host: &str) {
    if let Ok(value) = host.parse() {
        request.metadata_mut().insert(FORWARDED_HOST_KEY, value);
    }
}

/// Shared per-host connection pool.
///
/// At most one connection per host is live; losers of a create race drop
/// their connection. Invalidation removes the entry so the next acquire
/// re-dials.
pub struct ConnectionPool {
    dial_timeout: Duration,
    conns: Mutex<HashMap<String, Channel>>,
}

impl ConnectionPool {
    /// An empty pool dialing with the given per-host timeout.
    pub fn new(dial_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            dial_timeout,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// The connection for `host`, dialing one when absent.
    pub async fn acquire(&self, host: &str) -> Result<Channel> {
        if let Some(channel) = self.conns.lock().expect("pool lock").get(host).cloned() {
            return Ok(channel);
        }
        let endpoint = Endpoint::from_shared(format!("http://{host}"))
            .map_err(|e| RkError::InvalidValue(format!("invalid forward host {host}: {e}")))?
            .connect_timeout(self.dial_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RkError::Internal(format!("dial {host} failed: {e}")))?;
        let mut conns = self.conns.lock().expect("pool lock");
        // Another task may have stored one meanwhile; keep theirs and let
        // ours drop.
        Ok(conns.entry(host.to_string()).or_insert(channel).clone())
    }

    /// Drops the pooled connection for `host`.
    pub fn invalidate(&self, host: &str) {
        if self.conns.lock().expect("pool lock").remove(host).is_some() {
            debug!(host, operator = "PoolInvalidate", "pooled connection removed");
        }
    }

    /// Number of live pooled connections.
    pub fn len(&self) -> usize {
        self.conns.lock().expect("pool lock").len()
    }

    /// Whether the pool holds no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A placement-driver client for `host`.
    pub async fn pd_client(&self, host: &str) -> Result<PlacementDriverClient<Channel>> {
        Ok(PlacementDriverClient::new(self.acquire(host).await?))
    }

    /// A dedicated-TSO-service client for `host`.
    pub async fn tso_client(&self, host: &str) -> Result<TsoClient<Channel>> {
        Ok(TsoClient::new(self.acquire(host).await?))
    }

    /// A dedicated-scheduling-service client for `host`.
    pub async fn scheduling_client(&self, host: &str) -> Result<SchedulingClient<Channel>> {
        Ok(SchedulingClient::new(self.acquire(host).await?))
    }
}

/// One cached bidi stream to a TSO primary.
///
/// Send and recv are paired under one lock, so responses always match the
/// request that produced them.
pub struct TsoForwardStream {
    tx: mpsc::Sender<v1::TsoRequest>,
    inner: tokio::sync::Mutex<tonic::Streaming<v1::TsoResponse>>,
}

impl TsoForwardStream {
    /// One forwarded round-trip with a wall-time deadline.
    pub async fn call(
        &self,
        request: v1::TsoRequest,
        timeout: Duration,
    ) -> std::result::Result<v1::TsoResponse, Status> {
        let mut responses = self.inner.lock().await;
        self.tx
            .send(request)
            .await
            .map_err(|_| Status::unavailable("tso forward stream closed"))?;
        match tokio::time::timeout(timeout, responses.message()).await {
            Err(_) => Err(Status::deadline_exceeded("tso forward deadline exceeded")),
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(Status::unavailable("tso forward stream ended")),
            Ok(Err(status)) => Err(status),
        }
    }
}

/// Cache of TSO forward streams keyed by primary host.
///
/// Reads take the shared lock; create-if-absent re-checks under the
/// exclusive lock after the stream is built.
pub struct TsoClientPool {
    pool: Arc<ConnectionPool>,
    clients: RwLock<HashMap<String, Arc<TsoForwardStream>>>,
}

impl TsoClientPool {
    /// An empty cache dialing through `pool`.
    pub fn new(pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            clients: RwLock::new(HashMap::new()),
        })
    }

    /// The cached stream for `host`, opening one when absent.
    pub async fn get(&self, host: &str) -> Result<Arc<TsoForwardStream>> {
        if let Some(stream) = self.clients.read().expect("tso pool lock").get(host) {
            return Ok(stream.clone());
        }

        let channel = self.pool.acquire(host).await?;
        let (tx, rx) = mpsc::channel::<v1::TsoRequest>(64);
        let outbound = ReceiverStream::new(rx);
        let responses = TsoClient::new(channel)
            .tso(Request::new(outbound))
            .await
            .map_err(|status| {
                RkError::Internal(format!("open tso forward stream to {host}: {status}"))
            })?
            .into_inner();
        let stream = Arc::new(TsoForwardStream {
            tx,
            inner: tokio::sync::Mutex::new(responses),
        });

        let mut clients = self.clients.write().expect("tso pool lock");
        if let Some(existing) = clients.get(host) {
            // Lost the race; the freshly-opened stream drops here.
            return Ok(existing.clone());
        }
        clients.insert(host.to_string(), stream.clone());
        Ok(stream)
    }

    /// Drops the cached stream for `host` (connection-rebuild errors).
    pub fn invalidate(&self, host: &str) {
        if self
            .clients
            .write()
            .expect("tso pool lock")
            .remove(host)
            .is_some()
        {
            warn!(host, operator = "TsoPoolInvalidate", "tso forward stream removed");
        }
    }
}
