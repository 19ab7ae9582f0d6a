//! Server assembly: election, allocator, cluster runtime, background
//! loops, and the tonic endpoint.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use rk_common::config::{PdConfig, ScheduleConfig};
use rk_common::metrics::global_metrics;
use rk_common::Result;
use rk_schedule::scheduler::SchedulerCluster;
use rk_storage::{keypath, Election, KvRef};
use rk_tso::TimestampOracle;
use rk_storage::Storage;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::cluster::PdCluster;
use crate::forward::{ConnectionPool, TsoClientPool};
use crate::grpc::{PlacementDriverServer, SchedulingServer, TsoServer};
use crate::heartbeat::HeartbeatStreams;
use crate::ms_service::{SchedulingService, TsoService};
use crate::service::{PdService, ServiceLimiter};
use crate::tso_stream::TsoHandler;

/// Deployment switches for one member.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Forward TSO requests to the dedicated TSO service instead of
    /// serving them from the local allocator.
    pub tso_service_enabled: bool,
    /// Mirror region heartbeats to the dedicated scheduling service.
    pub scheduling_service_enabled: bool,
}

/// One placement-driver member.
pub struct PdServer {
    kv: KvRef,
    config: PdConfig,
    options: ServerOptions,
    cluster: Arc<PdCluster>,
    election: Arc<Election>,
    oracle: Arc<TimestampOracle>,
    hb_streams: Arc<HeartbeatStreams>,
    pool: Arc<ConnectionPool>,
    tso_clients: Arc<TsoClientPool>,
    limiter: Arc<ServiceLimiter>,
    shutdown_tx: watch::Sender<bool>,
}

impl PdServer {
    /// Wires one member against a backing KV.
    pub async fn new(
        kv: KvRef,
        config: PdConfig,
        schedule: ScheduleConfig,
        options: ServerOptions,
    ) -> Result<Arc<Self>> {
        let cluster = PdCluster::new(kv.clone(), config.clone(), schedule).await?;
        let election = Election::new(
            kv.clone(),
            keypath::leader_path(&config.cluster_name),
            config.advertise_addr.clone(),
            Duration::from_millis(config.leader_lease_ms),
        );
        let storage = Storage::new(kv.clone(), config.cluster_name.clone());
        let oracle = Arc::new(TimestampOracle::new(0, election.clone(), storage, &config));
        let hb_streams = HeartbeatStreams::new(
            cluster.cluster_id(),
            Duration::from_millis(config.heartbeat_send_timeout_ms),
        );
        let pool = ConnectionPool::new(Duration::from_millis(config.grpc_dial_timeout_ms));
        let tso_clients = TsoClientPool::new(pool.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            kv,
            config,
            options,
            cluster,
            election,
            oracle,
            hb_streams,
            pool,
            tso_clients,
            limiter: ServiceLimiter::new(),
            shutdown_tx,
        }))
    }

    /// Shared cluster runtime.
    pub fn cluster(&self) -> &Arc<PdCluster> {
        &self.cluster
    }

    /// Leadership handle.
    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    /// Local allocator.
    pub fn oracle(&self) -> &Arc<TimestampOracle> {
        &self.oracle
    }

    /// Per-method rate limiter.
    pub fn limiter(&self) -> &Arc<ServiceLimiter> {
        &self.limiter
    }

    fn tso_handler(&self) -> Arc<TsoHandler> {
        Arc::new(TsoHandler {
            cluster_id: self.cluster.cluster_id(),
            cluster_name: self.config.cluster_name.clone(),
            self_addr: self.config.advertise_addr.clone(),
            oracle: self.oracle.clone(),
            election: self.election.clone(),
            pool: self.pool.clone(),
            tso_clients: self.tso_clients.clone(),
            kv: self.kv.clone(),
            tso_service_enabled: self.options.tso_service_enabled,
            max_concurrent_proxy: self.config.max_concurrent_tso_proxy_streamings,
            concurrent_proxy: Arc::new(AtomicUsize::new(0)),
            recv_timeout: Duration::from_millis(self.config.tso_proxy_recv_from_client_timeout_ms),
            proxy_timeout: Duration::from_millis(self.config.tso_proxy_timeout_ms),
        })
    }

    /// Builds the main service surface.
    pub fn build_service(&self) -> PdService {
        PdService {
            cluster: self.cluster.clone(),
            election: self.election.clone(),
            oracle: self.oracle.clone(),
            hb_streams: self.hb_streams.clone(),
            pool: self.pool.clone(),
            tso_handler: self.tso_handler(),
            limiter: self.limiter.clone(),
            scheduling_enabled: self.options.scheduling_service_enabled,
            kv: self.kv.clone(),
        }
    }

    /// Starts the background loops: election, leadership transitions, the
    /// TSO physical updater, and the scheduler tick.
    pub fn start(self: &Arc<Self>) {
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(self.election.clone().run(shutdown));

        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(self.oracle.clone().run_update_loop(shutdown));

        // Leadership transitions: sync the allocator and reload state on
        // promotion, reset on demotion.
        let server = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut leader_rx = server.election.subscribe();
            let mut was_serving = false;
            loop {
                // Act on the current role first: leadership may already have
                // been won before this task subscribed.
                let serving = server.election.is_serving();
                global_metrics().set_leader(server.election.identity(), serving);
                if serving && !was_serving {
                    info!(
                        member = %server.election.identity(),
                        operator = "ServerPromote",
                        "became leader, syncing state"
                    );
                    if let Err(err) = server.cluster.reload().await {
                        warn!(error = %err, operator = "ServerPromote", "state reload failed");
                    }
                    if let Err(err) = server.oracle.sync_timestamp().await {
                        warn!(error = %err, operator = "ServerPromote", "tso sync failed");
                    }
                    if let Err(err) = server.cluster.ensure_peer_id_block().await {
                        warn!(error = %err, operator = "ServerPromote", "peer id prefetch failed");
                    }
                    server.advertise_service_primaries().await;
                } else if !serving && was_serving {
                    info!(
                        member = %server.election.identity(),
                        operator = "ServerDemote",
                        "lost leadership, resetting allocator"
                    );
                    server.oracle.reset();
                }
                was_serving = serving;
                tokio::select! {
                    changed = leader_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        });

        // Scheduler tick loop, leader only.
        let server = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let interval =
                Duration::from_millis(server.cluster.schedule_config().schedule_interval_ms);
            loop {
                if server.election.is_serving() && server.cluster.is_bootstrapped() {
                    if let Err(err) = server.cluster.ensure_peer_id_block().await {
                        warn!(error = %err, operator = "ServerTick", "peer id prefetch failed");
                    }
                    server
                        .cluster
                        .schedulers()
                        .tick(server.cluster.as_ref() as &dyn SchedulerCluster);
                    if let Err(err) = server.cluster.persist_scheduler_configs().await {
                        warn!(
                            error = %err,
                            operator = "ServerTick",
                            "scheduler config persist failed"
                        );
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Publishes this member as the primary for the dedicated services it
    /// hosts, so cross-service forwarding can resolve it.
    async fn advertise_service_primaries(&self) {
        for service in ["tso", "scheduling"] {
            let path = keypath::ms_primary_path(&self.config.cluster_name, service);
            if let Err(err) = self
                .kv
                .put(&path, self.config.advertise_addr.as_bytes().to_vec())
                .await
            {
                warn!(
                    service,
                    error = %err,
                    operator = "ServerPromote",
                    "service primary advertise failed"
                );
            }
        }
    }

    /// Serves the gRPC surface on an already-bound listener until
    /// shutdown.
    pub async fn serve_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(rk_common::RkError::Io)?;
        info!(
            addr = %addr,
            member = %self.config.advertise_addr,
            operator = "ServerServe",
            "placement driver serving"
        );
        let mut shutdown = self.shutdown_tx.subscribe();
        let pd = PlacementDriverServer::new(self.build_service());
        let tso = TsoServer::new(TsoService {
            cluster_id: self.cluster.cluster_id(),
            oracle: self.oracle.clone(),
            election: self.election.clone(),
        });
        let scheduling = SchedulingServer::new(SchedulingService {
            cluster: self.cluster.clone(),
        });
        Server::builder()
            .add_service(pd)
            .add_service(tso)
            .add_service(scheduling)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            })
            .await
            .map_err(|e| rk_common::RkError::Internal(format!("grpc serve failed: {e}")))
    }

    /// Binds `addr` and serves until shutdown.
    pub async fn serve(self: Arc<Self>, addr: std::net::SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(rk_common::RkError::Io)?;
        self.serve_with_listener(listener).await
    }

    /// Signals every background loop and the endpoint to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
