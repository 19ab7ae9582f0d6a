//! The Rangekeeper server: gRPC front-end, heartbeat pipeline, TSO stream
//! handling, and the forwarding layer.
//!
//! Architecture role:
//! - tonic services for the placement-driver, TSO, and scheduling surfaces
//! - leader/follower dispatch with transparent forwarding
//! - the region/store/bucket heartbeat pipeline
//! - server assembly and background loops
//!
//! Key modules:
//! - [`grpc`]
//! - [`cluster`]
//! - [`service`]
//! - [`heartbeat`]
//! - [`tso_stream`]
//! - [`forward`]
//! - [`server`]

pub mod cluster;
pub mod forward;
pub mod grpc;
pub mod heartbeat;
pub mod ms_service;
pub mod server;
pub mod service;
pub mod tso_stream;

pub use cluster::{ClusterMeta, PdCluster};
pub use forward::{ConnectionPool, TsoClientPool};
pub use heartbeat::HeartbeatStreams;
pub use server::{PdServer, ServerOptions};
pub use service::{PdService, ServiceLimiter};
