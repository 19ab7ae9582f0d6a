#![deny(missing_docs)]

//! Shared configuration, error types, key utilities, and observability
//! primitives for Rangekeeper crates.
//!
//! Architecture role:
//! - defines member/scheduling configuration passed across layers
//! - provides common [`RkError`] / [`Result`] contracts
//! - hosts byte-key/range helpers shared by the region registry and schedulers
//! - hosts the Prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`keyutil`]
//! - [`metrics`]

/// Shared member/scheduling configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Byte-key and key-range helpers.
pub mod keyutil;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{PdConfig, ScheduleConfig, StoreLimitVersion};
pub use error::{Result, RkError};
pub use keyutil::{KeyRange, KeyRanges};
pub use metrics::MetricsRegistry;
