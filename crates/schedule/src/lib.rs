//! Scheduling for Rangekeeper: operators, the operator controller, store
//! limits, the scheduler framework, and the balance-range scheduler.
//!
//! Architecture role:
//! - models movement plans (operators) and their lifecycle
//! - enforces the one-operator-per-region slot, per-kind caps, and
//!   per-store rate limits
//! - runs registered schedulers on a tick against a read-only cluster view
//! - ships the range-targeted balancing scheduler and its job queue
//!
//! Key modules:
//! - [`operator`]
//! - [`controller`]
//! - [`store_limit`]
//! - [`filter`]
//! - [`scheduler`]
//! - [`balance_range`]
//! - [`key_range_manager`]

pub mod balance_range;
pub mod controller;
pub mod filter;
pub mod key_range_manager;
pub mod operator;
pub mod scheduler;
pub mod store_limit;

pub use balance_range::{
    BalanceRangeJob, BalanceRangeScheduler, JobEngine, JobRule, JobSpec, JobStatus,
    BALANCE_RANGE_SCHEDULER_NAME,
};
pub use controller::OperatorController;
pub use key_range_manager::KeyRangeManager;
pub use operator::{OpInfluence, OpKind, OpPriority, OpStep, Operator, OperatorStatus};
pub use scheduler::{Plan, Scheduler, SchedulerCluster, SchedulerManager};
pub use store_limit::{StoreLimitType, StoreLimiter};
