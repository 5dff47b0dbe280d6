//! Lodestar scheduler - fair-share job leasing across executor clusters.
//!
//! The scheduler is responsible for:
//!
//! - **Priority tracking**: Decaying each queue's priority from cluster usage reports
//! - **Fair-share slicing**: Splitting offered capacity in inverse proportion to priority
//! - **Leasing**: Handing queued jobs to clusters in batches, never to two clusters at once
//! - **Lease lifecycle**: Renewals, completions and returning expired leases to their queue
//!
//! # Architecture
//!
//! Executors pull work:
//! - Each cluster reports usage, which updates its per-queue priorities
//! - Each cluster asks for a lease with the capacity it has free
//! - The scheduler slices that capacity across active queues and claims jobs
//!   atomically through the job store
//!
//! A periodically refreshed [`QueueCache`] keeps job/cluster feasibility out
//! of the lease path.
//!
//! # Example
//!
//! ```ignore
//! use lodestar_scheduler::{NoopMetrics, Scheduler, SchedulerConfig};
//! use lodestar_state::Repositories;
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default(), Repositories::memory(), Arc::new(NoopMetrics));
//! let jobs = scheduler.lease.lease_jobs(&request).await?;
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fairshare;
pub mod lease;
pub mod matching;
pub mod metrics;
pub mod scheduler;
pub mod submit;
pub mod task;
pub mod usage;

pub use cache::{QueueCache, QueueSnapshot};
pub use config::{
    ApiConfig, CacheConfig, LeaseConfig, PriorityConfig, SchedulerConfig, ShutdownConfig,
};
pub use error::{Result, SchedulerError};
pub use fairshare::FairShareSlicer;
pub use lease::LeaseEngine;
pub use matching::matches_scheduling_requirements;
pub use metrics::{NoopMetrics, PrometheusMetrics, SchedulerMetrics};
pub use scheduler::Scheduler;
pub use submit::SubmitService;
pub use task::{BackgroundTasks, PeriodicTask};
pub use usage::PriorityTracker;
