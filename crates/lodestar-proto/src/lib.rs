//! Domain types shared by the Lodestar scheduler and its stores.
//!
//! This crate carries no behaviour beyond arithmetic on resources. It defines:
//!
//! - **Resources**: [`ResourceVector`] and quantity parsing
//! - **Jobs and queues**: [`Job`], [`Queue`], submission and cancellation requests
//! - **Cluster reports**: usage reports and scheduling info sent by executors
//! - **Leasing**: lease, renewal and completion messages
//! - **Events**: the per job-set event stream
//!
//! All types serialise with serde; the HTTP API and the Valkey store both use
//! JSON.

mod cluster;
mod error;
mod event;
mod job;
mod lease;
mod resources;
mod types;

pub use cluster::{
    ClusterSchedulingInfoReport, ClusterUsageReport, NodeType, QueueReport, Taint, TaintEffect,
};
pub use error::ProtocolError;
pub use event::{JobEvent, JobEventKind};
pub use job::{
    Job, JobCancelRequest, JobCancelResponse, JobSubmitItem, JobSubmitRequest, JobSubmitResponse,
    PodRequirements, Queue, Toleration, TolerationOperator,
};
pub use lease::{DoneResult, IdList, LeaseRequest, LeaseResponse, RenewalResult};
pub use resources::{parse_quantity, ResourceVector};
pub use types::{new_job_id, JobId};

/// Well-known resource names.
pub mod resource {
    /// CPU cores; the reference resource for scarcity weighting.
    pub const CPU: &str = "cpu";
}
