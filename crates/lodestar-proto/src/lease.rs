//! Lease protocol messages exchanged with executors.

use serde::{Deserialize, Serialize};

use crate::cluster::NodeType;
use crate::job::Job;
use crate::resources::ResourceVector;
use crate::types::JobId;

/// Request for work from an executor cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub cluster_id: String,
    #[serde(default)]
    pub pool: String,
    /// Capacity the cluster offers in this round.
    pub resources: ResourceVector,
    /// Node types currently available; recorded as the cluster's
    /// scheduling info when non-empty.
    #[serde(default)]
    pub nodes: Vec<NodeType>,
    /// Jobs requesting less than this are not offered to the cluster.
    #[serde(default)]
    pub minimum_job_size: ResourceVector,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub jobs: Vec<Job>,
}

/// Job ids sent by a cluster to renew or complete leases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdList {
    pub cluster_id: String,
    pub ids: Vec<JobId>,
}

/// Outcome of a lease renewal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalResult {
    pub renewed: Vec<JobId>,
    pub failed: Vec<JobId>,
}

/// Outcome of a completion report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneResult {
    pub done: Vec<JobId>,
    pub failed: Vec<JobId>,
}
