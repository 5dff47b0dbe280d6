//! Jobs, queues and the requests that create and cancel them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;
use crate::types::JobId;

/// A named queue that jobs are submitted into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    /// Unique queue name.
    pub name: String,
    /// Multiplier applied to the queue's priority. Values above one shrink
    /// the queue's share.
    #[serde(default = "default_priority_factor")]
    pub priority_factor: f64,
}

impl Queue {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority_factor: default_priority_factor(),
        }
    }

    #[must_use]
    pub fn with_priority_factor(mut self, factor: f64) -> Self {
        self.priority_factor = factor;
        self
    }
}

fn default_priority_factor() -> f64 {
    1.0
}

/// Requirements of one pod of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodRequirements {
    /// Resources requested by the pod.
    #[serde(default)]
    pub resources: ResourceVector,
    /// Node labels that must all be present on the target node.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Taints this pod tolerates.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

impl PodRequirements {
    #[must_use]
    pub fn with_resources(resources: ResourceVector) -> Self {
        Self {
            resources,
            ..Self::default()
        }
    }
}

/// How a toleration compares against a taint's value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Key and value must both match.
    #[default]
    Equal,
    /// Any value matches; an empty key matches every taint.
    Exists,
}

/// Permission to run on a node carrying a matching taint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// Effect to tolerate; `None` tolerates every effect.
    #[serde(default)]
    pub effect: Option<crate::cluster::TaintEffect>,
}

/// A unit of work submitted to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub job_set_id: String,
    pub owner: String,
    /// Ordering priority within the queue. Lower values lease first.
    pub priority: f64,
    pub created: DateTime<Utc>,
    /// One entry per pod; multi-pod jobs are leased as a whole.
    pub pod_requirements: Vec<PodRequirements>,
}

impl Job {
    /// Total resources requested across all pods.
    #[must_use]
    pub fn total_resource_request(&self) -> ResourceVector {
        ResourceVector::sum(self.pod_requirements.iter().map(|pod| &pod.resources))
    }
}

/// A single job within a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSubmitItem {
    #[serde(default)]
    pub priority: f64,
    pub pod_requirements: Vec<PodRequirements>,
}

/// Submission of one or more jobs into a job set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmitRequest {
    pub queue: String,
    pub job_set_id: String,
    #[serde(default)]
    pub owner: String,
    pub items: Vec<JobSubmitItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmitResponse {
    pub job_ids: Vec<JobId>,
}

/// Cancels a single job, or every active job of a job set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCancelRequest {
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub job_set_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCancelResponse {
    pub cancelled_ids: Vec<JobId>,
}
