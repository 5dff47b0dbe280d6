//! Reports sent by executor clusters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;

/// Usage of one queue on one cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueReport {
    pub name: String,
    /// Resources requested by the queue's running jobs.
    #[serde(default)]
    pub resources: ResourceVector,
    /// Resources actually consumed.
    #[serde(default)]
    pub resources_used: ResourceVector,
}

/// Periodic usage report from an executor cluster.
///
/// The latest report per cluster replaces the previous one; its timestamp
/// drives priority decay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterUsageReport {
    pub cluster_id: String,
    #[serde(default)]
    pub pool: String,
    pub report_time: DateTime<Utc>,
    #[serde(default)]
    pub queues: Vec<QueueReport>,
    #[serde(default)]
    pub cluster_capacity: ResourceVector,
    #[serde(default)]
    pub cluster_available_capacity: ResourceVector,
}

/// Scheduling effect of a node taint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A node taint that repels pods without a matching toleration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

/// A class of identical nodes advertised by a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeType {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Largest allocation a single pod may receive on this node type.
    #[serde(default)]
    pub allocatable_resources: ResourceVector,
}

/// What a cluster can run, as last reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSchedulingInfoReport {
    pub cluster_id: String,
    #[serde(default)]
    pub pool: String,
    pub report_time: DateTime<Utc>,
    #[serde(default)]
    pub node_types: Vec<NodeType>,
    /// Jobs requesting less than this in any listed resource are refused.
    #[serde(default)]
    pub minimum_job_size: ResourceVector,
}

impl ClusterUsageReport {
    /// True when the report is newer than `now - window`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.report_time + window > now
    }
}

impl ClusterSchedulingInfoReport {
    /// True when the report is newer than `now - window`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.report_time + window > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_window() {
        let now = Utc::now();
        let window = chrono::Duration::minutes(10);
        let report = ClusterUsageReport {
            cluster_id: "c1".into(),
            pool: String::new(),
            report_time: now - chrono::Duration::minutes(9),
            queues: vec![],
            cluster_capacity: ResourceVector::new(),
            cluster_available_capacity: ResourceVector::new(),
        };
        assert!(report.is_active(now, window));

        let stale = ClusterUsageReport {
            report_time: now - chrono::Duration::minutes(10),
            ..report
        };
        assert!(!stale.is_active(now, window));
    }
}
