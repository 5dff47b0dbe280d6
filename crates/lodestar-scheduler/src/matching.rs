//! Job-to-cluster feasibility.
//!
//! A job matches a cluster when it is not below the cluster's minimum job
//! size and every one of its pods fits some advertised node type: the node
//! carries all selected labels, every blocking taint is tolerated, and the
//! pod's request fits the node's allocatable resources.

use lodestar_proto::{
    ClusterSchedulingInfoReport, Job, NodeType, PodRequirements, Taint, TaintEffect, Toleration,
    TolerationOperator,
};

/// Whether `job` can run on the cluster described by `info`.
#[must_use]
pub fn matches_scheduling_requirements(job: &Job, info: &ClusterSchedulingInfoReport) -> bool {
    if !is_large_enough(job, info) {
        return false;
    }
    job.pod_requirements
        .iter()
        .all(|pod| info.node_types.iter().any(|node| pod_fits_node(pod, node)))
}

fn is_large_enough(job: &Job, info: &ClusterSchedulingInfoReport) -> bool {
    info.minimum_job_size.is_empty() || job.total_resource_request().at_least(&info.minimum_job_size)
}

/// Whether a single pod can be placed on a node of this type.
#[must_use]
pub fn pod_fits_node(pod: &PodRequirements, node: &NodeType) -> bool {
    let labels_match = pod
        .node_selector
        .iter()
        .all(|(key, value)| node.labels.get(key) == Some(value));

    labels_match
        && node
            .taints
            .iter()
            .filter(|taint| taint.effect != TaintEffect::PreferNoSchedule)
            .all(|taint| pod.tolerations.iter().any(|t| tolerates(t, taint)))
        && pod.resources.fits_within(&node.allocatable_resources)
}

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if toleration.effect.is_some_and(|effect| effect != taint.effect) {
        return false;
    }
    match toleration.operator {
        TolerationOperator::Exists => toleration.key.is_empty() || toleration.key == taint.key,
        TolerationOperator::Equal => toleration.key == taint.key && toleration.value == taint.value,
    }
}
