use lodestar_proto::Job;

/// A lease that timed out and whose job went back to its queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredLease {
    pub job: Job,
    /// Cluster that held the lease.
    pub cluster_id: String,
}
