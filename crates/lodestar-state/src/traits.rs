use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_proto::{ClusterSchedulingInfoReport, ClusterUsageReport, Job, JobEvent, JobId, Queue};

use crate::error::StoreError;
use crate::types::ExpiredLease;

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Creates the queue, replacing any queue with the same name.
    async fn create_queue(&self, queue: &Queue) -> Result<(), StoreError>;

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, StoreError>;

    async fn get_all_queues(&self) -> Result<Vec<Queue>, StoreError>;
}

/// Durable job storage and the lease claim protocol.
///
/// Implementations must make [`try_lease_jobs`](Self::try_lease_jobs) atomic
/// per job: when several clusters race for the same job exactly one of them
/// sees it in its result.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Records the jobs and places them in their queues.
    async fn add_jobs(&self, jobs: &[Job]) -> Result<(), StoreError>;

    /// Ids of queued jobs in lease order (priority, then submission).
    async fn get_queued_job_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError>;

    async fn get_queued_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let ids = self.get_queued_job_ids(queue).await?;
        self.get_existing_jobs_by_ids(&ids).await
    }

    /// Fetches jobs in the order given, skipping ids that no longer exist.
    async fn get_existing_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError>;

    /// Keeps the queues that have at least one queued job.
    async fn filter_active_queues(&self, queues: Vec<Queue>) -> Result<Vec<Queue>, StoreError>;

    /// Moves each still-queued job to leased-by-`cluster_id` and returns the
    /// jobs this call won. Jobs already leased or removed are left out.
    async fn try_lease_jobs(
        &self,
        cluster_id: &str,
        queue: &str,
        jobs: &[Job],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Refreshes the lease time of jobs leased by `cluster_id` and returns
    /// the renewed ids.
    async fn renew_leases(
        &self,
        cluster_id: &str,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Deletes finished jobs leased by `cluster_id` and returns them.
    async fn remove_leased_jobs(
        &self,
        cluster_id: &str,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError>;

    /// Returns jobs leased at or before `deadline` to their queues.
    async fn return_expired_leases(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError>;

    /// Ids of every job of the job set that is queued or leased.
    async fn get_active_job_ids(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Deletes the jobs whatever their state and returns those that existed.
    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Latest usage report of every cluster, keyed by cluster id.
    async fn get_cluster_usage_reports(
        &self,
    ) -> Result<HashMap<String, ClusterUsageReport>, StoreError>;

    /// Per-queue priority of one cluster; empty when none is recorded.
    async fn get_cluster_priority(
        &self,
        cluster_id: &str,
    ) -> Result<HashMap<String, f64>, StoreError>;

    async fn get_cluster_priorities(
        &self,
        cluster_ids: &[String],
    ) -> Result<HashMap<String, HashMap<String, f64>>, StoreError>;

    /// Stores the report and priorities together, provided the cluster's
    /// stored report time still equals `previous_report_time` (`None` meaning
    /// no report). Returns `false` without writing when it does not.
    async fn update_cluster(
        &self,
        report: &ClusterUsageReport,
        priorities: &HashMap<String, f64>,
        previous_report_time: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SchedulingInfoRepository: Send + Sync {
    async fn get_cluster_scheduling_info(
        &self,
    ) -> Result<HashMap<String, ClusterSchedulingInfoReport>, StoreError>;

    async fn update_cluster_scheduling_info(
        &self,
        report: &ClusterSchedulingInfoReport,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Appends events to their job sets' streams in order.
    async fn report_events(&self, events: &[JobEvent]) -> Result<(), StoreError>;

    async fn read_events(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobEvent>, StoreError>;
}
