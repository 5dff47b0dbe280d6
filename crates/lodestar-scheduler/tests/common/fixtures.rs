//! Test fixtures for scheduler integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_proto::{
    ClusterSchedulingInfoReport, ClusterUsageReport, Job, JobId, LeaseRequest, NodeType,
    PodRequirements, Queue, QueueReport, ResourceVector,
};
use lodestar_scheduler::SchedulerMetrics;
use lodestar_state::{ExpiredLease, JobRepository, QueueRepository, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating test Job instances.
pub struct JobBuilder {
    id: JobId,
    queue: String,
    job_set_id: String,
    priority: f64,
    pods: Vec<PodRequirements>,
}

impl JobBuilder {
    /// Creates a new job builder with the given ID, in queue `q`.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            queue: "q".to_string(),
            job_set_id: "set".to_string(),
            priority: 0.0,
            pods: vec![],
        }
    }

    pub fn in_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn in_job_set(mut self, job_set_id: &str) -> Self {
        self.job_set_id = job_set_id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a pod requesting `cpu` cores.
    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.pods
            .push(PodRequirements::with_resources(ResourceVector::from([("cpu", cpu)])));
        self
    }

    /// Adds a pod that must land on a node with the given label.
    pub fn with_selector(mut self, key: &str, value: &str, cpu: f64) -> Self {
        let mut pod = PodRequirements::with_resources(ResourceVector::from([("cpu", cpu)]));
        pod.node_selector = BTreeMap::from([(key.to_string(), value.to_string())]);
        self.pods.push(pod);
        self
    }

    pub fn build(self) -> Job {
        let pods = if self.pods.is_empty() {
            vec![PodRequirements::with_resources(ResourceVector::from([("cpu", 1.0)]))]
        } else {
            self.pods
        };
        Job {
            id: self.id,
            queue: self.queue,
            job_set_id: self.job_set_id,
            owner: "tester".to_string(),
            priority: self.priority,
            created: Utc::now(),
            pod_requirements: pods,
        }
    }
}

/// `count` one-cpu jobs in `queue` with ids `{prefix}000`, `{prefix}001`, ...
pub fn jobs(prefix: &str, queue: &str, count: usize) -> Vec<Job> {
    (0..count)
        .map(|i| {
            JobBuilder::new(&format!("{prefix}{i:03}"))
                .in_queue(queue)
                .with_cpu(1.0)
                .build()
        })
        .collect()
}

/// Creates the queues and adds the jobs.
pub async fn seed(repositories: &lodestar_state::Repositories, queues: &[&str], queued: &[Job]) {
    for name in queues {
        repositories.queues.create_queue(&Queue::new(*name)).await.unwrap();
    }
    repositories.jobs.add_jobs(queued).await.unwrap();
}

/// A lease request offering `cpu` cores.
pub fn offer(cluster_id: &str, cpu: f64) -> LeaseRequest {
    LeaseRequest {
        cluster_id: cluster_id.to_string(),
        pool: "default".to_string(),
        resources: ResourceVector::from([("cpu", cpu)]),
        ..LeaseRequest::default()
    }
}

/// Scheduling info for a cluster with one node type.
pub fn cluster_info(cluster_id: &str, pool: &str, node: NodeType) -> ClusterSchedulingInfoReport {
    ClusterSchedulingInfoReport {
        cluster_id: cluster_id.to_string(),
        pool: pool.to_string(),
        report_time: Utc::now(),
        node_types: vec![node],
        minimum_job_size: ResourceVector::new(),
    }
}

/// A node type with `cpu` cores and the given labels.
pub fn node(cpu: f64, labels: &[(&str, &str)]) -> NodeType {
    NodeType {
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        taints: vec![],
        allocatable_resources: ResourceVector::from([("cpu", cpu)]),
    }
}

/// Builder for usage reports.
pub struct UsageReportBuilder {
    report: ClusterUsageReport,
}

impl UsageReportBuilder {
    pub fn new(cluster_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            report: ClusterUsageReport {
                cluster_id: cluster_id.to_string(),
                pool: "default".to_string(),
                report_time: at,
                cluster_capacity: ResourceVector::from([("cpu", 100.0)]),
                ..ClusterUsageReport::default()
            },
        }
    }

    pub fn with_capacity(mut self, capacity: ResourceVector) -> Self {
        self.report.cluster_capacity = capacity;
        self
    }

    /// Records `queue` as using `cpu` cores.
    pub fn with_queue_cpu(mut self, queue: &str, cpu: f64) -> Self {
        self.report.queues.push(QueueReport {
            name: queue.to_string(),
            resources: ResourceVector::from([("cpu", cpu)]),
            resources_used: ResourceVector::new(),
        });
        self
    }

    pub fn build(self) -> ClusterUsageReport {
        self.report
    }
}

/// Metrics sink that keeps what it was told.
#[derive(Default)]
pub struct RecordingMetrics {
    pub rounds: AtomicUsize,
    pub conflicts: AtomicUsize,
    pub expired: AtomicUsize,
    pub cache_refreshes: AtomicUsize,
    pub leased: Mutex<HashMap<String, usize>>,
    pub priorities: Mutex<HashMap<(String, String), f64>>,
}

impl RecordingMetrics {
    pub fn leased_from(&self, queue: &str) -> usize {
        self.leased.lock().get(queue).copied().unwrap_or(0)
    }
}

impl SchedulerMetrics for RecordingMetrics {
    fn record_lease_round(&self, _cluster_id: &str, _jobs_leased: usize, _elapsed: Duration) {
        self.rounds.fetch_add(1, Ordering::SeqCst);
    }

    fn record_jobs_leased(&self, queue: &str, count: usize) {
        *self.leased.lock().entry(queue.to_string()).or_insert(0) += count;
    }

    fn record_lease_conflicts(&self, _queue: &str, count: usize) {
        self.conflicts.fetch_add(count, Ordering::SeqCst);
    }

    fn record_queue_priority(&self, cluster_id: &str, queue: &str, priority: f64) {
        self.priorities
            .lock()
            .insert((cluster_id.to_string(), queue.to_string()), priority);
    }

    fn record_queued_resource(&self, _pool: &str, _queue: &str, _resource: &str, _quantity: f64) {}

    fn record_queue_size(&self, _queue: &str, _size: usize) {}

    fn record_queue_duration(&self, _pool: &str, _queue: &str, _min: Duration, _max: Duration) {}

    fn record_cache_refresh(&self, _elapsed: Duration, _success: bool) {
        self.cache_refreshes.fetch_add(1, Ordering::SeqCst);
    }

    fn record_expired_leases(&self, count: usize) {
        self.expired.fetch_add(count, Ordering::SeqCst);
    }
}

/// Job repository that fails or stalls on demand.
pub struct FaultyJobs {
    inner: Arc<dyn JobRepository>,
    failing_queue: Option<String>,
    claim_delay: Duration,
}

impl FaultyJobs {
    pub fn new(inner: Arc<dyn JobRepository>) -> Self {
        Self {
            inner,
            failing_queue: None,
            claim_delay: Duration::ZERO,
        }
    }

    /// Every read of `queue`'s queued jobs fails.
    pub fn failing_queue(mut self, queue: &str) -> Self {
        self.failing_queue = Some(queue.to_string());
        self
    }

    /// Every claim commits, then stalls for `delay` before answering.
    pub fn slow_claims(mut self, delay: Duration) -> Self {
        self.claim_delay = delay;
        self
    }

    fn check(&self, queue: &str) -> Result<(), StoreError> {
        if self.failing_queue.as_deref() == Some(queue) {
            return Err(StoreError::Backend(format!("injected failure for {queue}")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for FaultyJobs {
    async fn add_jobs(&self, jobs: &[Job]) -> Result<(), StoreError> {
        self.inner.add_jobs(jobs).await
    }

    async fn get_queued_job_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError> {
        self.check(queue)?;
        self.inner.get_queued_job_ids(queue).await
    }

    async fn get_existing_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        self.inner.get_existing_jobs_by_ids(ids).await
    }

    async fn filter_active_queues(&self, queues: Vec<Queue>) -> Result<Vec<Queue>, StoreError> {
        self.inner.filter_active_queues(queues).await
    }

    async fn try_lease_jobs(
        &self,
        cluster_id: &str,
        queue: &str,
        jobs: &[Job],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let claimed = self.inner.try_lease_jobs(cluster_id, queue, jobs, now).await?;
        if !self.claim_delay.is_zero() {
            tokio::time::sleep(self.claim_delay).await;
        }
        Ok(claimed)
    }

    async fn renew_leases(
        &self,
        cluster_id: &str,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.inner.renew_leases(cluster_id, ids, now).await
    }

    async fn remove_leased_jobs(
        &self,
        cluster_id: &str,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.remove_leased_jobs(cluster_id, ids).await
    }

    async fn return_expired_leases(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError> {
        self.inner.return_expired_leases(deadline).await
    }

    async fn get_active_job_ids(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobId>, StoreError> {
        self.inner.get_active_job_ids(queue, job_set_id).await
    }

    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        self.inner.cancel_jobs(ids).await
    }
}
