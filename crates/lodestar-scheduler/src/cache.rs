//! Snapshot of queued demand and job/cluster feasibility.
//!
//! The cache is rebuilt periodically from the stores:
//!
//! - **Queued resources**: per queue and pool, the summed request of queued
//!   jobs that can run somewhere in the pool
//! - **Non-matching index**: per queue and job, the active clusters that cannot
//!   run it
//!
//! Each rebuild produces a fresh immutable [`QueueSnapshot`] that replaces the
//! previous one with a single pointer swap, so readers never see a partially
//! built index. Clusters absent from the index are assumed able to run a job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lodestar_proto::{ClusterSchedulingInfoReport, Job, JobId, ResourceVector};
use lodestar_state::{JobRepository, QueueRepository, Repositories, SchedulingInfoRepository};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, SchedulerError};
use crate::matching::matches_scheduling_requirements;
use crate::metrics::SchedulerMetrics;
use crate::task::PeriodicTask;

/// Immutable result of one refresh.
#[derive(Debug, Default)]
pub struct QueueSnapshot {
    queued_resources: HashMap<String, HashMap<String, ResourceVector>>,
    non_matching: HashMap<String, HashMap<JobId, HashSet<String>>>,
}

impl QueueSnapshot {
    /// Queued demand of `queue` per pool.
    #[must_use]
    pub fn queued_resources(&self, queue: &str) -> HashMap<String, ResourceVector> {
        self.queued_resources.get(queue).cloned().unwrap_or_default()
    }

    /// Clusters recorded as unable to run `job_id`.
    #[must_use]
    pub fn non_matching_clusters(&self, queue: &str, job_id: &str) -> Option<&HashSet<String>> {
        self.non_matching.get(queue)?.get(job_id)
    }

    /// Jobs of `queue` that `cluster_id` cannot run.
    #[must_use]
    pub fn non_matching_job_ids(&self, queue: &str, cluster_id: &str) -> HashSet<JobId> {
        self.non_matching
            .get(queue)
            .map(|jobs| {
                jobs.iter()
                    .filter(|(_, clusters)| clusters.contains(cluster_id))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_excluded(&self, queue: &str, job_id: &str, cluster_id: &str) -> bool {
        self.non_matching_clusters(queue, job_id)
            .is_some_and(|clusters| clusters.contains(cluster_id))
    }
}

/// Shortest and longest time a schedulable job has waited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedFor {
    min: Duration,
    max: Duration,
}

impl QueuedFor {
    fn observe(&mut self, waited: Duration) {
        self.min = self.min.min(waited);
        self.max = self.max.max(waited);
    }
}

#[derive(Default)]
struct QueueIndex {
    demand: HashMap<String, ResourceVector>,
    queued_for: HashMap<String, QueuedFor>,
    non_matching: HashMap<JobId, HashSet<String>>,
}

fn index_queue(
    jobs: &[Job],
    pools: &HashMap<String, Vec<ClusterSchedulingInfoReport>>,
    now: DateTime<Utc>,
) -> QueueIndex {
    let mut index = QueueIndex::default();

    for job in jobs {
        let request = job.total_resource_request();
        let waited = (now - job.created).to_std().unwrap_or(Duration::ZERO);
        for (pool, infos) in pools {
            let mut matched = false;
            for info in infos {
                if matches_scheduling_requirements(job, info) {
                    matched = true;
                } else {
                    index
                        .non_matching
                        .entry(job.id.clone())
                        .or_default()
                        .insert(info.cluster_id.clone());
                }
            }
            if matched {
                index.demand.entry(pool.clone()).or_default().add(&request);
                index
                    .queued_for
                    .entry(pool.clone())
                    .and_modify(|span| span.observe(waited))
                    .or_insert(QueuedFor {
                        min: waited,
                        max: waited,
                    });
            }
        }
    }

    index
}

/// Periodically rebuilt view of the queues used by the lease path.
pub struct QueueCache {
    queues: Arc<dyn QueueRepository>,
    jobs: Arc<dyn JobRepository>,
    scheduling: Arc<dyn SchedulingInfoRepository>,
    metrics: Arc<dyn SchedulerMetrics>,
    cluster_expiry: Duration,
    snapshot: RwLock<Arc<QueueSnapshot>>,
}

impl QueueCache {
    pub fn new(
        repositories: &Repositories,
        metrics: Arc<dyn SchedulerMetrics>,
        cluster_expiry: Duration,
    ) -> Self {
        Self {
            queues: repositories.queues.clone(),
            jobs: repositories.jobs.clone(),
            scheduling: repositories.scheduling.clone(),
            metrics,
            cluster_expiry,
            snapshot: RwLock::new(Arc::new(QueueSnapshot::default())),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<QueueSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn queued_resources(&self, queue: &str) -> HashMap<String, ResourceVector> {
        self.snapshot().queued_resources(queue)
    }

    pub fn non_matching_job_ids(&self, queue: &str, cluster_id: &str) -> HashSet<JobId> {
        self.snapshot().non_matching_job_ids(queue, cluster_id)
    }

    /// Rebuilds and publishes the snapshot.
    ///
    /// Fails without publishing when queues or scheduling info cannot be
    /// loaded. A queue whose jobs cannot be loaded keeps its previous entries.
    pub async fn refresh(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.rebuild().await;
        self.metrics
            .record_cache_refresh(started.elapsed(), result.is_ok());
        result
    }

    async fn rebuild(&self) -> Result<()> {
        let queues = self.queues.get_all_queues().await?;
        let active_queues = self.jobs.filter_active_queues(queues).await?;
        let infos = self.scheduling.get_cluster_scheduling_info().await?;

        let now = Utc::now();
        let window = chrono::Duration::from_std(self.cluster_expiry)
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        let mut pools: HashMap<String, Vec<ClusterSchedulingInfoReport>> = HashMap::new();
        for info in infos.into_values().filter(|i| i.is_active(now, window)) {
            pools.entry(info.pool.clone()).or_default().push(info);
        }

        let previous = self.snapshot();
        let mut next = QueueSnapshot::default();

        for queue in &active_queues {
            match self.jobs.get_queued_jobs(&queue.name).await {
                Ok(jobs) => {
                    let index = index_queue(&jobs, &pools, now);
                    self.metrics.record_queue_size(&queue.name, jobs.len());
                    for (pool, span) in &index.queued_for {
                        self.metrics
                            .record_queue_duration(pool, &queue.name, span.min, span.max);
                    }
                    for (pool, demand) in &index.demand {
                        for (resource, quantity) in demand.iter() {
                            self.metrics
                                .record_queued_resource(pool, &queue.name, resource, quantity);
                        }
                    }
                    next.queued_resources.insert(queue.name.clone(), index.demand);
                    next.non_matching
                        .insert(queue.name.clone(), index.non_matching);
                }
                Err(e) => {
                    error!(queue = %queue.name, error = %e, "Failed to load queued jobs, keeping previous cache entries");
                    if let Some(demand) = previous.queued_resources.get(&queue.name) {
                        next.queued_resources
                            .insert(queue.name.clone(), demand.clone());
                    }
                    if let Some(index) = previous.non_matching.get(&queue.name) {
                        next.non_matching.insert(queue.name.clone(), index.clone());
                    }
                }
            }
        }

        debug!(
            queues = active_queues.len(),
            pools = pools.len(),
            "Queue cache refreshed"
        );
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }

    /// Up to `limit` queued jobs of `queue`, in lease order, skipping jobs
    /// the last snapshot recorded as unable to run on `cluster_id`.
    pub async fn peek_cluster_queue(
        &self,
        cluster_id: &str,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let ids = self.jobs.get_queued_job_ids(queue).await?;
        let snapshot = self.snapshot();
        let selected: Vec<JobId> = ids
            .into_iter()
            .filter(|id| !snapshot.is_excluded(queue, id, cluster_id))
            .take(limit)
            .collect();
        Ok(self.jobs.get_existing_jobs_by_ids(&selected).await?)
    }

    /// Refreshes every `interval` until `cancel` fires.
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> PeriodicTask {
        PeriodicTask::spawn("queue-cache-refresh", interval, cancel, move || {
            let cache = self.clone();
            async move {
                if let Err(e) = cache.refresh().await {
                    warn!(error = %e, "Queue cache refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use lodestar_proto::{NodeType, PodRequirements, Queue};

    fn job(id: &str, cpu: f64) -> Job {
        Job {
            id: id.into(),
            queue: "q".into(),
            job_set_id: "set".into(),
            owner: "owner".into(),
            priority: 0.0,
            created: Utc::now(),
            pod_requirements: vec![PodRequirements::with_resources(ResourceVector::from([(
                "cpu", cpu,
            )]))],
        }
    }

    fn cluster(id: &str, pool: &str, node_cpu: f64) -> ClusterSchedulingInfoReport {
        ClusterSchedulingInfoReport {
            cluster_id: id.into(),
            pool: pool.into(),
            report_time: Utc::now(),
            node_types: vec![NodeType {
                allocatable_resources: ResourceVector::from([("cpu", node_cpu)]),
                ..NodeType::default()
            }],
            minimum_job_size: ResourceVector::new(),
        }
    }

    async fn cache_with(
        jobs: Vec<Job>,
        clusters: Vec<ClusterSchedulingInfoReport>,
    ) -> (QueueCache, Repositories) {
        let repos = Repositories::memory();
        repos.queues.create_queue(&Queue::new("q")).await.unwrap();
        repos.jobs.add_jobs(&jobs).await.unwrap();
        for info in &clusters {
            repos
                .scheduling
                .update_cluster_scheduling_info(info)
                .await
                .unwrap();
        }
        let cache = QueueCache::new(&repos, Arc::new(NoopMetrics), Duration::from_secs(600));
        (cache, repos)
    }

    #[tokio::test]
    async fn refresh_indexes_demand_and_non_matching_clusters() {
        let (cache, _repos) = cache_with(
            vec![job("small", 2.0), job("big", 16.0)],
            vec![
                cluster("tiny", "cpu", 4.0),
                cluster("large", "cpu", 32.0),
                cluster("other", "gpu", 4.0),
            ],
        )
        .await;

        cache.refresh().await.unwrap();

        let demand = cache.queued_resources("q");
        assert!((demand["cpu"].get("cpu") - 18.0).abs() < 1e-9);
        assert!((demand["gpu"].get("cpu") - 2.0).abs() < 1e-9);

        let excluded = cache.non_matching_job_ids("q", "tiny");
        assert_eq!(excluded, HashSet::from(["big".to_owned()]));
        assert!(cache.non_matching_job_ids("q", "large").is_empty());
        assert!(cache.non_matching_job_ids("q", "other").contains("big"));
    }

    #[tokio::test]
    async fn peek_skips_non_matching_jobs_for_that_cluster_only() {
        let (cache, _repos) = cache_with(
            vec![job("a", 2.0), job("b", 16.0), job("c", 1.0)],
            vec![cluster("tiny", "pool", 4.0), cluster("large", "pool", 32.0)],
        )
        .await;
        cache.refresh().await.unwrap();

        let ids = |jobs: Vec<Job>| jobs.into_iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(
            ids(cache.peek_cluster_queue("tiny", "q", 10).await.unwrap()),
            vec!["a", "c"]
        );
        assert_eq!(
            ids(cache.peek_cluster_queue("large", "q", 2).await.unwrap()),
            vec!["a", "b"]
        );
        // Unknown clusters are assumed able to run everything.
        assert_eq!(
            ids(cache.peek_cluster_queue("new", "q", 10).await.unwrap()),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn stale_clusters_are_ignored() {
        let mut stale = cluster("tiny", "pool", 4.0);
        stale.report_time = Utc::now() - chrono::Duration::minutes(11);
        let (cache, _repos) = cache_with(vec![job("big", 16.0)], vec![stale]).await;

        cache.refresh().await.unwrap();

        assert!(cache.non_matching_job_ids("q", "tiny").is_empty());
        assert!(cache.queued_resources("q").is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_replaced_not_mutated() {
        let (cache, repos) =
            cache_with(vec![job("big", 16.0)], vec![cluster("tiny", "pool", 4.0)]).await;
        cache.refresh().await.unwrap();
        let before = cache.snapshot();

        repos.jobs.cancel_jobs(&["big".to_owned()]).await.unwrap();
        cache.refresh().await.unwrap();

        assert!(before.non_matching_clusters("q", "big").is_some());
        assert!(cache.snapshot().non_matching_clusters("q", "big").is_none());
    }

    #[test]
    fn queued_durations_cover_jobs_the_pool_can_run() {
        let now = Utc::now();
        let aged = |id: &str, cpu: f64, secs: i64| Job {
            created: now - chrono::Duration::seconds(secs),
            ..job(id, cpu)
        };
        let pools = HashMap::from([("small".to_owned(), vec![cluster("tiny", "small", 4.0)])]);

        let index = index_queue(
            &[aged("old", 2.0, 300), aged("recent", 2.0, 30), aged("big", 16.0, 900)],
            &pools,
            now,
        );

        assert_eq!(
            index.queued_for["small"],
            QueuedFor {
                min: Duration::from_secs(30),
                max: Duration::from_secs(300),
            }
        );
    }
}
