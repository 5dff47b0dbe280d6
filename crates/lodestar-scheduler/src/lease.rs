//! Lease rounds, renewals, completions and lease expiry.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lodestar_proto::{
    ClusterSchedulingInfoReport, DoneResult, Job, JobEvent, JobEventKind, JobId, LeaseRequest,
    Queue, RenewalResult, ResourceVector,
};
use lodestar_state::{
    EventRepository, ExpiredLease, JobRepository, QueueRepository, Repositories,
    SchedulingInfoRepository, UsageRepository,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::QueueCache;
use crate::config::LeaseConfig;
use crate::error::{Result, SchedulerError};
use crate::fairshare::FairShareSlicer;
use crate::metrics::SchedulerMetrics;
use crate::task::PeriodicTask;

/// Runs `fut` unless `deadline` passes first.
async fn within<T, E, F>(deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<SchedulerError>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(SchedulerError::Timeout),
    }
}

fn has_capacity(slice: &ResourceVector) -> bool {
    slice.iter().any(|(_, quantity)| quantity > 0.0)
}

/// Hands queued jobs to executor clusters.
pub struct LeaseEngine {
    queues: Arc<dyn QueueRepository>,
    jobs: Arc<dyn JobRepository>,
    usage: Arc<dyn UsageRepository>,
    scheduling: Arc<dyn SchedulingInfoRepository>,
    events: Arc<dyn EventRepository>,
    cache: Arc<QueueCache>,
    metrics: Arc<dyn SchedulerMetrics>,
    slicer: FairShareSlicer,
    config: LeaseConfig,
}

impl LeaseEngine {
    pub fn new(
        repositories: &Repositories,
        cache: Arc<QueueCache>,
        metrics: Arc<dyn SchedulerMetrics>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            queues: repositories.queues.clone(),
            jobs: repositories.jobs.clone(),
            usage: repositories.usage.clone(),
            scheduling: repositories.scheduling.clone(),
            events: repositories.events.clone(),
            cache,
            metrics,
            slicer: FairShareSlicer::new(config.min_priority),
            config,
        }
    }

    fn cluster_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.config.cluster_expiry)
            .map_err(|e| SchedulerError::Config(e.to_string()))
    }

    /// Leases jobs to the requesting cluster, splitting the offered resources
    /// across active queues in inverse proportion to their priority.
    ///
    /// Each job is claimed by at most one cluster. When the round's deadline
    /// passes, the jobs claimed so far are returned.
    pub async fn lease_jobs(&self, request: &LeaseRequest) -> Result<Vec<Job>> {
        if request.cluster_id.is_empty() {
            return Err(SchedulerError::invalid_argument("cluster id is required"));
        }
        if !request.resources.is_valid() {
            return Err(SchedulerError::invalid_argument(
                "offered resources must not be negative",
            ));
        }

        let started = Instant::now();
        let deadline = started + self.config.request_timeout;

        if !request.nodes.is_empty() {
            self.record_scheduling_info(request).await;
        }

        let priorities = self.active_priorities(deadline).await?;
        let queues = within(deadline, self.queues.get_all_queues()).await?;
        let active = within(deadline, self.jobs.filter_active_queues(queues)).await?;
        if active.is_empty() {
            debug!(cluster_id = %request.cluster_id, "No queued jobs to lease");
            return Ok(Vec::new());
        }

        let effective = self.effective_priorities(&active, &priorities);
        let shares = self.slicer.slice(&effective, &request.resources);

        let mut order: Vec<&Queue> = active.iter().collect();
        order.sort_by(|a, b| {
            effective[&a.name]
                .total_cmp(&effective[&b.name])
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut leased = Vec::new();
        for queue in order {
            let Some(slice) = shares.get(&queue.name) else {
                continue;
            };
            if !has_capacity(slice) {
                continue;
            }

            let before = leased.len();
            let outcome = self
                .lease_from_queue(request, &queue.name, slice.clone(), deadline, &mut leased)
                .await;
            self.metrics
                .record_jobs_leased(&queue.name, leased.len() - before);

            match outcome {
                Ok(()) => {}
                Err(SchedulerError::Timeout) => {
                    warn!(
                        cluster_id = %request.cluster_id,
                        queue = %queue.name,
                        leased = leased.len(),
                        "Lease deadline exceeded, returning jobs leased so far"
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        cluster_id = %request.cluster_id,
                        queue = %queue.name,
                        error = %e,
                        "Failed to lease jobs from queue"
                    );
                }
            }
        }

        self.emit_leased(&request.cluster_id, &leased).await;
        self.metrics
            .record_lease_round(&request.cluster_id, leased.len(), started.elapsed());
        info!(
            cluster_id = %request.cluster_id,
            jobs = leased.len(),
            queues = active.len(),
            "Lease round complete"
        );
        Ok(leased)
    }

    async fn record_scheduling_info(&self, request: &LeaseRequest) {
        let info = ClusterSchedulingInfoReport {
            cluster_id: request.cluster_id.clone(),
            pool: request.pool.clone(),
            report_time: Utc::now(),
            node_types: request.nodes.clone(),
            minimum_job_size: request.minimum_job_size.clone(),
        };
        if let Err(e) = self.scheduling.update_cluster_scheduling_info(&info).await {
            warn!(cluster_id = %request.cluster_id, error = %e, "Failed to record scheduling info");
        }
    }

    /// Sum of each queue's priority across clusters with a fresh usage report.
    async fn active_priorities(&self, deadline: Instant) -> Result<HashMap<String, f64>> {
        let reports = within(deadline, self.usage.get_cluster_usage_reports()).await?;
        let now = Utc::now();
        let window = self.cluster_window()?;
        let active: Vec<String> = reports
            .into_values()
            .filter(|report| report.is_active(now, window))
            .map(|report| report.cluster_id)
            .collect();

        let per_cluster = within(deadline, self.usage.get_cluster_priorities(&active)).await?;
        let mut total: HashMap<String, f64> = HashMap::new();
        for priorities in per_cluster.into_values() {
            for (queue, priority) in priorities {
                *total.entry(queue).or_insert(0.0) += priority;
            }
        }
        Ok(total)
    }

    fn effective_priorities(
        &self,
        queues: &[Queue],
        priorities: &HashMap<String, f64>,
    ) -> HashMap<String, f64> {
        queues
            .iter()
            .map(|queue| {
                let base = priorities
                    .get(&queue.name)
                    .copied()
                    .unwrap_or(self.config.min_priority);
                (queue.name.clone(), base * queue.priority_factor)
            })
            .collect()
    }

    /// Claims batches from one queue until its slice or its jobs run out.
    async fn lease_from_queue(
        &self,
        request: &LeaseRequest,
        queue: &str,
        mut slice: ResourceVector,
        deadline: Instant,
        leased: &mut Vec<Job>,
    ) -> Result<()> {
        let batch_size = self.config.batch_size;

        loop {
            let candidates = within(
                deadline,
                self.cache
                    .peek_cluster_queue(&request.cluster_id, queue, batch_size),
            )
            .await?;

            let mut selected = Vec::new();
            for job in candidates {
                let request_size = job.total_resource_request();
                if !request_size.at_least(&request.minimum_job_size) {
                    continue;
                }
                let mut remaining = slice.clone();
                remaining.sub(&request_size);
                if remaining.is_valid() {
                    slice = remaining;
                    selected.push(job);
                }
            }
            if selected.is_empty() {
                return Ok(());
            }

            // A claim may commit before it returns; the deadline only gates
            // starting one.
            if Instant::now() >= deadline {
                return Err(SchedulerError::Timeout);
            }
            let claimed = self
                .jobs
                .try_lease_jobs(&request.cluster_id, queue, &selected, Utc::now())
                .await?;

            let lost = selected.len() - claimed.len();
            if lost > 0 {
                debug!(queue = %queue, lost, "Jobs claimed by another cluster");
                self.metrics.record_lease_conflicts(queue, lost);
            }

            let exhausted = claimed.len() < batch_size;
            leased.extend(claimed);
            if exhausted {
                return Ok(());
            }
        }
    }

    async fn emit_leased(&self, cluster_id: &str, jobs: &[Job]) {
        if jobs.is_empty() {
            return;
        }
        let events: Vec<JobEvent> = jobs
            .iter()
            .map(|job| {
                JobEvent::for_job(
                    job,
                    JobEventKind::Leased {
                        cluster_id: cluster_id.to_owned(),
                    },
                )
            })
            .collect();
        if let Err(e) = self.events.report_events(&events).await {
            error!(cluster_id = %cluster_id, error = %e, "Failed to report leased events");
        }
    }

    /// Refreshes leases held by `cluster_id`. Ids not leased by it fail.
    pub async fn renew_lease(&self, cluster_id: &str, ids: &[JobId]) -> Result<RenewalResult> {
        let renewed = self.jobs.renew_leases(cluster_id, ids, Utc::now()).await?;
        let renewed_set: HashSet<&JobId> = renewed.iter().collect();
        let failed: Vec<JobId> = ids
            .iter()
            .filter(|id| !renewed_set.contains(id))
            .cloned()
            .collect();

        if !failed.is_empty() {
            warn!(
                cluster_id = %cluster_id,
                failed = ?failed,
                "Could not renew leases"
            );
        }
        Ok(RenewalResult { renewed, failed })
    }

    /// Removes finished jobs leased by `cluster_id`.
    pub async fn report_done(&self, cluster_id: &str, ids: &[JobId]) -> Result<DoneResult> {
        let removed = self.jobs.remove_leased_jobs(cluster_id, ids).await?;
        let done: Vec<JobId> = removed.iter().map(|job| job.id.clone()).collect();
        let done_set: HashSet<&JobId> = done.iter().collect();
        let failed: Vec<JobId> = ids
            .iter()
            .filter(|id| !done_set.contains(id))
            .cloned()
            .collect();

        if !failed.is_empty() {
            warn!(
                cluster_id = %cluster_id,
                failed = ?failed,
                "Done reported for jobs not leased by cluster"
            );
        }

        let events: Vec<JobEvent> = removed
            .iter()
            .map(|job| {
                JobEvent::for_job(
                    job,
                    JobEventKind::Done {
                        cluster_id: cluster_id.to_owned(),
                    },
                )
            })
            .collect();
        if !events.is_empty() {
            if let Err(e) = self.events.report_events(&events).await {
                error!(cluster_id = %cluster_id, error = %e, "Failed to report done events");
            }
        }

        Ok(DoneResult { done, failed })
    }

    /// Returns jobs whose lease was not renewed within the expiry window to
    /// their queues.
    pub async fn expire_leases(&self) -> Result<Vec<ExpiredLease>> {
        let expiry = chrono::Duration::from_std(self.config.lease_expiry)
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        let expired = self
            .jobs
            .return_expired_leases(Utc::now() - expiry)
            .await?;
        if expired.is_empty() {
            return Ok(expired);
        }

        self.metrics.record_expired_leases(expired.len());
        info!(count = expired.len(), "Returned expired leases to their queues");

        let events: Vec<JobEvent> = expired
            .iter()
            .map(|lease| {
                JobEvent::for_job(
                    &lease.job,
                    JobEventKind::LeaseExpired {
                        cluster_id: lease.cluster_id.clone(),
                    },
                )
            })
            .collect();
        if let Err(e) = self.events.report_events(&events).await {
            error!(error = %e, "Failed to report lease expiry events");
        }
        Ok(expired)
    }

    /// Sweeps expired leases every `interval` until `cancel` fires.
    pub fn spawn_lease_expiry(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> PeriodicTask {
        PeriodicTask::spawn("lease-expiry", interval, cancel, move || {
            let engine = self.clone();
            async move {
                if let Err(e) = engine.expire_leases().await {
                    warn!(error = %e, "Lease expiry sweep failed");
                }
            }
        })
    }
}
