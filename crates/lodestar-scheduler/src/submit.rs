//! Queue administration, job submission and cancellation.

use std::sync::Arc;

use chrono::Utc;
use lodestar_proto::{
    new_job_id, Job, JobCancelRequest, JobEvent, JobEventKind, JobId, JobSubmitRequest, Queue,
};
use lodestar_state::{EventRepository, JobRepository, QueueRepository, Repositories};
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};

/// Client-facing write operations.
pub struct SubmitService {
    queues: Arc<dyn QueueRepository>,
    jobs: Arc<dyn JobRepository>,
    events: Arc<dyn EventRepository>,
}

impl SubmitService {
    pub fn new(repositories: &Repositories) -> Self {
        Self {
            queues: repositories.queues.clone(),
            jobs: repositories.jobs.clone(),
            events: repositories.events.clone(),
        }
    }

    /// Creates or replaces a queue.
    pub async fn create_queue(&self, queue: Queue) -> Result<()> {
        if queue.name.is_empty() {
            return Err(SchedulerError::invalid_argument("queue name is required"));
        }
        if queue.priority_factor <= 0.0 || !queue.priority_factor.is_finite() {
            return Err(SchedulerError::invalid_argument(format!(
                "priority factor must be positive, got {}",
                queue.priority_factor
            )));
        }

        self.queues.create_queue(&queue).await?;
        info!(queue = %queue.name, priority_factor = queue.priority_factor, "Queue created");
        Ok(())
    }

    /// Queues every item of the request and returns the new job ids in
    /// request order.
    pub async fn submit_jobs(&self, request: JobSubmitRequest) -> Result<Vec<JobId>> {
        if request.job_set_id.is_empty() {
            return Err(SchedulerError::invalid_argument("job set id is required"));
        }
        if request.items.is_empty() {
            return Err(SchedulerError::invalid_argument("no jobs to submit"));
        }
        for (index, item) in request.items.iter().enumerate() {
            if item.pod_requirements.is_empty() {
                return Err(SchedulerError::invalid_argument(format!(
                    "job {index} has no pod requirements"
                )));
            }
            if !item.pod_requirements.iter().all(|pod| pod.resources.is_valid()) {
                return Err(SchedulerError::invalid_argument(format!(
                    "job {index} requests negative resources"
                )));
            }
        }
        if self.queues.get_queue(&request.queue).await?.is_none() {
            return Err(SchedulerError::QueueNotFound(request.queue));
        }

        let created = Utc::now();
        let jobs: Vec<Job> = request
            .items
            .into_iter()
            .map(|item| Job {
                id: new_job_id(),
                queue: request.queue.clone(),
                job_set_id: request.job_set_id.clone(),
                owner: request.owner.clone(),
                priority: item.priority,
                created,
                pod_requirements: item.pod_requirements,
            })
            .collect();

        self.jobs.add_jobs(&jobs).await?;

        let events: Vec<JobEvent> = jobs
            .iter()
            .flat_map(|job| {
                [
                    JobEvent::for_job(job, JobEventKind::Submitted),
                    JobEvent::for_job(job, JobEventKind::Queued),
                ]
            })
            .collect();
        self.events.report_events(&events).await?;

        info!(
            queue = %request.queue,
            job_set_id = %request.job_set_id,
            count = jobs.len(),
            "Jobs submitted"
        );
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Cancels one job, or every active job of a job set.
    pub async fn cancel_jobs(&self, request: JobCancelRequest) -> Result<Vec<JobId>> {
        let ids = match (&request.job_id, &request.queue, &request.job_set_id) {
            (Some(id), _, _) if !id.is_empty() => vec![id.clone()],
            (_, Some(queue), Some(set)) if !queue.is_empty() && !set.is_empty() => {
                self.jobs.get_active_job_ids(queue, set).await?
            }
            _ => {
                return Err(SchedulerError::invalid_argument(
                    "specify a job id or a queue with a job set id",
                ))
            }
        };

        let jobs = self.jobs.get_existing_jobs_by_ids(&ids).await?;
        if jobs.len() < ids.len() {
            warn!(
                requested = ids.len(),
                found = jobs.len(),
                "Some jobs to cancel no longer exist"
            );
        }
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let cancelling: Vec<JobEvent> = jobs
            .iter()
            .map(|job| JobEvent::for_job(job, JobEventKind::Cancelling))
            .collect();
        self.events.report_events(&cancelling).await?;

        let found: Vec<JobId> = jobs.into_iter().map(|job| job.id).collect();
        let cancelled = self.jobs.cancel_jobs(&found).await?;

        let events: Vec<JobEvent> = cancelled
            .iter()
            .map(|job| JobEvent::for_job(job, JobEventKind::Cancelled))
            .collect();
        self.events.report_events(&events).await?;

        info!(count = cancelled.len(), "Jobs cancelled");
        Ok(cancelled.into_iter().map(|job| job.id).collect())
    }
}
