//! Job lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::types::JobId;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Submitted,
    Queued,
    Leased { cluster_id: String },
    LeaseExpired { cluster_id: String },
    Cancelling,
    Cancelled,
    Done { cluster_id: String },
}

/// An event appended to a job set's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub queue: String,
    pub job_set_id: String,
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    /// Creates an event for `job` stamped with the current time.
    #[must_use]
    pub fn for_job(job: &Job, kind: JobEventKind) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            job_set_id: job.job_set_id.clone(),
            created: Utc::now(),
            kind,
        }
    }
}
