//! Metrics sink.
//!
//! Components report through [`SchedulerMetrics`] rather than a global
//! registry. [`PrometheusMetrics`] forwards to the `metrics` facade, whose
//! recorder the binary installs; [`NoopMetrics`] discards everything.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Observations emitted by the scheduler.
pub trait SchedulerMetrics: Send + Sync {
    /// A lease round for `cluster_id` finished.
    fn record_lease_round(&self, cluster_id: &str, jobs_leased: usize, elapsed: Duration);

    /// Jobs a queue handed out in one round.
    fn record_jobs_leased(&self, queue: &str, count: usize);

    /// Jobs another cluster claimed between peek and claim.
    fn record_lease_conflicts(&self, queue: &str, count: usize);

    /// A queue's new priority on one cluster.
    fn record_queue_priority(&self, cluster_id: &str, queue: &str, priority: f64);

    /// Queued demand of a queue in a pool for one resource.
    fn record_queued_resource(&self, pool: &str, queue: &str, resource: &str, quantity: f64);

    /// Number of jobs waiting in a queue.
    fn record_queue_size(&self, queue: &str, size: usize);

    /// Shortest and longest wait among a queue's jobs that can run in `pool`.
    fn record_queue_duration(&self, pool: &str, queue: &str, min: Duration, max: Duration);

    /// A cache refresh finished.
    fn record_cache_refresh(&self, elapsed: Duration, success: bool);

    /// Leases returned to their queue after expiry.
    fn record_expired_leases(&self, count: usize);
}

/// Discards all observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl SchedulerMetrics for NoopMetrics {
    fn record_lease_round(&self, _cluster_id: &str, _jobs_leased: usize, _elapsed: Duration) {}
    fn record_jobs_leased(&self, _queue: &str, _count: usize) {}
    fn record_lease_conflicts(&self, _queue: &str, _count: usize) {}
    fn record_queue_priority(&self, _cluster_id: &str, _queue: &str, _priority: f64) {}
    fn record_queued_resource(&self, _pool: &str, _queue: &str, _resource: &str, _quantity: f64) {}
    fn record_queue_size(&self, _queue: &str, _size: usize) {}
    fn record_queue_duration(&self, _pool: &str, _queue: &str, _min: Duration, _max: Duration) {}
    fn record_cache_refresh(&self, _elapsed: Duration, _success: bool) {}
    fn record_expired_leases(&self, _count: usize) {}
}

/// Forwards observations to the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    /// Installs the global Prometheus recorder and returns its render handle.
    pub fn install() -> Result<PrometheusHandle, BuildError> {
        PrometheusBuilder::new().install_recorder()
    }
}

#[allow(clippy::cast_precision_loss)]
impl SchedulerMetrics for PrometheusMetrics {
    fn record_lease_round(&self, cluster_id: &str, jobs_leased: usize, elapsed: Duration) {
        counter!("lodestar.lease.rounds", "cluster" => cluster_id.to_owned()).increment(1);
        histogram!("lodestar.lease.round.duration", "cluster" => cluster_id.to_owned())
            .record(elapsed.as_secs_f64());
        histogram!("lodestar.lease.round.jobs", "cluster" => cluster_id.to_owned())
            .record(jobs_leased as f64);
    }

    fn record_jobs_leased(&self, queue: &str, count: usize) {
        counter!("lodestar.jobs.leased", "queue" => queue.to_owned()).increment(count as u64);
    }

    fn record_lease_conflicts(&self, queue: &str, count: usize) {
        counter!("lodestar.lease.conflicts", "queue" => queue.to_owned()).increment(count as u64);
    }

    fn record_queue_priority(&self, cluster_id: &str, queue: &str, priority: f64) {
        gauge!(
            "lodestar.queue.priority",
            "cluster" => cluster_id.to_owned(),
            "queue" => queue.to_owned()
        )
        .set(priority);
    }

    fn record_queued_resource(&self, pool: &str, queue: &str, resource: &str, quantity: f64) {
        gauge!(
            "lodestar.queue.resource.queued",
            "pool" => pool.to_owned(),
            "queue" => queue.to_owned(),
            "resource" => resource.to_owned()
        )
        .set(quantity);
    }

    fn record_queue_size(&self, queue: &str, size: usize) {
        gauge!("lodestar.queue.size", "queue" => queue.to_owned()).set(size as f64);
    }

    fn record_queue_duration(&self, pool: &str, queue: &str, min: Duration, max: Duration) {
        gauge!(
            "lodestar.job.queued.min_seconds",
            "pool" => pool.to_owned(),
            "queue" => queue.to_owned()
        )
        .set(min.as_secs_f64());
        gauge!(
            "lodestar.job.queued.max_seconds",
            "pool" => pool.to_owned(),
            "queue" => queue.to_owned()
        )
        .set(max.as_secs_f64());
    }

    fn record_cache_refresh(&self, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!("lodestar.cache.refreshes", "outcome" => outcome).increment(1);
        histogram!("lodestar.cache.refresh.duration").record(elapsed.as_secs_f64());
    }

    fn record_expired_leases(&self, count: usize) {
        counter!("lodestar.lease.expired").increment(count as u64);
    }
}
