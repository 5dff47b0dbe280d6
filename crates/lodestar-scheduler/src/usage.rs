//! Time-decayed queue priorities from cluster usage reports.
//!
//! Every report blends each queue's previous priority on the reporting cluster
//! with its current usage:
//!
//! ```text
//! decay        = 0.5 ^ (Δt / half_life)
//! new_priority = decay × old_priority + (1 − decay) × usage
//! ```
//!
//! where Δt is the time since the cluster's previous report and usage is the
//! queue's resources weighted by their scarcity relative to CPU across all
//! active clusters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lodestar_proto::{resource, ClusterUsageReport, ResourceVector};
use lodestar_state::UsageRepository;
use tracing::{debug, info, warn};

use crate::config::PriorityConfig;
use crate::error::{Result, SchedulerError};
use crate::metrics::SchedulerMetrics;

/// Aggregates below this are treated as absent when computing scarcity.
const MIN_SCARCE_QUANTITY: f64 = 0.00001;

/// Weight of the previous priority after `time_change` has elapsed.
#[must_use]
pub fn decay_factor(time_change: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 0.0;
    }
    0.5_f64.powf(time_change.as_secs_f64() / half_life.as_secs_f64())
}

/// Value of one unit of each resource, in CPUs.
///
/// CPU is worth one; any other resource is worth the ratio of total CPU to
/// its own total, so scarce resources weigh more.
#[must_use]
pub fn resource_scarcity(total: &ResourceVector) -> HashMap<String, f64> {
    let cpu = total.get(resource::CPU);
    let mut scarcity = HashMap::from([(resource::CPU.to_owned(), 1.0)]);
    for (name, quantity) in total.iter() {
        if name != resource::CPU && quantity >= MIN_SCARCE_QUANTITY {
            scarcity.insert(name.to_owned(), cpu / quantity);
        }
    }
    scarcity
}

/// Scarcity-weighted sum of `resources`. Resources without a scarcity entry
/// count one-for-one.
#[must_use]
pub fn usage_score(resources: &ResourceVector, scarcity: &HashMap<String, f64>) -> f64 {
    resources
        .iter()
        .map(|(name, quantity)| quantity * scarcity.get(name).copied().unwrap_or(1.0))
        .sum()
}

/// Usage score of every queue in the report.
#[must_use]
pub fn queue_usage(
    report: &ClusterUsageReport,
    scarcity: &HashMap<String, f64>,
) -> HashMap<String, f64> {
    report
        .queues
        .iter()
        .map(|queue| (queue.name.clone(), usage_score(&queue.resources, scarcity)))
        .collect()
}

/// Blends old priorities with usage for every queue present in either map.
#[must_use]
pub fn decayed_priorities(
    old: &HashMap<String, f64>,
    usage: &HashMap<String, f64>,
    decay: f64,
) -> HashMap<String, f64> {
    old.keys()
        .chain(usage.keys())
        .map(|queue| {
            let previous = old.get(queue).copied().unwrap_or(0.0);
            let current = usage.get(queue).copied().unwrap_or(0.0);
            (queue.clone(), decay * previous + (1.0 - decay) * current)
        })
        .collect()
}

/// Maintains per-cluster queue priorities from usage reports.
pub struct PriorityTracker {
    usage: Arc<dyn UsageRepository>,
    metrics: Arc<dyn SchedulerMetrics>,
    config: PriorityConfig,
    cluster_expiry: Duration,
}

impl PriorityTracker {
    pub fn new(
        usage: Arc<dyn UsageRepository>,
        metrics: Arc<dyn SchedulerMetrics>,
        config: PriorityConfig,
        cluster_expiry: Duration,
    ) -> Self {
        Self {
            usage,
            metrics,
            config,
            cluster_expiry,
        }
    }

    /// Records `report` and returns the cluster's new queue priorities.
    ///
    /// The read-compute-write cycle is retried when another report for the
    /// same cluster lands in between.
    pub async fn report_usage(&self, report: ClusterUsageReport) -> Result<HashMap<String, f64>> {
        if report.cluster_id.is_empty() {
            return Err(SchedulerError::invalid_argument("cluster id is required"));
        }

        let attempts = self.config.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let reports = self.usage.get_cluster_usage_reports().await?;
            let old = self.usage.get_cluster_priority(&report.cluster_id).await?;
            let previous_time = reports.get(&report.cluster_id).map(|r| r.report_time);

            let priorities = self.compute(&report, reports, &old)?;

            if self
                .usage
                .update_cluster(&report, &priorities, previous_time)
                .await?
            {
                for (queue, priority) in &priorities {
                    self.metrics
                        .record_queue_priority(&report.cluster_id, queue, *priority);
                }
                debug!(
                    cluster_id = %report.cluster_id,
                    queues = priorities.len(),
                    "Cluster priorities updated"
                );
                return Ok(priorities);
            }

            info!(
                cluster_id = %report.cluster_id,
                attempt,
                "Concurrent usage report detected, retrying"
            );
        }

        Err(SchedulerError::Conflict(format!(
            "usage report for cluster {} conflicted {} times",
            report.cluster_id, attempts
        )))
    }

    fn compute(
        &self,
        report: &ClusterUsageReport,
        mut reports: HashMap<String, ClusterUsageReport>,
        old: &HashMap<String, f64>,
    ) -> Result<HashMap<String, f64>> {
        let time_change = match reports.get(&report.cluster_id) {
            Some(previous) => (report.report_time - previous.report_time)
                .to_std()
                .unwrap_or_else(|_| {
                    warn!(
                        cluster_id = %report.cluster_id,
                        "Usage report is older than the previous one, keeping priorities"
                    );
                    Duration::ZERO
                }),
            None => self.config.default_time_change,
        };

        reports.insert(report.cluster_id.clone(), report.clone());
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.cluster_expiry)
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        let total_capacity = ResourceVector::sum(
            reports
                .values()
                .filter(|r| r.is_active(now, window))
                .map(|r| &r.cluster_capacity),
        );

        let scarcity = resource_scarcity(&total_capacity);
        let usage = queue_usage(report, &scarcity);
        let decay = decay_factor(time_change, self.config.half_life);
        Ok(decayed_priorities(old, &usage, decay))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use async_trait::async_trait;
    use chrono::DateTime;
    use lodestar_proto::QueueReport;
    use lodestar_state::{MemoryStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lets another writer report for the same cluster just before each of
    /// the first `races` writes.
    struct RacingUsage {
        inner: MemoryStore,
        races: AtomicUsize,
    }

    #[async_trait]
    impl UsageRepository for RacingUsage {
        async fn get_cluster_usage_reports(
            &self,
        ) -> std::result::Result<HashMap<String, ClusterUsageReport>, StoreError> {
            self.inner.get_cluster_usage_reports().await
        }

        async fn get_cluster_priority(
            &self,
            cluster_id: &str,
        ) -> std::result::Result<HashMap<String, f64>, StoreError> {
            self.inner.get_cluster_priority(cluster_id).await
        }

        async fn get_cluster_priorities(
            &self,
            cluster_ids: &[String],
        ) -> std::result::Result<HashMap<String, HashMap<String, f64>>, StoreError> {
            self.inner.get_cluster_priorities(cluster_ids).await
        }

        async fn update_cluster(
            &self,
            report: &ClusterUsageReport,
            priorities: &HashMap<String, f64>,
            previous_report_time: Option<DateTime<Utc>>,
        ) -> std::result::Result<bool, StoreError> {
            let remaining = self.races.load(Ordering::SeqCst);
            if remaining > 0 {
                self.races.store(remaining - 1, Ordering::SeqCst);
                let current = self
                    .inner
                    .get_cluster_usage_reports()
                    .await?
                    .get(&report.cluster_id)
                    .map(|r| r.report_time);
                let mut rival = report.clone();
                rival.report_time =
                    report.report_time - chrono::Duration::seconds(60 * remaining as i64);
                let won = self
                    .inner
                    .update_cluster(&rival, &HashMap::from([("q".to_owned(), 2.0)]), current)
                    .await?;
                assert!(won);
            }
            self.inner
                .update_cluster(report, priorities, previous_report_time)
                .await
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn decay_halves_each_half_life() {
        let half_life = Duration::from_secs(60);
        assert!(approx(decay_factor(Duration::ZERO, half_life), 1.0));
        assert!(approx(decay_factor(Duration::from_secs(60), half_life), 0.5));
        assert!(approx(decay_factor(Duration::from_secs(120), half_life), 0.25));
    }

    #[test]
    fn scarcity_is_relative_to_cpu() {
        let total = ResourceVector::from([
            ("cpu", 100.0),
            ("memory", 400.0),
            ("nvidia.com/gpu", 4.0),
            ("ephemeral", 0.0),
        ]);
        let scarcity = resource_scarcity(&total);
        assert!(approx(scarcity["cpu"], 1.0));
        assert!(approx(scarcity["memory"], 0.25));
        assert!(approx(scarcity["nvidia.com/gpu"], 25.0));
        assert!(!scarcity.contains_key("ephemeral"));
    }

    #[test]
    fn usage_defaults_unknown_resources_to_one() {
        let scarcity = HashMap::from([("cpu".to_owned(), 1.0), ("memory".to_owned(), 0.5)]);
        let usage = ResourceVector::from([("cpu", 2.0), ("memory", 4.0), ("disk", 3.0)]);
        assert!(approx(usage_score(&usage, &scarcity), 2.0 + 2.0 + 3.0));
    }

    #[test]
    fn blend_covers_old_and_new_queues() {
        let old = HashMap::from([("a".to_owned(), 4.0), ("b".to_owned(), 2.0)]);
        let usage = HashMap::from([("b".to_owned(), 6.0), ("c".to_owned(), 8.0)]);
        let blended = decayed_priorities(&old, &usage, 0.5);
        assert!(approx(blended["a"], 2.0));
        assert!(approx(blended["b"], 4.0));
        assert!(approx(blended["c"], 4.0));
    }

    #[test]
    fn repeated_usage_converges() {
        let usage = HashMap::from([("q".to_owned(), 10.0)]);
        let mut priorities = HashMap::from([("q".to_owned(), 100.0)]);
        for _ in 0..60 {
            priorities = decayed_priorities(&priorities, &usage, 0.5);
        }
        assert!(approx(priorities["q"], 10.0));
    }

    fn report(cluster: &str, at: chrono::DateTime<Utc>, cpu_used: f64) -> ClusterUsageReport {
        ClusterUsageReport {
            cluster_id: cluster.into(),
            pool: "default".into(),
            report_time: at,
            queues: vec![QueueReport {
                name: "q".into(),
                resources: ResourceVector::from([("cpu", cpu_used)]),
                resources_used: ResourceVector::new(),
            }],
            cluster_capacity: ResourceVector::from([("cpu", 100.0)]),
            cluster_available_capacity: ResourceVector::new(),
        }
    }

    fn tracker(store: MemoryStore) -> PriorityTracker {
        tracker_over(Arc::new(store))
    }

    fn tracker_over(usage: Arc<dyn UsageRepository>) -> PriorityTracker {
        PriorityTracker::new(
            usage,
            Arc::new(NoopMetrics),
            PriorityConfig {
                half_life: Duration::from_secs(60),
                ..PriorityConfig::default()
            },
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn priority_decays_between_reports() {
        let store = MemoryStore::new();
        let tracker = tracker(store.clone());
        let start = Utc::now();

        let first = tracker.report_usage(report("c1", start, 0.0)).await.unwrap();
        assert!(approx(first["q"], 0.0));

        let second = tracker
            .report_usage(report("c1", start + chrono::Duration::seconds(60), 10.0))
            .await
            .unwrap();
        assert!(approx(second["q"], 5.0));

        let stored = store.get_cluster_priority("c1").await.unwrap();
        assert!(approx(stored["q"], 5.0));
    }

    #[tokio::test]
    async fn first_report_uses_default_time_change() {
        let tracker = tracker(MemoryStore::new());
        // Half-life equals the one-minute default, so half the usage lands.
        let priorities = tracker
            .report_usage(report("c1", Utc::now(), 10.0))
            .await
            .unwrap();
        assert!(approx(priorities["q"], 5.0));
    }

    #[tokio::test]
    async fn out_of_order_report_keeps_priority() {
        let tracker = tracker(MemoryStore::new());
        let start = Utc::now();
        tracker.report_usage(report("c1", start, 10.0)).await.unwrap();

        let priorities = tracker
            .report_usage(report("c1", start - chrono::Duration::seconds(30), 50.0))
            .await
            .unwrap();
        assert!(approx(priorities["q"], 5.0));
    }

    #[tokio::test]
    async fn empty_cluster_id_is_rejected() {
        let tracker = tracker(MemoryStore::new());
        let result = tracker.report_usage(report("", Utc::now(), 1.0)).await;
        assert!(matches!(result, Err(SchedulerError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn lost_update_is_retried_against_the_winner() {
        let store = MemoryStore::new();
        let tracker = tracker_over(Arc::new(RacingUsage {
            inner: store.clone(),
            races: AtomicUsize::new(1),
        }));
        let now = Utc::now();

        // The winner reported a minute earlier with priority 2, so the retry
        // blends from there: 0.5 * 2 + 0.5 * 10.
        let priorities = tracker.report_usage(report("c1", now, 10.0)).await.unwrap();
        assert!(approx(priorities["q"], 6.0));

        let stored = store.get_cluster_priority("c1").await.unwrap();
        assert!(approx(stored["q"], 6.0));
        let reports = store.get_cluster_usage_reports().await.unwrap();
        assert_eq!(reports["c1"].report_time, now);
    }

    #[tokio::test]
    async fn repeated_conflicts_give_up() {
        let store = MemoryStore::new();
        let tracker = tracker_over(Arc::new(RacingUsage {
            inner: store.clone(),
            races: AtomicUsize::new(3),
        }));
        let now = Utc::now();

        let err = tracker
            .report_usage(report("c1", now, 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);

        // Only the rival writes landed.
        let reports = store.get_cluster_usage_reports().await.unwrap();
        assert_ne!(reports["c1"].report_time, now);
    }
}
