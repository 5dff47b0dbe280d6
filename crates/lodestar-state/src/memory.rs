use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_proto::{ClusterSchedulingInfoReport, ClusterUsageReport, Job, JobEvent, JobId, Queue};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::traits::{
    EventRepository, JobRepository, QueueRepository, SchedulingInfoRepository, UsageRepository,
};
use crate::types::ExpiredLease;

/// Position of a queued job: priority first, then id (submission order).
#[derive(Debug, Clone)]
struct QueueKey {
    priority: f64,
    id: JobId,
}

impl QueueKey {
    fn of(job: &Job) -> Self {
        Self {
            priority: job.priority,
            id: job.id.clone(),
        }
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

#[derive(Debug, Clone)]
struct Lease {
    cluster_id: String,
    leased_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    queued: HashMap<String, BTreeSet<QueueKey>>,
    leases: HashMap<JobId, Lease>,
    job_sets: HashMap<(String, String), HashSet<JobId>>,
}

impl JobTable {
    fn remove(&mut self, id: &str) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        if let Some(queued) = self.queued.get_mut(&job.queue) {
            queued.remove(&QueueKey::of(&job));
        }
        self.leases.remove(id);
        let set_key = (job.queue.clone(), job.job_set_id.clone());
        if let Some(members) = self.job_sets.get_mut(&set_key) {
            members.remove(id);
            if members.is_empty() {
                self.job_sets.remove(&set_key);
            }
        }
        Some(job)
    }
}

#[derive(Debug, Default)]
struct UsageTable {
    reports: HashMap<String, ClusterUsageReport>,
    priorities: HashMap<String, HashMap<String, f64>>,
}

/// In-process store implementing every repository.
///
/// Each table sits behind its own lock and every operation completes under a
/// single acquisition, so multi-step updates are atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    queues: Arc<RwLock<HashMap<String, Queue>>>,
    jobs: Arc<RwLock<JobTable>>,
    usage: Arc<RwLock<UsageTable>>,
    scheduling: Arc<RwLock<HashMap<String, ClusterSchedulingInfoReport>>>,
    events: Arc<RwLock<HashMap<(String, String), Vec<JobEvent>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn create_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut queues = self.queues.write().await;
        queues.insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, StoreError> {
        let queues = self.queues.read().await;
        Ok(queues.get(name).cloned())
    }

    async fn get_all_queues(&self) -> Result<Vec<Queue>, StoreError> {
        let queues = self.queues.read().await;
        let mut all: Vec<Queue> = queues.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn add_jobs(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let mut table = self.jobs.write().await;
        for job in jobs {
            table
                .queued
                .entry(job.queue.clone())
                .or_default()
                .insert(QueueKey::of(job));
            table
                .job_sets
                .entry((job.queue.clone(), job.job_set_id.clone()))
                .or_default()
                .insert(job.id.clone());
            table.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn get_queued_job_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError> {
        let table = self.jobs.read().await;
        Ok(table
            .queued
            .get(queue)
            .map(|keys| keys.iter().map(|key| key.id.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_existing_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        let table = self.jobs.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| table.jobs.get(id).cloned())
            .collect())
    }

    async fn filter_active_queues(&self, queues: Vec<Queue>) -> Result<Vec<Queue>, StoreError> {
        let table = self.jobs.read().await;
        Ok(queues
            .into_iter()
            .filter(|queue| {
                table
                    .queued
                    .get(&queue.name)
                    .is_some_and(|keys| !keys.is_empty())
            })
            .collect())
    }

    async fn try_lease_jobs(
        &self,
        cluster_id: &str,
        queue: &str,
        jobs: &[Job],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut table = self.jobs.write().await;
        let mut leased = Vec::with_capacity(jobs.len());

        for job in jobs {
            let removed = table
                .queued
                .get_mut(queue)
                .is_some_and(|keys| keys.remove(&QueueKey::of(job)));
            if !removed {
                continue;
            }
            table.leases.insert(
                job.id.clone(),
                Lease {
                    cluster_id: cluster_id.to_owned(),
                    leased_at: now,
                },
            );
            leased.push(job.clone());
        }

        Ok(leased)
    }

    async fn renew_leases(
        &self,
        cluster_id: &str,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut table = self.jobs.write().await;
        let mut renewed = Vec::new();
        for id in ids {
            if let Some(lease) = table.leases.get_mut(id) {
                if lease.cluster_id == cluster_id {
                    lease.leased_at = now;
                    renewed.push(id.clone());
                }
            }
        }
        Ok(renewed)
    }

    async fn remove_leased_jobs(
        &self,
        cluster_id: &str,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError> {
        let mut table = self.jobs.write().await;
        let mut removed = Vec::new();
        for id in ids {
            let owned = table
                .leases
                .get(id)
                .is_some_and(|lease| lease.cluster_id == cluster_id);
            if owned {
                if let Some(job) = table.remove(id) {
                    removed.push(job);
                }
            }
        }
        Ok(removed)
    }

    async fn return_expired_leases(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError> {
        let mut table = self.jobs.write().await;
        let expired: Vec<(JobId, String)> = table
            .leases
            .iter()
            .filter(|(_, lease)| lease.leased_at <= deadline)
            .map(|(id, lease)| (id.clone(), lease.cluster_id.clone()))
            .collect();

        let mut returned = Vec::with_capacity(expired.len());
        for (id, cluster_id) in expired {
            table.leases.remove(&id);
            let Some(job) = table.jobs.get(&id).cloned() else {
                continue;
            };
            table
                .queued
                .entry(job.queue.clone())
                .or_default()
                .insert(QueueKey::of(&job));
            returned.push(ExpiredLease { job, cluster_id });
        }
        Ok(returned)
    }

    async fn get_active_job_ids(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobId>, StoreError> {
        let table = self.jobs.read().await;
        let mut ids: Vec<JobId> = table
            .job_sets
            .get(&(queue.to_owned(), job_set_id.to_owned()))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        let mut table = self.jobs.write().await;
        Ok(ids.iter().filter_map(|id| table.remove(id)).collect())
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn get_cluster_usage_reports(
        &self,
    ) -> Result<HashMap<String, ClusterUsageReport>, StoreError> {
        let usage = self.usage.read().await;
        Ok(usage.reports.clone())
    }

    async fn get_cluster_priority(
        &self,
        cluster_id: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let usage = self.usage.read().await;
        Ok(usage.priorities.get(cluster_id).cloned().unwrap_or_default())
    }

    async fn get_cluster_priorities(
        &self,
        cluster_ids: &[String],
    ) -> Result<HashMap<String, HashMap<String, f64>>, StoreError> {
        let usage = self.usage.read().await;
        Ok(cluster_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    usage.priorities.get(id).cloned().unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn update_cluster(
        &self,
        report: &ClusterUsageReport,
        priorities: &HashMap<String, f64>,
        previous_report_time: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut usage = self.usage.write().await;
        let current = usage
            .reports
            .get(&report.cluster_id)
            .map(|existing| existing.report_time);
        if current != previous_report_time {
            return Ok(false);
        }

        usage
            .reports
            .insert(report.cluster_id.clone(), report.clone());
        usage
            .priorities
            .entry(report.cluster_id.clone())
            .or_default()
            .extend(priorities.iter().map(|(queue, p)| (queue.clone(), *p)));
        Ok(true)
    }
}

#[async_trait]
impl SchedulingInfoRepository for MemoryStore {
    async fn get_cluster_scheduling_info(
        &self,
    ) -> Result<HashMap<String, ClusterSchedulingInfoReport>, StoreError> {
        let scheduling = self.scheduling.read().await;
        Ok(scheduling.clone())
    }

    async fn update_cluster_scheduling_info(
        &self,
        report: &ClusterSchedulingInfoReport,
    ) -> Result<(), StoreError> {
        let mut scheduling = self.scheduling.write().await;
        scheduling.insert(report.cluster_id.clone(), report.clone());
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn report_events(&self, events: &[JobEvent]) -> Result<(), StoreError> {
        let mut streams = self.events.write().await;
        for event in events {
            streams
                .entry((event.queue.clone(), event.job_set_id.clone()))
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    async fn read_events(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobEvent>, StoreError> {
        let streams = self.events.read().await;
        Ok(streams
            .get(&(queue.to_owned(), job_set_id.to_owned()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lodestar_proto::{JobEventKind, PodRequirements, ResourceVector};

    fn job(id: &str, queue: &str, priority: f64) -> Job {
        Job {
            id: id.to_owned(),
            queue: queue.to_owned(),
            job_set_id: "set".to_owned(),
            owner: "owner".to_owned(),
            priority,
            created: Utc::now(),
            pod_requirements: vec![PodRequirements::with_resources(ResourceVector::from([(
                "cpu", 1.0,
            )]))],
        }
    }

    #[tokio::test]
    async fn queued_order_is_priority_then_id() {
        let store = MemoryStore::new();
        store
            .add_jobs(&[job("b", "q", 1.0), job("c", "q", 0.0), job("a", "q", 1.0)])
            .await
            .unwrap();

        let ids = store.get_queued_job_ids("q").await.unwrap();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn lease_claims_each_job_once() {
        let store = MemoryStore::new();
        let jobs = vec![job("a", "q", 0.0), job("b", "q", 0.0)];
        store.add_jobs(&jobs).await.unwrap();

        let first = store
            .try_lease_jobs("c1", "q", &jobs, Utc::now())
            .await
            .unwrap();
        let second = store
            .try_lease_jobs("c2", "q", &jobs, Utc::now())
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert!(store.get_queued_job_ids("q").await.unwrap().is_empty());
        assert!(store
            .filter_active_queues(vec![Queue::new("q")])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn renew_and_remove_require_lease_owner() {
        let store = MemoryStore::new();
        let jobs = vec![job("a", "q", 0.0)];
        store.add_jobs(&jobs).await.unwrap();
        store
            .try_lease_jobs("c1", "q", &jobs, Utc::now())
            .await
            .unwrap();

        let ids = vec!["a".to_owned(), "missing".to_owned()];
        assert!(store
            .renew_leases("c2", &ids, Utc::now())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.renew_leases("c1", &ids, Utc::now()).await.unwrap(),
            vec!["a"]
        );

        assert!(store.remove_leased_jobs("c2", &ids).await.unwrap().is_empty());
        let removed = store.remove_leased_jobs("c1", &ids).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store
            .get_existing_jobs_by_ids(&ids)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn expired_leases_return_to_queue() {
        let store = MemoryStore::new();
        let jobs = vec![job("a", "q", 0.0), job("b", "q", 0.0)];
        store.add_jobs(&jobs).await.unwrap();

        let leased_at = Utc::now() - chrono::Duration::minutes(30);
        store
            .try_lease_jobs("c1", "q", &jobs[..1], leased_at)
            .await
            .unwrap();
        store
            .try_lease_jobs("c1", "q", &jobs[1..], Utc::now())
            .await
            .unwrap();

        let expired = store
            .return_expired_leases(Utc::now() - chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].job.id, "a");
        assert_eq!(expired[0].cluster_id, "c1");
        assert_eq!(store.get_queued_job_ids("q").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn cancel_removes_queued_and_leased_jobs() {
        let store = MemoryStore::new();
        let jobs = vec![job("a", "q", 0.0), job("b", "q", 0.0)];
        store.add_jobs(&jobs).await.unwrap();
        store
            .try_lease_jobs("c1", "q", &jobs[..1], Utc::now())
            .await
            .unwrap();

        assert_eq!(
            store.get_active_job_ids("q", "set").await.unwrap(),
            vec!["a", "b"]
        );

        let cancelled = store
            .cancel_jobs(&["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(store.get_active_job_ids("q", "set").await.unwrap().is_empty());
        assert!(store
            .renew_leases("c1", &["a".to_owned()], Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_cluster_compares_previous_report_time() {
        let store = MemoryStore::new();
        let report = ClusterUsageReport {
            cluster_id: "c1".into(),
            pool: String::new(),
            report_time: Utc::now(),
            queues: vec![],
            cluster_capacity: ResourceVector::new(),
            cluster_available_capacity: ResourceVector::new(),
        };
        let priorities = HashMap::from([("q".to_owned(), 2.0)]);

        assert!(store
            .update_cluster(&report, &priorities, None)
            .await
            .unwrap());
        // A second writer that read "no report" loses.
        assert!(!store
            .update_cluster(&report, &priorities, None)
            .await
            .unwrap());
        assert!(store
            .update_cluster(&report, &priorities, Some(report.report_time))
            .await
            .unwrap());

        let stored = store.get_cluster_priority("c1").await.unwrap();
        assert!((stored["q"] - 2.0).abs() < f64::EPSILON);
        let all = store
            .get_cluster_priorities(&["c1".to_owned(), "c2".to_owned()])
            .await
            .unwrap();
        assert!(all["c2"].is_empty());
    }

    #[tokio::test]
    async fn events_are_kept_per_job_set() {
        let store = MemoryStore::new();
        let a = job("a", "q", 0.0);
        store
            .report_events(&[
                JobEvent::for_job(&a, JobEventKind::Submitted),
                JobEvent::for_job(&a, JobEventKind::Queued),
            ])
            .await
            .unwrap();

        let events = store.read_events("q", "set").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, JobEventKind::Queued);
        assert!(store.read_events("q", "other").await.unwrap().is_empty());
    }
}
