//! Valkey/Redis backend for every repository.
//!
//! Key layout under the namespace `ns`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `ns:queues` | hash | queue name → queue JSON |
//! | `ns:job:{id}` | string | job JSON |
//! | `ns:queue:{name}:jobs` | zset | queued ids, score = job priority |
//! | `ns:leased` | zset | leased ids, score = lease time (ms) |
//! | `ns:job:cluster` | hash | leased id → cluster id |
//! | `ns:jobset:{queue}:{set}` | set | active ids of a job set |
//! | `ns:cluster:report` | hash | cluster id → usage report JSON |
//! | `ns:cluster:report_time` | hash | cluster id → report time (ms) |
//! | `ns:cluster:priority:{id}` | hash | queue → priority |
//! | `ns:cluster:scheduling` | hash | cluster id → scheduling info JSON |
//! | `ns:events:{queue}:{set}` | list | event JSON |
//!
//! Every multi-key state change runs as one Lua script.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, PoolError, Runtime};
use lodestar_proto::{ClusterSchedulingInfoReport, ClusterUsageReport, Job, JobEvent, JobId, Queue};
use redis::{AsyncCommands, RedisError, Script};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{
    EventRepository, JobRepository, QueueRepository, SchedulingInfoRepository, UsageRepository,
};
use crate::types::ExpiredLease;

const LEASE_SCRIPT: &str = r"
local leased = {}
for i = 3, #ARGV do
  local id = ARGV[i]
  if redis.call('ZREM', KEYS[1], id) == 1 then
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    redis.call('HSET', KEYS[3], id, ARGV[1])
    table.insert(leased, id)
  end
end
return leased
";

const RENEW_SCRIPT: &str = r"
local renewed = {}
for i = 3, #ARGV do
  local id = ARGV[i]
  if redis.call('HGET', KEYS[2], id) == ARGV[1] and redis.call('ZSCORE', KEYS[1], id) then
    redis.call('ZADD', KEYS[1], ARGV[2], id)
    table.insert(renewed, id)
  end
end
return renewed
";

// KEYS: leased, clusters, then (job key, job set key) per id.
const REMOVE_LEASED_SCRIPT: &str = r"
local removed = {}
for i = 2, #ARGV do
  local id = ARGV[i]
  if redis.call('HGET', KEYS[2], id) == ARGV[1] then
    redis.call('ZREM', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    redis.call('DEL', KEYS[2 * (i - 1) + 1])
    redis.call('SREM', KEYS[2 * (i - 1) + 2], id)
    table.insert(removed, id)
  end
end
return removed
";

const RETURN_LEASE_SCRIPT: &str = r"
local score = redis.call('ZSCORE', KEYS[1], ARGV[2])
if score and tonumber(score) <= tonumber(ARGV[1]) then
  local cluster = redis.call('HGET', KEYS[2], ARGV[2])
  redis.call('ZREM', KEYS[1], ARGV[2])
  redis.call('HDEL', KEYS[2], ARGV[2])
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
  return cluster or ''
end
return false
";

const CANCEL_SCRIPT: &str = r"
if redis.call('DEL', KEYS[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
return 1
";

const UPDATE_CLUSTER_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if (current or '') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[3], ARGV[i], ARGV[i + 1])
end
return 1
";

/// Longest wait for a free pooled connection.
const POOL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

fn backend(e: RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Valkey/Redis store implementing every repository.
#[derive(Clone)]
pub struct ValkeyStore {
    pool: Pool,
    namespace: String,
}

impl std::fmt::Debug for ValkeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl ValkeyStore {
    /// Connects to Valkey and verifies the connection with a PING.
    pub async fn new(url: &str, namespace: &str, pool_size: usize) -> Result<Self, StoreError> {
        let config = Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .max_size(pool_size)
            .wait_timeout(Some(POOL_WAIT_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            namespace: namespace.to_owned(),
        };

        let mut conn = store.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(store)
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => StoreError::Timeout,
            other => StoreError::Connection(other.to_string()),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        self.key(&format!("job:{id}"))
    }

    fn queue_jobs_key(&self, queue: &str) -> String {
        self.key(&format!("queue:{queue}:jobs"))
    }

    fn job_set_key(&self, queue: &str, job_set_id: &str) -> String {
        self.key(&format!("jobset:{queue}:{job_set_id}"))
    }

    fn priority_key(&self, cluster_id: &str) -> String {
        self.key(&format!("cluster:priority:{cluster_id}"))
    }

    fn events_key(&self, queue: &str, job_set_id: &str) -> String {
        self.key(&format!("events:{queue}:{job_set_id}"))
    }

    async fn load_jobs(&self, conn: &mut Connection, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.job_key(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut **conn)
            .await
            .map_err(backend)?;

        values
            .into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl QueueRepository for ValkeyStore {
    async fn create_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(queue)?;
        conn.hset::<_, _, _, ()>(self.key("queues"), &queue.name, json)
            .await
            .map_err(backend)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, StoreError> {
        let mut conn = self.connection().await?;
        let json: Option<String> = conn
            .hget(self.key("queues"), name)
            .await
            .map_err(backend)?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    async fn get_all_queues(&self) -> Result<Vec<Queue>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn.hvals(self.key("queues")).await.map_err(backend)?;
        let mut queues = values
            .iter()
            .map(|json| serde_json::from_str::<Queue>(json).map_err(StoreError::from))
            .collect::<Result<Vec<_>, _>>()?;
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }
}

#[async_trait]
impl JobRepository for ValkeyStore {
    async fn add_jobs(&self, jobs: &[Job]) -> Result<(), StoreError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in jobs {
            pipe.set(self.job_key(&job.id), serde_json::to_string(job)?)
                .ignore()
                .zadd(self.queue_jobs_key(&job.queue), &job.id, job.priority)
                .ignore()
                .sadd(self.job_set_key(&job.queue, &job.job_set_id), &job.id)
                .ignore();
        }
        let (): () = pipe.query_async(&mut *conn).await.map_err(backend)?;
        Ok(())
    }

    async fn get_queued_job_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError> {
        let mut conn = self.connection().await?;
        conn.zrange(self.queue_jobs_key(queue), 0, -1)
            .await
            .map_err(backend)
    }

    async fn get_existing_jobs_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection().await?;
        self.load_jobs(&mut conn, ids).await
    }

    async fn filter_active_queues(&self, queues: Vec<Queue>) -> Result<Vec<Queue>, StoreError> {
        if queues.is_empty() {
            return Ok(queues);
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for queue in &queues {
            pipe.zcard(self.queue_jobs_key(&queue.name));
        }
        let sizes: Vec<u64> = pipe.query_async(&mut *conn).await.map_err(backend)?;
        Ok(queues
            .into_iter()
            .zip(sizes)
            .filter(|(_, size)| *size > 0)
            .map(|(queue, _)| queue)
            .collect())
    }

    async fn try_lease_jobs(
        &self,
        cluster_id: &str,
        queue: &str,
        jobs: &[Job],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let script = Script::new(LEASE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.queue_jobs_key(queue))
            .key(self.key("leased"))
            .key(self.key("job:cluster"))
            .arg(cluster_id)
            .arg(now.timestamp_millis());
        for job in jobs {
            invocation.arg(&job.id);
        }
        let won: Vec<String> = invocation.invoke_async(&mut *conn).await.map_err(backend)?;

        debug!(cluster_id, queue, offered = jobs.len(), won = won.len(), "lease claim");
        Ok(jobs
            .iter()
            .filter(|job| won.contains(&job.id))
            .cloned()
            .collect())
    }

    async fn renew_leases(
        &self,
        cluster_id: &str,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let script = Script::new(RENEW_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key("leased"))
            .key(self.key("job:cluster"))
            .arg(cluster_id)
            .arg(now.timestamp_millis());
        for id in ids {
            invocation.arg(id);
        }
        invocation.invoke_async(&mut *conn).await.map_err(backend)
    }

    async fn remove_leased_jobs(
        &self,
        cluster_id: &str,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection().await?;
        let jobs = self.load_jobs(&mut conn, ids).await?;
        if jobs.is_empty() {
            return Ok(jobs);
        }

        let script = Script::new(REMOVE_LEASED_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key("leased"))
            .key(self.key("job:cluster"))
            .arg(cluster_id);
        for job in &jobs {
            invocation
                .key(self.job_key(&job.id))
                .key(self.job_set_key(&job.queue, &job.job_set_id))
                .arg(&job.id);
        }
        let removed: Vec<String> = invocation.invoke_async(&mut *conn).await.map_err(backend)?;

        Ok(jobs
            .into_iter()
            .filter(|job| removed.contains(&job.id))
            .collect())
    }

    async fn return_expired_leases(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, StoreError> {
        let mut conn = self.connection().await?;
        let leased_key = self.key("leased");
        let deadline_ms = deadline.timestamp_millis();
        let ids: Vec<JobId> = conn
            .zrangebyscore(&leased_key, "-inf", deadline_ms)
            .await
            .map_err(backend)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let jobs = self.load_jobs(&mut conn, &ids).await?;
        let orphans: Vec<&JobId> = ids
            .iter()
            .filter(|id| !jobs.iter().any(|job| &job.id == *id))
            .collect();
        if !orphans.is_empty() {
            conn.zrem::<_, _, ()>(&leased_key, orphans)
                .await
                .map_err(backend)?;
        }

        let script = Script::new(RETURN_LEASE_SCRIPT);
        let mut returned = Vec::with_capacity(jobs.len());
        for job in jobs {
            let cluster: Option<String> = script
                .key(&leased_key)
                .key(self.key("job:cluster"))
                .key(self.queue_jobs_key(&job.queue))
                .arg(deadline_ms)
                .arg(&job.id)
                .arg(job.priority)
                .invoke_async(&mut *conn)
                .await
                .map_err(backend)?;
            if let Some(cluster_id) = cluster {
                returned.push(ExpiredLease { job, cluster_id });
            }
        }
        Ok(returned)
    }

    async fn get_active_job_ids(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut conn = self.connection().await?;
        let mut ids: Vec<JobId> = conn
            .smembers(self.job_set_key(queue, job_set_id))
            .await
            .map_err(backend)?;
        ids.sort();
        Ok(ids)
    }

    async fn cancel_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection().await?;
        let jobs = self.load_jobs(&mut conn, ids).await?;

        let script = Script::new(CANCEL_SCRIPT);
        let mut cancelled = Vec::with_capacity(jobs.len());
        for job in jobs {
            let deleted: i64 = script
                .key(self.job_key(&job.id))
                .key(self.queue_jobs_key(&job.queue))
                .key(self.key("leased"))
                .key(self.key("job:cluster"))
                .key(self.job_set_key(&job.queue, &job.job_set_id))
                .arg(&job.id)
                .invoke_async(&mut *conn)
                .await
                .map_err(backend)?;
            if deleted == 1 {
                cancelled.push(job);
            }
        }
        Ok(cancelled)
    }
}

#[async_trait]
impl UsageRepository for ValkeyStore {
    async fn get_cluster_usage_reports(
        &self,
    ) -> Result<HashMap<String, ClusterUsageReport>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn
            .hgetall(self.key("cluster:report"))
            .await
            .map_err(backend)?;
        raw.into_iter()
            .map(|(cluster_id, json)| {
                serde_json::from_str(&json)
                    .map(|report| (cluster_id, report))
                    .map_err(StoreError::from)
            })
            .collect()
    }

    async fn get_cluster_priority(
        &self,
        cluster_id: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let mut conn = self.connection().await?;
        conn.hgetall(self.priority_key(cluster_id))
            .await
            .map_err(backend)
    }

    async fn get_cluster_priorities(
        &self,
        cluster_ids: &[String],
    ) -> Result<HashMap<String, HashMap<String, f64>>, StoreError> {
        if cluster_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for cluster_id in cluster_ids {
            pipe.hgetall(self.priority_key(cluster_id));
        }
        let maps: Vec<HashMap<String, f64>> =
            pipe.query_async(&mut *conn).await.map_err(backend)?;
        Ok(cluster_ids.iter().cloned().zip(maps).collect())
    }

    async fn update_cluster(
        &self,
        report: &ClusterUsageReport,
        priorities: &HashMap<String, f64>,
        previous_report_time: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let expected = previous_report_time
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();

        let script = Script::new(UPDATE_CLUSTER_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key("cluster:report"))
            .key(self.key("cluster:report_time"))
            .key(self.priority_key(&report.cluster_id))
            .arg(&report.cluster_id)
            .arg(expected)
            .arg(report.report_time.timestamp_millis().to_string())
            .arg(serde_json::to_string(report)?);
        for (queue, priority) in priorities {
            invocation.arg(queue).arg(priority.to_string());
        }
        let written: i64 = invocation.invoke_async(&mut *conn).await.map_err(backend)?;
        Ok(written == 1)
    }
}

#[async_trait]
impl SchedulingInfoRepository for ValkeyStore {
    async fn get_cluster_scheduling_info(
        &self,
    ) -> Result<HashMap<String, ClusterSchedulingInfoReport>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn
            .hgetall(self.key("cluster:scheduling"))
            .await
            .map_err(backend)?;
        raw.into_iter()
            .map(|(cluster_id, json)| {
                serde_json::from_str(&json)
                    .map(|report| (cluster_id, report))
                    .map_err(StoreError::from)
            })
            .collect()
    }

    async fn update_cluster_scheduling_info(
        &self,
        report: &ClusterSchedulingInfoReport,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(report)?;
        conn.hset::<_, _, _, ()>(self.key("cluster:scheduling"), &report.cluster_id, json)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl EventRepository for ValkeyStore {
    async fn report_events(&self, events: &[JobEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for event in events {
            pipe.rpush(
                self.events_key(&event.queue, &event.job_set_id),
                serde_json::to_string(event)?,
            )
            .ignore();
        }
        let (): () = pipe.query_async(&mut *conn).await.map_err(backend)?;
        Ok(())
    }

    async fn read_events(
        &self,
        queue: &str,
        job_set_id: &str,
    ) -> Result<Vec<JobEvent>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn
            .lrange(self.events_key(queue, job_set_id), 0, -1)
            .await
            .map_err(backend)?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_commands_map_to_timeout() {
        let timed_out = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read timed out",
        ));
        assert!(matches!(backend(timed_out), StoreError::Timeout));

        let refused = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(backend(refused), StoreError::Backend(_)));
    }
}
