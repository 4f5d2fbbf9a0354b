//! Typed queue operations over the Redis key schema.

use super::RedisKeys;
use crate::error::{JobError, JobResult};
use crate::job::{FailedJob, JobDescriptor, QueueStats};
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Redis-backed queue store.
///
/// Every operation is a single atomic Redis command (or a
/// remove-then-push pair where promotion requires it). Components
/// other than the pollers share the pool; a poller passes its own
/// checked-out connection to [`QueueStore::pop`] so its block cannot
/// stall anyone else.
pub struct QueueStore {
    pool: Pool,
}

impl QueueStore {
    /// Create a store over a connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for callers that need a dedicated
    /// connection (the pollers).
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> JobResult<Connection> {
        Ok(self.pool.get().await?)
    }

    /// Push a descriptor at the head of the live queue. Returns the
    /// new list length.
    pub async fn push(&self, queue: &str, job: &JobDescriptor) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.lpush(RedisKeys::queue(queue), job.to_json()?).await?;
        debug!(queue, class = %job.class, len, "pushed job");
        Ok(len)
    }

    /// Push a descriptor at the tail, the end the blocking pop serves
    /// next, so it overtakes everything already queued. Returns the
    /// new list length.
    pub async fn push_priority(&self, queue: &str, job: &JobDescriptor) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.rpush(RedisKeys::queue(queue), job.to_json()?).await?;
        debug!(queue, class = %job.class, len, "pushed priority job");
        Ok(len)
    }

    /// Blocking tail pop with a bounded timeout.
    ///
    /// Returns `None` on timeout. Malformed payloads are logged and
    /// dropped, also yielding `None`.
    pub async fn pop(
        &self,
        conn: &mut Connection,
        queue: &str,
        timeout: Duration,
    ) -> JobResult<Option<JobDescriptor>> {
        let reply: Option<(String, String)> = conn
            .brpop(RedisKeys::queue(queue), timeout.as_secs_f64())
            .await?;

        match reply {
            None => Ok(None),
            Some((_key, raw)) => match JobDescriptor::from_json(&raw) {
                Ok(job) => Ok(Some(job)),
                Err(e) => {
                    error!(queue, error = %e, "dropping malformed job payload");
                    Ok(None)
                }
            },
        }
    }

    /// Park a descriptor in the queue's schedule zset, eligible at
    /// `at` (Unix seconds). A `priority_retry` flag, when wanted, is
    /// set on the descriptor before this call.
    pub async fn schedule(&self, queue: &str, job: &JobDescriptor, at: f64) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .zadd(RedisKeys::schedule(queue), job.to_json()?, at)
            .await?;
        debug!(queue, class = %job.class, at, "scheduled job");
        Ok(())
    }

    /// Move every entry with score <= `now` from the schedule zset to
    /// the live queue. Returns the number promoted.
    ///
    /// Each element is removed before it is pushed; an element whose
    /// removal reports zero was taken by a concurrent promoter and is
    /// skipped. The `priority_retry` flag is stripped and decides
    /// which end receives the descriptor.
    pub async fn promote_due(&self, queue: &str, now: f64) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let key = RedisKeys::schedule(queue);

        let due: Vec<String> = conn.zrangebyscore(&key, "-inf", now).await?;

        let mut promoted = 0u64;
        for member in due {
            let removed: u64 = conn.zrem(&key, &member).await?;
            if removed == 0 {
                continue;
            }

            match JobDescriptor::from_json(&member) {
                Ok(mut job) => {
                    let priority = job.priority_retry.take().unwrap_or(false);
                    if priority {
                        self.push_priority(queue, &job).await?;
                    } else {
                        self.push(queue, &job).await?;
                    }
                    promoted += 1;
                }
                Err(e) => {
                    error!(queue, error = %e, "dropping malformed scheduled entry");
                }
            }
        }

        if promoted > 0 {
            debug!(queue, promoted, "promoted due jobs");
        }

        Ok(promoted)
    }

    /// Members of the schedule zset with their eligibility times.
    pub async fn scheduled_jobs(&self, queue: &str) -> JobResult<Vec<(JobDescriptor, f64)>> {
        let mut conn = self.conn().await?;
        let raw: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(RedisKeys::schedule(queue), "-inf", "+inf")
            .await?;

        let mut jobs = Vec::with_capacity(raw.len());
        for (member, score) in raw {
            match JobDescriptor::from_json(&member) {
                Ok(job) => jobs.push((job, score)),
                Err(e) => warn!(queue, error = %e, "skipping malformed scheduled entry"),
            }
        }
        Ok(jobs)
    }

    /// Point-in-time counters for a queue.
    pub async fn stats(&self, queue: &str) -> JobResult<QueueStats> {
        let mut conn = self.conn().await?;
        let size: u64 = conn.llen(RedisKeys::queue(queue)).await?;
        let scheduled: u64 = conn.zcard(RedisKeys::schedule(queue)).await?;
        let processing: Option<i64> = conn.get(RedisKeys::processing(queue)).await?;

        Ok(QueueStats {
            size,
            scheduled,
            processing: processing.unwrap_or(0).max(0) as u64,
        })
    }

    /// Record a terminal failure on the `failed` list.
    pub async fn store_failed(&self, job: &JobDescriptor, error: &JobError) -> JobResult<()> {
        let record = FailedJob::new(job.clone(), error);
        let mut conn = self.conn().await?;
        let _: () = conn
            .lpush(RedisKeys::failed(), serde_json::to_string(&record)?)
            .await?;
        Ok(())
    }

    /// The full failed list, parsed. Malformed records are skipped.
    pub async fn failed_jobs(&self) -> JobResult<Vec<FailedJob>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(RedisKeys::failed(), 0, -1).await?;

        let mut records = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<FailedJob>(&item) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed failed record"),
            }
        }
        Ok(records)
    }

    /// Remove one occurrence of a failed record. Returns true when a
    /// record was removed.
    pub async fn remove_failed(&self, record: &FailedJob) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn
            .lrem(RedisKeys::failed(), 1, serde_json::to_string(record)?)
            .await?;
        Ok(removed > 0)
    }

    /// Drop the entire failed list.
    pub async fn clear_failed(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(RedisKeys::failed()).await?;
        Ok(())
    }

    /// Bump the in-flight counter for a queue.
    pub(crate) async fn incr_processing(&self, queue: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.incr(RedisKeys::processing(queue), 1i64).await?;
        Ok(())
    }

    /// Drop the in-flight counter for a queue.
    pub(crate) async fn decr_processing(&self, queue: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.decr(RedisKeys::processing(queue), 1i64).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::create_pool;
    use serde_json::json;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_push_pop_round_trip() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let store = QueueStore::new(pool);
        let queue = "spindle-test-push-pop";

        let mut conn = store.pool().get().await.unwrap();
        let _: () = conn.del(RedisKeys::queue(queue)).await.unwrap();

        let job = JobDescriptor::new("Echo", vec![json!(1), json!("hi")]);
        let len = store.push(queue, &job).await.unwrap();
        assert_eq!(len, 1);

        let popped = store
            .pop(&mut conn, queue, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, job);

        let empty = store
            .pop(&mut conn, queue, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_priority_push_wins_next_pop() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let store = QueueStore::new(pool);
        let queue = "spindle-test-priority";

        let mut conn = store.pool().get().await.unwrap();
        let _: () = conn.del(RedisKeys::queue(queue)).await.unwrap();

        let normal = JobDescriptor::new("N", vec![]);
        let urgent = JobDescriptor::new("P", vec![]);
        store.push(queue, &normal).await.unwrap();
        store.push_priority(queue, &urgent).await.unwrap();

        let first = store
            .pop(&mut conn, queue, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.class, "P");
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_promote_due_strips_priority_flag() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let store = QueueStore::new(pool);
        let queue = "spindle-test-promote";

        let mut conn = store.pool().get().await.unwrap();
        let _: () = conn.del(RedisKeys::queue(queue)).await.unwrap();
        let _: () = conn.del(RedisKeys::schedule(queue)).await.unwrap();

        let mut job = JobDescriptor::new("R", vec![]).next_attempt(true);
        assert_eq!(job.priority_retry, Some(true));
        store.schedule(queue, &job, 0.0).await.unwrap();

        let promoted = store.promote_due(queue, crate::job::now_epoch()).await.unwrap();
        assert_eq!(promoted, 1);

        let popped = store
            .pop(&mut conn, queue, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        job.priority_retry = None;
        assert_eq!(popped, job);

        let stats = store.stats(queue).await.unwrap();
        assert_eq!(stats.scheduled, 0);
    }
}
