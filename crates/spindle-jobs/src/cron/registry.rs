//! Redis-persisted cron registry.
//!
//! Definitions live in the `cron:jobs` hash; `cron:schedule` holds one
//! zset entry per class scored by next-run time; the
//! `cron:next_run:<class>` string marks a class as already scheduled
//! so registration does not reset an existing schedule.

use super::expression::{next_run, CronExpression};
use crate::error::JobResult;
use crate::handler::JobHandler;
use crate::job::{epoch_seconds, now_epoch, CronEntry};
use crate::redis::RedisKeys;
use chrono::Utc;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Registry of recurring jobs.
pub struct CronRegistry {
    pool: Pool,
}

impl CronRegistry {
    /// Create a registry over a connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> JobResult<Connection> {
        Ok(self.pool.get().await?)
    }

    /// Register a handler type as a cron job.
    ///
    /// The expression is validated first; an invalid expression fails
    /// loudly and nothing is written. Idempotent per class: the entry
    /// is overwritten, but an existing schedule is left untouched.
    pub async fn register<H: JobHandler>(&self, cron_expr: &str) -> JobResult<()> {
        self.register_entry(CronEntry {
            class: H::NAME.to_string(),
            cron: cron_expr.to_string(),
            queue: H::QUEUE.to_string(),
            registered_at: now_epoch(),
        })
        .await
    }

    /// Register a pre-built entry. See [`CronRegistry::register`].
    pub async fn register_entry(&self, entry: CronEntry) -> JobResult<()> {
        let expression = CronExpression::parse(&entry.cron)?;

        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(
                RedisKeys::cron_jobs(),
                &entry.class,
                serde_json::to_string(&entry)?,
            )
            .await?;

        let already_scheduled: bool = conn.exists(RedisKeys::cron_next_run(&entry.class)).await?;
        if !already_scheduled {
            let next = expression.next_run(Utc::now())?;
            self.schedule_job(&entry.class, epoch_seconds(next)).await?;
        }

        info!(class = %entry.class, cron = %entry.cron, queue = %entry.queue, "registered cron job");
        Ok(())
    }

    /// Record the next firing time for a class.
    pub async fn schedule_job(&self, class: &str, at: f64) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(RedisKeys::cron_next_run(class), at).await?;
        let _: () = conn.zadd(RedisKeys::cron_schedule(), class, at).await?;
        debug!(class, at, "scheduled cron firing");
        Ok(())
    }

    /// Entries whose next-run time has passed. Each returned class is
    /// removed from the schedule zset; the caller re-schedules after
    /// execution.
    pub async fn due_jobs(&self, now: f64) -> JobResult<Vec<CronEntry>> {
        let mut conn = self.conn().await?;
        let due: Vec<String> = conn
            .zrangebyscore(RedisKeys::cron_schedule(), "-inf", now)
            .await?;

        let mut entries = Vec::with_capacity(due.len());
        for class in due {
            let removed: u64 = conn.zrem(RedisKeys::cron_schedule(), &class).await?;
            if removed == 0 {
                continue;
            }

            let raw: Option<String> = conn.hget(RedisKeys::cron_jobs(), &class).await?;
            match raw {
                Some(json) => match serde_json::from_str::<CronEntry>(&json) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(class = %class, error = %e, "skipping malformed cron entry"),
                },
                None => warn!(class = %class, "scheduled cron class has no definition"),
            }
        }

        Ok(entries)
    }

    /// All registered entries.
    pub async fn entries(&self) -> JobResult<Vec<CronEntry>> {
        let mut conn = self.conn().await?;
        let raw: std::collections::HashMap<String, String> =
            conn.hgetall(RedisKeys::cron_jobs()).await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (class, json) in raw {
            match serde_json::from_str::<CronEntry>(&json) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(class = %class, error = %e, "skipping malformed cron entry"),
            }
        }
        Ok(entries)
    }

    /// The recorded next-run time for a class, if scheduled.
    pub async fn next_run_at(&self, class: &str) -> JobResult<Option<f64>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(RedisKeys::cron_next_run(class)).await?)
    }

    /// Delete every cron definition, the schedule, and all next-run
    /// markers.
    pub async fn clear_all(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(RedisKeys::cron_jobs()).await?;
        let _: () = conn.del(RedisKeys::cron_schedule()).await?;

        let markers: Vec<String> = conn.keys("cron:next_run:*").await?;
        if !markers.is_empty() {
            let _: () = conn.del(markers).await?;
        }
        Ok(())
    }

    /// Compute and persist the firing after `from` for an entry.
    pub(crate) async fn reschedule(&self, entry: &CronEntry, from: chrono::DateTime<Utc>) -> JobResult<()> {
        let next = next_run(&entry.cron, from)?;
        self.schedule_job(&entry.class, epoch_seconds(next)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use crate::redis::create_pool;
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Default)]
    struct Sweep;

    #[async_trait]
    impl JobHandler for Sweep {
        const NAME: &'static str = "Sweep";
        const QUEUE: &'static str = "maintenance";

        async fn perform(&self, _ctx: JobContext, _args: Vec<Value>) -> JobResult<()> {
            Ok(())
        }
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_registration_is_idempotent() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let registry = CronRegistry::new(pool);
        registry.clear_all().await.unwrap();

        registry.register::<Sweep>("*/5 * * * *").await.unwrap();
        let first = registry.next_run_at("Sweep").await.unwrap().unwrap();

        registry.register::<Sweep>("*/5 * * * *").await.unwrap();
        let second = registry.next_run_at("Sweep").await.unwrap().unwrap();
        assert_eq!(first, second);

        registry.clear_all().await.unwrap();
        assert!(registry.next_run_at("Sweep").await.unwrap().is_none());
        assert!(registry.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_invalid_expression_writes_nothing() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let registry = CronRegistry::new(pool);
        registry.clear_all().await.unwrap();

        assert!(registry.register::<Sweep>("not a cron").await.is_err());
        assert!(registry.entries().await.unwrap().is_empty());
        assert!(registry.next_run_at("Sweep").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_due_jobs_removes_entries() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let registry = CronRegistry::new(pool);
        registry.clear_all().await.unwrap();

        registry.register::<Sweep>("* * * * *").await.unwrap();
        // Force the schedule into the past.
        registry.schedule_job("Sweep", 1.0).await.unwrap();

        let due = registry.due_jobs(now_epoch()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].class, "Sweep");
        assert_eq!(due[0].queue, "maintenance");

        // Removed from the schedule until re-scheduled.
        assert!(registry.due_jobs(now_epoch()).await.unwrap().is_empty());

        registry.clear_all().await.unwrap();
    }
}
