//! Redis-backed queue store.

mod store;

pub use store::QueueStore;

use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool.
///
/// The pool must be sized for the pollers: each blocking pop occupies
/// one connection for up to its timeout, so `max_size` should exceed
/// the number of polled queues.
pub async fn create_pool(url: &str, max_size: usize) -> JobResult<Pool> {
    info!("creating Redis connection pool...");

    let cfg = Config::from_url(url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("invalid Redis config: {}", e)))?
        .max_size(max_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder.
///
/// The key names are the durable external interface and carry no
/// prefix; producers and observers in other processes address the
/// same keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisKeys;

impl RedisKeys {
    /// Live FIFO queue list for a queue.
    pub fn queue(queue: &str) -> String {
        format!("queue:{}", queue)
    }

    /// Schedule zset for a queue; score is the eligibility time.
    pub fn schedule(queue: &str) -> String {
        format!("schedule:{}", queue)
    }

    /// Failed-job list, newest at head.
    pub fn failed() -> &'static str {
        "failed"
    }

    /// Hash of cron entries keyed by class name.
    pub fn cron_jobs() -> &'static str {
        "cron:jobs"
    }

    /// Zset of class names scored by next-run time.
    pub fn cron_schedule() -> &'static str {
        "cron:schedule"
    }

    /// Next-run marker for one cron class; its presence means the
    /// class is already scheduled.
    pub fn cron_next_run(class: &str) -> String {
        format!("cron:next_run:{}", class)
    }

    /// In-flight handler counter for a queue.
    pub fn processing(queue: &str) -> String {
        format!("processing:{}", queue)
    }
}
