//! Spindle Jobs - Redis-backed background job processing
//!
//! A single-process job processor with:
//! - Durable per-queue FIFO queues in Redis
//! - Per-queue pollers feeding bounded in-memory hand-off channels
//! - Bounded worker pools with semaphore admission control
//! - Per-job timeouts, retries with backoff, and a failed-job list
//! - Delayed (scheduled) execution with a one-second promoter
//! - Recurring (cron) execution with persisted definitions
//!
//! # Architecture
//!
//! ```text
//! producer ──► queue:<q> (list) ◄── schedule:<q> (zset) ◄── retries,
//!                  │                       ▲                 delayed
//!                  │ BRPOP                 │ promoter (1s)   enqueues
//!                  ▼                       │
//!              poller (one per queue, own connection)
//!                  │ bounded channel, capacity C[q]
//!                  ▼
//!              worker pool (C[q] tasks + semaphore C[q])
//!                  │
//!         ┌────────┴────────┐
//!         ▼                 ▼
//!      completed        retry machine ──► schedule:<q> or failed
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle_jobs::{Client, Dispatcher, DispatcherConfig, JobContext, JobHandler, JobResult};
//! use serde_json::Value;
//!
//! #[derive(Default)]
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendEmail {
//!     const NAME: &'static str = "SendEmail";
//!     const QUEUE: &'static str = "mailers";
//!
//!     async fn perform(&self, _ctx: JobContext, args: Vec<Value>) -> JobResult<()> {
//!         // deliver the email
//!         Ok(())
//!     }
//! }
//!
//! spindle_jobs::registry::global().register_default::<SendEmail>();
//! ```

pub mod client;
pub mod cron;
pub mod error;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod redis;
pub mod registry;
pub mod retry;
pub mod worker;

pub use client::Client;
pub use cron::{next_run, CronExpression, CronRegistry};
pub use error::{JobError, JobResult};
pub use handler::{HandlerMetadata, JobHandler};
pub use job::{CronEntry, FailedJob, JobContext, JobDescriptor, QueueStats};
pub use metrics::{register_metrics, JobMetrics};
pub use redis::{create_pool, QueueStore, RedisKeys};
pub use registry::HandlerRegistry;
pub use retry::default_retry_delay;
pub use worker::{Dispatcher, DispatcherConfig};

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::handler::JobHandler;
    pub use crate::job::{JobContext, JobDescriptor};
    pub use crate::worker::{Dispatcher, DispatcherConfig};
    pub use crate::{JobError, JobResult};
}
