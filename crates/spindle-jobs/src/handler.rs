//! Handler trait and static metadata.

use crate::error::{JobError, JobResult};
use crate::job::JobContext;
use crate::retry::default_retry_delay;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Trait for defining job handlers.
///
/// A handler supplies its static metadata through associated consts
/// and implements one of the two entry points: `perform` for ordinary
/// jobs, `perform_cron` for recurring jobs. A fresh instance is
/// created for every invocation.
///
/// # Example
///
/// ```rust,ignore
/// use spindle_jobs::{JobContext, JobHandler, JobResult};
/// use serde_json::Value;
///
/// #[derive(Default)]
/// struct SendEmail;
///
/// #[async_trait::async_trait]
/// impl JobHandler for SendEmail {
///     const NAME: &'static str = "SendEmail";
///     const QUEUE: &'static str = "mailers";
///     const MAX_RETRIES: u32 = 5;
///
///     async fn perform(&self, _ctx: JobContext, args: Vec<Value>) -> JobResult<()> {
///         println!("sending to {:?}", args[0]);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Unique class name this handler registers under.
    const NAME: &'static str;

    /// Queue this handler's jobs are routed to.
    const QUEUE: &'static str = "default";

    /// Retry budget after the initial attempt.
    const MAX_RETRIES: u32 = 3;

    /// Per-invocation timeout in seconds.
    const TIMEOUT_SECS: f64 = 300.0;

    /// When true, retried jobs are reinjected at the end the blocking
    /// pop serves next, overtaking queued work.
    const PRIORITY_RETRY: bool = false;

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Must be a pure function returning a finite duration. The
    /// default is exponential with uniform 0-10s jitter.
    fn retry_delay(attempt: u32) -> Duration {
        default_retry_delay(attempt)
    }

    /// Entry point for ordinary jobs.
    ///
    /// `args` holds the descriptor's positional arguments; when the
    /// descriptor carries `enqueued_at` it is appended as the
    /// trailing argument.
    async fn perform(&self, _ctx: JobContext, _args: Vec<Value>) -> JobResult<()> {
        Err(JobError::ExecutionFailed(format!(
            "{} does not implement perform",
            Self::NAME
        )))
    }

    /// Entry point for cron jobs. Takes no job arguments.
    async fn perform_cron(&self) -> JobResult<()> {
        Err(JobError::ExecutionFailed(format!(
            "{} does not implement perform_cron",
            Self::NAME
        )))
    }
}

/// Static per-class metadata captured at registration time.
#[derive(Clone)]
pub struct HandlerMetadata {
    /// Queue name.
    pub queue: String,

    /// Retry budget.
    pub max_retries: u32,

    /// Per-invocation timeout.
    pub timeout: Duration,

    /// Whether retries are reinjected with priority.
    pub priority_retry: bool,

    /// Retry delay function.
    pub retry_delay: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl HandlerMetadata {
    /// Captures the metadata of a handler type.
    pub fn of<H: JobHandler>() -> Self {
        Self {
            queue: H::QUEUE.to_string(),
            max_retries: H::MAX_RETRIES,
            timeout: Duration::from_secs_f64(H::TIMEOUT_SECS.max(0.0)),
            priority_retry: H::PRIORITY_RETRY,
            retry_delay: Arc::new(H::retry_delay),
        }
    }
}

impl fmt::Debug for HandlerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMetadata")
            .field("queue", &self.queue)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("priority_retry", &self.priority_retry)
            .finish()
    }
}

/// Object-safe view of a handler, used by the dispatcher.
#[async_trait]
pub trait AnyHandler: Send + Sync {
    async fn perform(&self, ctx: JobContext, args: Vec<Value>) -> JobResult<()>;

    async fn perform_cron(&self) -> JobResult<()>;
}

#[async_trait]
impl<H: JobHandler> AnyHandler for H {
    async fn perform(&self, ctx: JobContext, args: Vec<Value>) -> JobResult<()> {
        JobHandler::perform(self, ctx, args).await
    }

    async fn perform_cron(&self) -> JobResult<()> {
        JobHandler::perform_cron(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Plain;

    #[async_trait]
    impl JobHandler for Plain {
        const NAME: &'static str = "Plain";
        const QUEUE: &'static str = "bulk";
        const MAX_RETRIES: u32 = 1;
        const TIMEOUT_SECS: f64 = 2.5;
        const PRIORITY_RETRY: bool = true;

        async fn perform(&self, _ctx: JobContext, _args: Vec<Value>) -> JobResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_metadata_capture() {
        let meta = HandlerMetadata::of::<Plain>();
        assert_eq!(meta.queue, "bulk");
        assert_eq!(meta.max_retries, 1);
        assert_eq!(meta.timeout, Duration::from_secs_f64(2.5));
        assert!(meta.priority_retry);
        assert!((meta.retry_delay)(1) >= Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unimplemented_cron_entry_point_errors() {
        let handler = Plain;
        let err = AnyHandler::perform_cron(&handler).await.unwrap_err();
        assert!(err.to_string().contains("perform_cron"));
    }
}
