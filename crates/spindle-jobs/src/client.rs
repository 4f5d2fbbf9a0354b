//! Producer API.

use crate::error::JobResult;
use crate::handler::JobHandler;
use crate::job::{epoch_seconds, now_epoch, JobDescriptor};
use crate::metrics::JobMetrics;
use crate::redis::QueueStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Producer-side client: writes job descriptors into the store.
///
/// # Example
///
/// ```rust,ignore
/// let client = Client::new(store);
/// client.enqueue::<SendEmail>(vec![json!("user@example.com")]).await?;
/// client.enqueue_in::<SendEmail>(Duration::from_secs(60), vec![]).await?;
/// ```
pub struct Client {
    store: Arc<QueueStore>,
}

impl Client {
    /// Create a client over a queue store.
    pub fn new(store: Arc<QueueStore>) -> Self {
        Self { store }
    }

    /// Enqueue a job for immediate execution. Returns the new length
    /// of the live queue.
    pub async fn enqueue<H: JobHandler>(&self, args: Vec<Value>) -> JobResult<u64> {
        let desc = JobDescriptor::new(H::NAME, args);
        let len = self.store.push(H::QUEUE, &desc).await?;
        JobMetrics::job_enqueued(H::QUEUE, H::NAME);
        Ok(len)
    }

    /// Enqueue a job to become eligible after a delay.
    pub async fn enqueue_in<H: JobHandler>(&self, delay: Duration, args: Vec<Value>) -> JobResult<()> {
        let desc = JobDescriptor::new(H::NAME, args);
        self.store
            .schedule(H::QUEUE, &desc, now_epoch() + delay.as_secs_f64())
            .await?;
        JobMetrics::job_enqueued(H::QUEUE, H::NAME);
        Ok(())
    }

    /// Enqueue a job to become eligible at a point in time.
    pub async fn enqueue_at<H: JobHandler>(
        &self,
        at: DateTime<Utc>,
        args: Vec<Value>,
    ) -> JobResult<()> {
        let desc = JobDescriptor::new(H::NAME, args);
        self.store
            .schedule(H::QUEUE, &desc, epoch_seconds(at))
            .await?;
        JobMetrics::job_enqueued(H::QUEUE, H::NAME);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::job::JobContext;
    use crate::redis::create_pool;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct Ping;

    #[async_trait]
    impl JobHandler for Ping {
        const NAME: &'static str = "Ping";
        const QUEUE: &'static str = "spindle-test-client";

        async fn perform(&self, _ctx: JobContext, _args: Vec<Value>) -> JobResult<()> {
            Ok(())
        }
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_enqueue_writes_descriptor_with_enqueued_at() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let store = Arc::new(QueueStore::new(pool));
        let client = Client::new(store.clone());

        let before = now_epoch();
        let len = client.enqueue::<Ping>(vec![json!(42)]).await.unwrap();
        assert!(len >= 1);

        let mut conn = store.pool().get().await.unwrap();
        let job = store
            .pop(&mut conn, "spindle-test-client", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.class, "Ping");
        assert_eq!(job.args, vec![json!(42)]);
        assert!(job.enqueued_at.unwrap() >= before);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_enqueue_in_parks_in_schedule() {
        let pool = create_pool(&redis_url(), 4).await.unwrap();
        let store = Arc::new(QueueStore::new(pool));
        let client = Client::new(store.clone());

        client
            .enqueue_in::<Ping>(Duration::from_secs(3600), vec![])
            .await
            .unwrap();

        let stats = store.stats("spindle-test-client").await.unwrap();
        assert!(stats.scheduled >= 1);

        // Not yet eligible: nothing to promote.
        let promoted = store
            .promote_due("spindle-test-client", now_epoch())
            .await
            .unwrap();
        assert_eq!(promoted, 0);
    }
}
