//! Wire records and execution context.
//!
//! The JSON field names here are the durable external interface: any
//! producer or observer speaking the same protocol reads and writes
//! these exact keys. All times are floating-point seconds since the
//! Unix epoch.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Converts a `DateTime` to floating Unix seconds.
pub fn epoch_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp() as f64 + f64::from(t.timestamp_subsec_micros()) / 1_000_000.0
}

/// Current wall-clock time as floating Unix seconds.
pub fn now_epoch() -> f64 {
    epoch_seconds(Utc::now())
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// The serialized record describing one job, as stored in Redis.
///
/// Immutable once pushed; the retry path produces a new descriptor
/// with `retry_count` incremented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Registered handler name.
    pub class: String,

    /// Positional arguments passed to the handler.
    pub args: Vec<Value>,

    /// Time of first enqueue; preserved across retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,

    /// Number of retries already attempted. Absent on the wire means 0.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,

    /// Present only while the descriptor sits in a schedule zset
    /// waiting to be promoted to the priority end of its queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_retry: Option<bool>,
}

impl JobDescriptor {
    /// Creates a descriptor for a first enqueue, stamped with the
    /// current time.
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            enqueued_at: Some(now_epoch()),
            retry_count: 0,
            priority_retry: None,
        }
    }

    /// Produces the descriptor for the next attempt.
    ///
    /// `enqueued_at` is preserved; `priority_retry` is set only when
    /// the handler asked for priority reinjection.
    pub fn next_attempt(&self, priority_retry: bool) -> Self {
        Self {
            class: self.class.clone(),
            args: self.args.clone(),
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count + 1,
            priority_retry: priority_retry.then_some(true),
        }
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the wire form.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A failed-job record: the original descriptor merged with failure
/// details. Newest records sit at the head of the `failed` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    #[serde(flatten)]
    pub job: JobDescriptor,

    /// When the terminal failure was recorded.
    pub failed_at: f64,

    /// Message of the error that exhausted the retries.
    pub error: String,

    /// Error source chain, at most 10 frames.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

impl FailedJob {
    /// Builds the record for a descriptor that will not be retried.
    pub fn new(job: JobDescriptor, error: &JobError) -> Self {
        Self {
            job,
            failed_at: now_epoch(),
            error: error.to_string(),
            backtrace: error_frames(error),
        }
    }
}

/// Walks the error source chain, keeping at most 10 frames.
fn error_frames(error: &JobError) -> Vec<String> {
    let mut frames = Vec::new();
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(err) = current {
        if frames.len() == 10 {
            break;
        }
        frames.push(err.to_string());
        current = err.source();
    }
    frames
}

/// A persisted cron-job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntry {
    /// Registered handler name.
    pub class: String,

    /// Cron expression, 5 or 6 whitespace-separated fields.
    pub cron: String,

    /// Queue whose worker pool runs the firings.
    pub queue: String,

    /// Registration time.
    pub registered_at: f64,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Length of the live queue list.
    pub size: u64,

    /// Cardinality of the schedule zset.
    pub scheduled: u64,

    /// Handlers currently executing.
    pub processing: u64,
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Handler class name.
    pub class: String,

    /// Queue the descriptor was popped from.
    pub queue: String,

    /// Retries already attempted before this invocation.
    pub retry_count: u32,

    /// Retry budget from the handler metadata.
    pub max_retries: u32,

    /// Original enqueue time, if the producer recorded one.
    pub enqueued_at: Option<f64>,
}

impl JobContext {
    /// True when a failure of this invocation is terminal.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Retries left after this invocation fails.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_round_trip() {
        let desc = JobDescriptor::new("EmailJob", vec![json!(1), json!("hi"), json!(null)]);
        let restored = JobDescriptor::from_json(&desc.to_json().unwrap()).unwrap();
        assert_eq!(desc, restored);
    }

    #[test]
    fn test_retry_count_absent_means_zero() {
        let desc: JobDescriptor =
            serde_json::from_str(r#"{"class":"X","args":[],"enqueued_at":1.5}"#).unwrap();
        assert_eq!(desc.retry_count, 0);
        assert_eq!(desc.priority_retry, None);
    }

    #[test]
    fn test_zero_retry_count_not_serialized() {
        let desc = JobDescriptor::new("X", vec![]);
        let json = desc.to_json().unwrap();
        assert!(!json.contains("retry_count"));
        assert!(!json.contains("priority_retry"));
    }

    #[test]
    fn test_next_attempt_preserves_enqueued_at() {
        let desc = JobDescriptor::new("X", vec![json!(7)]);
        let retry = desc.next_attempt(true);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.enqueued_at, desc.enqueued_at);
        assert_eq!(retry.priority_retry, Some(true));

        let plain = desc.next_attempt(false);
        assert_eq!(plain.priority_retry, None);
    }

    #[test]
    fn test_failed_job_round_trip() {
        let desc = JobDescriptor::new("F", vec![json!("a")]);
        let record = FailedJob::new(desc.clone(), &JobError::ExecutionFailed("boom".into()));
        assert_eq!(record.job, desc);
        assert!(record.error.contains("boom"));
        assert!(!record.backtrace.is_empty());

        let json = serde_json::to_string(&record).unwrap();
        let restored: FailedJob = serde_json::from_str(&json).unwrap();
        assert_eq!(record, restored);
    }

    #[test]
    fn test_context_attempt_accounting() {
        let ctx = JobContext {
            class: "X".into(),
            queue: "default".into(),
            retry_count: 3,
            max_retries: 3,
            enqueued_at: None,
        };
        assert!(ctx.is_last_attempt());
        assert_eq!(ctx.remaining_attempts(), 0);
    }

    #[test]
    fn test_epoch_seconds_resolution() {
        let now = Utc::now();
        let secs = epoch_seconds(now);
        assert!((secs - now.timestamp() as f64) < 1.0);
        assert!(secs > 1_600_000_000.0);
    }
}
