//! Metrics for job processing.
//!
//! Uses the `metrics` facade; the core installs no recorder. An
//! embedding process that wants exported metrics installs one before
//! starting the dispatcher.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric names.
pub mod names {
    /// Total jobs enqueued by producers.
    pub const JOBS_ENQUEUED_TOTAL: &str = "spindle_jobs_enqueued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "spindle_jobs_completed_total";
    /// Total handler failures (including timeouts).
    pub const JOBS_FAILED_TOTAL: &str = "spindle_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "spindle_jobs_retried_total";
    /// Total jobs moved to the failed list.
    pub const JOBS_DEAD_TOTAL: &str = "spindle_jobs_dead_total";
    /// Total scheduled jobs promoted to live queues.
    pub const JOBS_PROMOTED_TOTAL: &str = "spindle_jobs_promoted_total";
    /// Total cron firings dispatched.
    pub const CRON_FIRED_TOTAL: &str = "spindle_cron_fired_total";
    /// Handlers currently executing per queue.
    pub const JOBS_ACTIVE: &str = "spindle_jobs_active";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total jobs enqueued by producers");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total jobs completed successfully");
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total handler failures, including timeouts"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total retries scheduled");
    describe_counter!(names::JOBS_DEAD_TOTAL, "Total jobs moved to the failed list");
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total scheduled jobs promoted to live queues"
    );
    describe_counter!(names::CRON_FIRED_TOTAL, "Total cron firings dispatched");
    describe_gauge!(names::JOBS_ACTIVE, "Handlers currently executing per queue");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a producer enqueue.
    pub fn job_enqueued(queue: &str, class: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record a successful completion.
    pub fn job_completed(queue: &str, class: &str) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record a handler failure.
    pub fn job_failed(queue: &str, class: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record a scheduled retry.
    pub fn job_retried(queue: &str, class: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a terminal failure.
    pub fn job_dead(queue: &str, class: &str) {
        counter!(
            names::JOBS_DEAD_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Record promoted scheduled jobs.
    pub fn jobs_promoted(queue: &str, count: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL, "queue" => queue.to_string()).increment(count);
    }

    /// Record a cron firing.
    pub fn cron_fired(queue: &str, class: &str) {
        counter!(
            names::CRON_FIRED_TOTAL,
            "queue" => queue.to_string(),
            "class" => class.to_string()
        )
        .increment(1);
    }

    /// Update the in-flight gauge for a queue.
    pub fn set_active(queue: &str, active: usize) {
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(active as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // Registration must not panic without an installed recorder.
        register_metrics();
    }

    #[test]
    fn test_recorders_are_no_ops_without_recorder() {
        JobMetrics::job_enqueued("default", "Echo");
        JobMetrics::job_completed("default", "Echo");
        JobMetrics::job_failed("default", "Echo");
        JobMetrics::job_retried("default", "Echo", 1);
        JobMetrics::set_active("default", 2);
    }
}
