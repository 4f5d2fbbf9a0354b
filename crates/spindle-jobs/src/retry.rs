//! Retry / failure state machine.

use crate::error::{JobError, JobResult};
use crate::handler::HandlerMetadata;
use crate::job::{now_epoch, JobDescriptor};
use crate::metrics::JobMetrics;
use crate::redis::QueueStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay cap for the default policy.
const MAX_DEFAULT_DELAY_SECS: f64 = 86_400.0;

/// Default retry delay: `2^attempt` seconds plus uniform 0-10s jitter,
/// capped at 24 hours.
pub fn default_retry_delay(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt.min(20) as i32);
    let jitter = rand_jitter(10_000) as f64 / 1_000.0;
    Duration::from_secs_f64((base + jitter).min(MAX_DEFAULT_DELAY_SECS))
}

/// Generate random jitter in `[0, range)` milliseconds using a simple
/// time-seeded LCG.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    // LCG parameters
    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    let random = seed.wrapping_mul(a).wrapping_add(c);
    random % range
}

/// Routes a failed invocation.
///
/// Below the retry budget, a new descriptor with `retry_count + 1` is
/// parked in the queue's schedule zset at `now + retry_delay`; the
/// `priority_retry` flag rides along when the handler asked for
/// priority reinjection. At the budget, or on an error that can never
/// succeed on a retry, the descriptor goes to the `failed` list and
/// is terminal.
pub async fn handle_failure(
    store: &QueueStore,
    meta: &HandlerMetadata,
    desc: &JobDescriptor,
    error: &JobError,
) -> JobResult<()> {
    if desc.retry_count < meta.max_retries && !error.is_permanent() {
        let attempt = desc.retry_count + 1;
        let delay = (meta.retry_delay)(attempt);
        let retry = desc.next_attempt(meta.priority_retry);
        let at = now_epoch() + delay.as_secs_f64();

        store.schedule(&meta.queue, &retry, at).await?;
        JobMetrics::job_retried(&meta.queue, &desc.class, attempt);
        debug!(
            class = %desc.class,
            queue = %meta.queue,
            attempt,
            delay_secs = delay.as_secs_f64(),
            "scheduled job retry"
        );
    } else {
        store.store_failed(desc, error).await?;
        JobMetrics::job_dead(&meta.queue, &desc.class);
        warn!(
            class = %desc.class,
            queue = %meta.queue,
            retry_count = desc.retry_count,
            error = %error,
            "retries exhausted, job moved to failed list"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delay_is_finite_and_non_negative() {
        for attempt in [0, 1, 2, 5, 10, 100, u32::MAX] {
            let delay = default_retry_delay(attempt);
            assert!(delay.as_secs_f64().is_finite());
            assert!(delay.as_secs_f64() >= 0.0);
            assert!(delay.as_secs_f64() <= MAX_DEFAULT_DELAY_SECS);
        }
    }

    #[test]
    fn test_default_delay_grows_with_attempt() {
        // Jitter is at most 10s; the exponential term dominates it by
        // attempt 5 vs attempt 1.
        let early = default_retry_delay(1);
        let late = default_retry_delay(5);
        assert!(late > early);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            assert!(rand_jitter(10_000) < 10_000);
        }
        assert_eq!(rand_jitter(0), 0);
    }
}
