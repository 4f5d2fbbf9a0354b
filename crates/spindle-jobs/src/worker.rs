//! Worker dispatcher.
//!
//! For every configured queue the dispatcher runs one poller (blocking
//! Redis pop on its own pooled connection), a bounded in-memory
//! hand-off channel, and a pool of worker tasks gated by a counting
//! semaphore. The channel bound and the semaphore capacity are the
//! same number: the poller can never run ahead of execution by more
//! than the queue's concurrency. Two promoter tasks move deferred
//! work into the live queues: one for the schedule zsets, one for
//! cron firings.

use crate::cron::CronRegistry;
use crate::error::{JobError, JobResult};
use crate::job::{now_epoch, CronEntry, JobContext, JobDescriptor};
use crate::metrics::JobMetrics;
use crate::redis::QueueStore;
use crate::registry::HandlerRegistry;
use crate::retry;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Pause after an I/O error before a poller retries.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queues to poll.
    pub queues: Vec<String>,

    /// Concurrency for queues without an override.
    pub default_concurrency: usize,

    /// Per-queue concurrency overrides.
    pub queue_concurrency: HashMap<String, usize>,

    /// Bound on each blocking pop.
    pub poll_timeout: Duration,

    /// Cadence of the scheduled and cron promoters.
    pub promote_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            default_concurrency: 5,
            queue_concurrency: HashMap::new(),
            poll_timeout: Duration::from_secs(1),
            promote_interval: Duration::from_secs(1),
        }
    }
}

impl DispatcherConfig {
    /// Concurrency for a queue, applying the override map.
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }
}

/// Shared collaborators of the execution paths.
pub(crate) struct ExecutionEnv {
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) store: Arc<QueueStore>,
    pub(crate) cron: Arc<CronRegistry>,
}

/// The worker dispatcher.
pub struct Dispatcher {
    /// Unique dispatcher ID, for log correlation.
    id: String,

    config: DispatcherConfig,

    env: Arc<ExecutionEnv>,

    /// Running flag; pollers observe it once per iteration.
    running: Arc<AtomicBool>,

    /// Shutdown signal for the promoter loops.
    shutdown_tx: broadcast::Sender<()>,

    /// Spawned task handles, joined on stop.
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Handles of in-flight cron firings, shared with the cron
    /// promoter and joined on stop.
    cron_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// All collaborators are injected; nothing global is consulted.
    /// The CLI composes the process-wide registry here.
    pub fn new(
        store: Arc<QueueStore>,
        cron: Arc<CronRegistry>,
        handlers: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id: format!("dispatcher-{}", Uuid::new_v4()),
            config,
            env: Arc::new(ExecutionEnv {
                handlers,
                store,
                cron,
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            cron_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn pollers, worker pools and promoters. Returns once
    /// everything is running.
    pub fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration(
                "dispatcher already running".to_string(),
            ));
        }

        info!(
            dispatcher_id = %self.id,
            queues = ?self.config.queues,
            "starting dispatcher"
        );

        let mut handles = Vec::new();
        let mut semaphores = HashMap::new();

        for queue in &self.config.queues {
            let concurrency = self.config.concurrency_for(queue);
            let (tx, rx) = mpsc::channel::<JobDescriptor>(concurrency);
            let rx = Arc::new(AsyncMutex::new(rx));
            let semaphore = Arc::new(Semaphore::new(concurrency));
            semaphores.insert(queue.clone(), semaphore.clone());

            handles.push(tokio::spawn(
                poll_queue(
                    queue.clone(),
                    self.env.clone(),
                    tx,
                    self.running.clone(),
                    self.config.poll_timeout,
                )
                .instrument(tracing::info_span!("poller", queue = %queue)),
            ));

            for index in 0..concurrency {
                let worker_id = format!("{}-{}-{}", self.id, queue, index);
                handles.push(tokio::spawn(
                    worker_loop(
                        worker_id,
                        queue.clone(),
                        rx.clone(),
                        semaphore.clone(),
                        concurrency,
                        self.env.clone(),
                    )
                    .instrument(tracing::info_span!("worker", queue = %queue)),
                ));
            }

            debug!(queue = %queue, concurrency, "queue pipeline ready");
        }

        handles.push(tokio::spawn(promote_scheduled(
            self.config.queues.clone(),
            self.env.clone(),
            self.shutdown_tx.subscribe(),
            self.config.promote_interval,
        )));

        handles.push(tokio::spawn(promote_cron(
            semaphores,
            self.env.clone(),
            self.shutdown_tx.subscribe(),
            self.config.promote_interval,
            self.cron_tasks.clone(),
        )));

        self.tasks.lock().extend(handles);
        Ok(())
    }

    /// Stop protocol: clear the running flag, signal the promoters,
    /// and join every task. Pollers exit on their next iteration
    /// (bounded by the pop timeout), workers drain their channel,
    /// in-flight jobs, cron firings included, run to completion.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(dispatcher_id = %self.id, "stopping dispatcher...");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(dispatcher_id = %self.id, error = %e, "dispatcher task panicked");
            }
        }

        // The cron promoter has exited above; no new firings can be
        // spawned past this point.
        let cron_handles: Vec<JoinHandle<()>> = self.cron_tasks.lock().drain(..).collect();
        for result in join_all(cron_handles).await {
            if let Err(e) = result {
                error!(dispatcher_id = %self.id, error = %e, "cron firing panicked");
            }
        }

        info!(dispatcher_id = %self.id, "dispatcher stopped");
    }

    /// Check if the dispatcher is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the dispatcher ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The queue store this dispatcher works against.
    pub fn store(&self) -> Arc<QueueStore> {
        self.env.store.clone()
    }

    /// The cron registry this dispatcher promotes from.
    pub fn cron(&self) -> Arc<CronRegistry> {
        self.env.cron.clone()
    }
}

/// Poller loop: blocking-pop the queue with a bounded timeout and
/// offer descriptors to the hand-off channel. The offer blocks while
/// the channel is full, which is the admission back-pressure towards
/// Redis.
async fn poll_queue(
    queue: String,
    env: Arc<ExecutionEnv>,
    tx: mpsc::Sender<JobDescriptor>,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
) {
    debug!("poller started");

    while running.load(Ordering::Acquire) {
        let mut conn = match env.store.pool().get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "poller could not obtain a Redis connection");
                sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        match env.store.pop(&mut conn, &queue, poll_timeout).await {
            Ok(Some(job)) => {
                if tx.send(job).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "queue poll failed");
                sleep(ERROR_BACKOFF).await;
            }
        }
    }

    debug!("poller stopped");
}

/// Worker loop: receive from the hand-off channel, acquire the
/// queue's semaphore, execute. Exits when the channel is closed and
/// drained. In-flight permits drive the active gauge.
async fn worker_loop(
    worker_id: String,
    queue: String,
    rx: Arc<AsyncMutex<mpsc::Receiver<JobDescriptor>>>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    env: Arc<ExecutionEnv>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        JobMetrics::set_active(&queue, concurrency - semaphore.available_permits());
        execute_job(&env, &queue, job).await;
        drop(permit);
        JobMetrics::set_active(&queue, concurrency - semaphore.available_permits());
    }

    debug!(worker_id = %worker_id, "worker stopped");
}

/// Scheduled-job promoter: once per tick, move every due entry of
/// every queue's schedule zset into its live queue.
async fn promote_scheduled(
    queues: Vec<String>,
    env: Arc<ExecutionEnv>,
    mut shutdown_rx: broadcast::Receiver<()>,
    every: Duration,
) {
    let mut tick = interval(every);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tick.tick() => {
                for queue in &queues {
                    match env.store.promote_due(queue, now_epoch()).await {
                        Ok(promoted) if promoted > 0 => JobMetrics::jobs_promoted(queue, promoted),
                        Ok(_) => {}
                        Err(e) => warn!(queue = %queue, error = %e, "scheduled promotion failed"),
                    }
                }
            }
        }
    }

    debug!("scheduled promoter stopped");
}

/// Cron promoter: once per tick, take the due cron entries and submit
/// each through its queue's semaphore, so cron work counts against
/// the same concurrency budget as ordinary work. Every firing's
/// handle lands in `spawned` so the stop protocol can wait for it.
async fn promote_cron(
    semaphores: HashMap<String, Arc<Semaphore>>,
    env: Arc<ExecutionEnv>,
    mut shutdown_rx: broadcast::Receiver<()>,
    every: Duration,
    spawned: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut tick = interval(every);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tick.tick() => {
                spawned.lock().retain(|handle| !handle.is_finished());

                let due = match env.cron.due_jobs(now_epoch()).await {
                    Ok(due) => due,
                    Err(e) => {
                        warn!(error = %e, "cron poll failed");
                        continue;
                    }
                };

                for entry in due {
                    let Some(semaphore) = semaphores.get(&entry.queue).cloned() else {
                        warn!(
                            class = %entry.class,
                            queue = %entry.queue,
                            "cron entry targets an unpolled queue"
                        );
                        continue;
                    };

                    let env = env.clone();
                    let handle = tokio::spawn(async move {
                        let Ok(permit) = semaphore.acquire_owned().await else {
                            return;
                        };
                        execute_cron(&env, entry).await;
                        drop(permit);
                    });
                    spawned.lock().push(handle);
                }
            }
        }
    }

    debug!("cron promoter stopped");
}

/// Execute one descriptor: resolve the handler, enforce the per-job
/// timeout, and route failures to the retry state machine. Handler
/// errors never propagate to the caller.
pub(crate) async fn execute_job(env: &ExecutionEnv, queue: &str, desc: JobDescriptor) {
    let Some((handler, meta)) = env.handlers.resolve(&desc.class) else {
        warn!(class = %desc.class, queue, "no handler registered for job");
        let err = JobError::UnknownClass(desc.class.clone());
        if let Err(e) = env.store.store_failed(&desc, &err).await {
            error!(class = %desc.class, error = %e, "failed to record unknown-class job");
        }
        return;
    };

    let ctx = JobContext {
        class: desc.class.clone(),
        queue: meta.queue.clone(),
        retry_count: desc.retry_count,
        max_retries: meta.max_retries,
        enqueued_at: desc.enqueued_at,
    };

    let mut args = desc.args.clone();
    if let Some(enqueued_at) = desc.enqueued_at {
        args.push(Value::from(enqueued_at));
    }

    if let Err(e) = env.store.incr_processing(&meta.queue).await {
        warn!(queue = %meta.queue, error = %e, "failed to bump processing counter");
    }

    let outcome = match timeout(meta.timeout, handler.perform(ctx, args)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(JobError::Timeout(meta.timeout.as_secs_f64())),
    };

    if let Err(e) = env.store.decr_processing(&meta.queue).await {
        warn!(queue = %meta.queue, error = %e, "failed to drop processing counter");
    }

    match outcome {
        Ok(()) => {
            JobMetrics::job_completed(&meta.queue, &desc.class);
            debug!(class = %desc.class, queue = %meta.queue, "job completed");
        }
        Err(err) => {
            JobMetrics::job_failed(&meta.queue, &desc.class);
            warn!(
                class = %desc.class,
                queue = %meta.queue,
                retry_count = desc.retry_count,
                error = %err,
                "job failed"
            );
            if let Err(e) = retry::handle_failure(&env.store, &meta, &desc, &err).await {
                error!(class = %desc.class, error = %e, "failed to route job failure");
            }
        }
    }
}

/// Execute one cron firing and schedule the next occurrence. Cron
/// failures do not enter the retry machine; the next fire is the
/// retry.
pub(crate) async fn execute_cron(env: &ExecutionEnv, entry: CronEntry) {
    JobMetrics::cron_fired(&entry.queue, &entry.class);

    match env.handlers.resolve(&entry.class) {
        Some((handler, meta)) => {
            let outcome = match timeout(meta.timeout, handler.perform_cron()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(JobError::Timeout(meta.timeout.as_secs_f64())),
            };

            match outcome {
                Ok(()) => debug!(class = %entry.class, "cron job completed"),
                Err(e) => warn!(
                    class = %entry.class,
                    error = %e,
                    "cron job failed; the next fire is the retry"
                ),
            }
        }
        None => warn!(class = %entry.class, "no handler registered for cron class"),
    }

    // A shutdown before this line leaves the next-run marker stale;
    // the next registration sees the key and does not re-schedule.
    if let Err(e) = env.cron.reschedule(&entry, Utc::now()).await {
        error!(class = %entry.class, error = %e, "failed to schedule next cron occurrence");
    }
}
