//! # Spindle Worker
//!
//! Operator CLI for the Spindle job processor.
//!
//! Commands:
//! - `spindle worker` — start the dispatcher with the current
//!   configuration and run until SIGINT/SIGTERM.
//! - `spindle version` — print the version.
//!
//! Exit codes: 0 on clean shutdown, 1 on unknown command or startup
//! failure.

use spindle_config::WorkerSettings;
use spindle_jobs::worker::DispatcherConfig;
use spindle_jobs::{create_pool, registry, CronRegistry, Dispatcher, QueueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let code = match args.get(1).map(String::as_str) {
        Some("worker") => run_worker(),
        Some("version") => {
            println!("spindle {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Some(other) => {
            eprintln!("unknown command: {}", other);
            eprintln!("usage: spindle <worker|version>");
            1
        }
        None => {
            eprintln!("usage: spindle <worker|version>");
            1
        }
    };

    std::process::exit(code);
}

fn run_worker() -> i32 {
    let settings = match WorkerSettings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return 1;
        }
    };

    init_logging(&settings);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return 1;
        }
    };

    match runtime.block_on(run(settings)) {
        Ok(()) => 0,
        Err(e) => {
            error!("worker error: {}", e);
            1
        }
    }
}

async fn run(settings: WorkerSettings) -> spindle_jobs::JobResult<()> {
    info!("starting spindle worker...");
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    info!(queues = ?settings.queues, concurrency = settings.concurrency, "configuration loaded");

    spindle_jobs::register_metrics();

    // The pollers each hold a connection during their blocking pop;
    // size the pool past the queue count.
    let pool = create_pool(&settings.redis_url, settings.queues.len() + 8).await?;

    let store = Arc::new(QueueStore::new(pool.clone()));
    let cron = Arc::new(CronRegistry::new(pool));

    let config = DispatcherConfig {
        queues: settings.queues.clone(),
        default_concurrency: settings.concurrency,
        queue_concurrency: settings.queue_concurrency.clone(),
        poll_timeout: Duration::from_secs(1),
        promote_interval: Duration::from_secs(1),
    };

    // Handlers are registered into the process-wide registry by the
    // embedding application's init code.
    let dispatcher = Dispatcher::new(store, cron, registry::global(), config);
    dispatcher.start()?;

    shutdown_signal().await;

    dispatcher.stop().await;
    info!("worker shutdown complete");
    Ok(())
}

fn init_logging(settings: &WorkerSettings) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("received terminate signal, initiating graceful shutdown...");
        }
    }
}
