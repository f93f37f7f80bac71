//! weft-server: the combined API + worker process.
//!
//! Bootstraps the environment, assembles the container, loads agents,
//! spawns the worker pool, and serves HTTP until SIGINT. Workers finish
//! their in-flight job before the process exits.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use serve::Container;
use weft::settings::Settings;
use weft::worker::{WorkerPool, DEFAULT_CONSUMERS};

#[derive(Parser, Debug)]
#[command(name = "weft-server", about = "weft agent orchestration service")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8000")]
    addr: String,

    /// Number of queue consumers to run in-process. 0 disables the pool
    /// (API-only deployment).
    #[arg(long, default_value_t = DEFAULT_CONSUMERS)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    config::bootstrap_env(None)?;
    let settings = Settings::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let container = Container::build(settings).await?;
    let loaded = container.load_agents()?;
    tracing::info!(agents = loaded, "startup complete");

    let (running_tx, running_rx) = tokio::sync::watch::channel(true);
    let mut worker_handles = if args.workers > 0 {
        let pool = WorkerPool::new(
            container.queue.clone(),
            container.registry.clone(),
            container.agent_service.clone(),
            container.metrics.clone(),
            container.retry.clone(),
        );
        pool.spawn(args.workers, running_rx.clone())
    } else {
        Vec::new()
    };

    // Retry scheduler: periodically re-enqueues jobs whose backoff elapsed.
    if args.workers > 0 {
        if let Some(retry) = container.retry.clone() {
            let queue = container.queue.clone();
            let mut running = running_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                while *running.borrow() {
                    match retry.drain_due(&queue, 10).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(requeued = n, "retried due jobs"),
                        Err(e) => tracing::error!(error = %e, "retry drain failed"),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
                        _ = running.changed() => {}
                    }
                }
            }));
        }
    }

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    serve::run_serve(Some(&args.addr), Arc::clone(&container), shutdown).await?;

    // Let consumers finish their current job.
    let _ = running_tx.send(false);
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("shut down cleanly");
    Ok(())
}
