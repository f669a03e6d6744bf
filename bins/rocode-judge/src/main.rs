mod backend;
mod context;
mod prelude;
mod runner;
mod similarity;
mod store;
mod worker;

use rocode_common::config::JudgeConfig;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use context::JudgeContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("RoCode judge booting...");

    let config = JudgeConfig::from_env();
    info!(
        workers = config.worker_count,
        sandbox_dir = %config.sandbox_dir.display(),
        use_docker = config.use_docker,
        "Configuration loaded"
    );

    let ctx = JudgeContext::connect(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    for worker_id in 0..ctx.config.worker_count {
        workers.spawn(worker::worker_loop(
            worker_id,
            ctx.clone(),
            shutdown_rx.clone(),
        ));
    }

    signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    warn!("Received shutdown signal, draining workers...");

    // Workers finish their in-flight job, then exit on the next poll.
    let _ = shutdown_tx.send(true);
    while workers.join_next().await.is_some() {}

    info!("Judge shutdown complete");
    Ok(())
}
