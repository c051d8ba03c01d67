use anyhow::Result;
use matchmaker::{
    bootstrap::{build_engine, shutdown_signal},
    engine::spawn_workers,
    utils::{init_logging, Config, StoreBackend},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the background sweeps without serving HTTP. Deploy next to API
/// servers started with `RUN_MATCHING_ROUNDS=false`.
#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("⚙️ Starting matchmaker worker...");

    let mut config = Config::from_env()?;
    if config.store_backend != StoreBackend::Postgres {
        anyhow::bail!("matchmaker_worker needs STORE_BACKEND=postgres; the memory store is process-local");
    }
    config.workers.run_matching_rounds = true;

    let cancel = CancellationToken::new();
    let runtime = build_engine(&config, false, &cancel).await?;
    let mut tasks = runtime.tasks;
    tasks.extend(spawn_workers(runtime.engine, &config.workers, cancel.clone()));
    info!("Worker {} running {} background tasks", config.process_id, tasks.len());

    shutdown_signal().await;
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Worker stopped");
    Ok(())
}
