use matchmaker::{
    bootstrap::{build_engine, shutdown_signal},
    engine::{metrics::install_prometheus, spawn_workers},
    handlers::{create_router, AppState},
    utils, Config,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::init_logging();

    let config = Config::from_env()?;
    let metrics_handle = install_prometheus()?;
    let cancel = CancellationToken::new();

    // Migrations run on startup, like the standalone migrate binary
    let runtime = build_engine(&config, true, &cancel).await?;
    let engine = runtime.engine;
    let mut tasks = runtime.tasks;
    tasks.extend(spawn_workers(engine.clone(), &config.workers, cancel.clone()));

    let app = create_router(
        AppState {
            engine,
            metrics_handle: Some(metrics_handle),
        },
        &config.allowed_origins,
    );

    let listener = tokio::net::TcpListener::bind(&format!("0.0.0.0:{}", config.port)).await?;
    info!("🚀 Server running on port {} (process {})", config.port, config.process_id);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Server stopped");
    Ok(())
}
