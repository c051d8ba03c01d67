//! Wires a `MatchEngine` from `Config`: store backend, relay and
//! collaborator clients.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::{get_db_pool, run_migrations, MatchStore, MemoryStore, PgMatchStore};
use crate::engine::{Collaborators, MatchEngine};
use crate::services::*;
use crate::utils::{Config, StoreBackend};

/// A wired engine plus the background tasks feeding it.
pub struct EngineRuntime {
    pub engine: Arc<MatchEngine>,
    /// `None` for the memory backend.
    pub pool: Option<PgPool>,
    pub tasks: Vec<JoinHandle<()>>,
}

fn collaborators(config: &Config, relay: Arc<dyn EventRelay>) -> Collaborators {
    let chat: Arc<dyn ChatService> = match &config.chat_service_url {
        Some(url) => Arc::new(HttpChatService::new(url.clone())),
        None => {
            warn!("CHAT_SERVICE_URL not set; using in-process chat ids");
            Arc::new(InMemoryChatService::new())
        }
    };
    let push: Arc<dyn PushNotifier> = match &config.push_service_url {
        Some(url) => Arc::new(HttpPushNotifier::new(url.clone())),
        None => Arc::new(LogPushNotifier),
    };
    let analytics: Arc<dyn AnalyticsSink> = match &config.analytics_url {
        Some(url) => Arc::new(HttpAnalyticsSink::new(url.clone())),
        None => Arc::new(LogAnalyticsSink),
    };
    Collaborators {
        chat,
        push,
        analytics,
        relay,
    }
}

/// Builds the engine and starts its relay consumer. With `migrate` set the
/// Postgres schema is brought up to date first.
pub async fn build_engine(config: &Config, migrate: bool, cancel: &CancellationToken) -> Result<EngineRuntime> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("⚠️ Using the in-memory store; state is local to this process");
            let store: Arc<dyn MatchStore> = Arc::new(MemoryStore::new());
            let relay = Arc::new(LocalRelay::new());
            let inbox = relay.attach(config.process_id);
            let engine = Arc::new(MatchEngine::new(
                config.engine.clone(),
                config.process_id,
                store,
                collaborators(config, relay),
            ));
            let consumer = spawn_local_consumer(inbox, engine.dispatcher().clone(), cancel.clone());
            Ok(EngineRuntime {
                engine,
                pool: None,
                tasks: vec![consumer],
            })
        }
        StoreBackend::Postgres => {
            let db_config = config
                .database
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
            let pool = get_db_pool(db_config).await?;
            if migrate {
                run_migrations(&pool).await?;
            }

            let store: Arc<dyn MatchStore> = Arc::new(PgMatchStore::new(pool.clone()));
            let relay = Arc::new(PgRelay::new(pool.clone()));
            let engine = Arc::new(MatchEngine::new(
                config.engine.clone(),
                config.process_id,
                store,
                collaborators(config, relay),
            ));

            let listener_pool = pool.clone();
            let dispatcher = engine.dispatcher().clone();
            let listener_cancel = cancel.clone();
            let listener = tokio::spawn(async move {
                if let Err(e) = run_pg_listener(listener_pool, dispatcher, listener_cancel).await {
                    error!("❌ Relay listener exited: {}", e);
                }
            });

            info!(process_id = %config.process_id, "engine connected to Postgres");
            Ok(EngineRuntime {
                engine,
                pool: Some(pool),
                tasks: vec![listener],
            })
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
