//! Cross-process event delivery.
//!
//! The registry says which process holds a user's channel; the relay carries
//! the event there. Postgres deployments use LISTEN/NOTIFY, single-node and
//! test setups use an in-process hub.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::RELAY_CHANNEL;
use crate::engine::dispatcher::RealtimeDispatcher;
use crate::error::MatchResult;
use crate::models::{Delivery, ProcessId};

#[async_trait]
pub trait EventRelay: Send + Sync {
    /// Hands `delivery` to the process named in it.
    async fn publish(&self, delivery: Delivery) -> MatchResult<()>;
}

/// In-process hub: every attached process gets its own inbox.
#[derive(Default)]
pub struct LocalRelay {
    inboxes: DashMap<ProcessId, mpsc::UnboundedSender<Delivery>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, process_id: ProcessId) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(process_id, tx);
        rx
    }

    pub fn detach(&self, process_id: ProcessId) {
        self.inboxes.remove(&process_id);
    }
}

#[async_trait]
impl EventRelay for LocalRelay {
    async fn publish(&self, delivery: Delivery) -> MatchResult<()> {
        let sender = self.inboxes.get(&delivery.process_id).map(|s| s.clone());
        match sender {
            Some(tx) => {
                if tx.send(delivery).is_err() {
                    debug!("relay inbox closed; dropping delivery");
                }
            }
            None => debug!(process_id = %delivery.process_id, "no such process attached; dropping delivery"),
        }
        Ok(())
    }
}

/// Feeds an inbox from `LocalRelay::attach` into `dispatcher`.
pub fn spawn_local_consumer(
    mut inbox: mpsc::UnboundedReceiver<Delivery>,
    dispatcher: Arc<RealtimeDispatcher>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = inbox.recv() => match delivery {
                    Some(delivery) => dispatcher.handle_delivery(delivery).await,
                    None => break,
                },
            }
        }
    })
}

/// `pg_notify` on a shared channel; every process listens and keeps what is
/// addressed to it.
pub struct PgRelay {
    pool: PgPool,
}

impl PgRelay {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRelay for PgRelay {
    async fn publish(&self, delivery: Delivery) -> MatchResult<()> {
        let payload = serde_json::to_string(&delivery)
            .map_err(|e| crate::error::MatchError::Validation(e.to_string()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(RELAY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// LISTEN loop for this process. Reconnects are handled by `PgListener`;
/// malformed payloads are logged and skipped.
pub async fn run_pg_listener(
    pool: PgPool,
    dispatcher: Arc<RealtimeDispatcher>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(RELAY_CHANNEL).await?;
    info!("📡 Listening for relayed events on '{}'", RELAY_CHANNEL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Relay listener stopping");
                return Ok(());
            }
            notification = listener.recv() => {
                let notification = match notification {
                    Ok(n) => n,
                    Err(e) => {
                        error!("❌ Relay listener error: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<Delivery>(notification.payload()) {
                    Ok(delivery) if delivery.process_id == dispatcher.process_id() => {
                        dispatcher.handle_delivery(delivery).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping malformed relay payload: {}", e),
                }
            }
        }
    }
}
