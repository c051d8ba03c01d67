//! Periodic background jobs: proposal expiry, matching rounds, chat retries,
//! time-based blind-date reveals, process heartbeats, dead-connection
//! cleanup and metrics refresh.
//!
//! Every job is safe to run on several processes at once; the store's
//! check-and-set operations decide which process wins each row.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::MatchEngine;
use crate::constants::*;
use crate::error::MatchResult;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub expiry_interval: Duration,
    pub matching_interval: Duration,
    pub chat_retry_interval: Duration,
    pub reveal_interval: Duration,
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
    /// The API server sets this to false when a dedicated worker process
    /// runs the matching rounds.
    pub run_matching_rounds: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(EXPIRY_SWEEP_INTERVAL_SECS),
            matching_interval: Duration::from_secs(MATCHING_INTERVAL_SECS),
            chat_retry_interval: Duration::from_secs(CHAT_RETRY_INTERVAL_SECS),
            reveal_interval: Duration::from_secs(REVEAL_TICK_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            metrics_interval: Duration::from_secs(METRICS_REFRESH_INTERVAL_SECS),
            run_matching_rounds: true,
        }
    }
}

/// Runs `tick` every `every` until `cancel` fires. A slow tick delays the
/// next one instead of bunching them up.
fn spawn_periodic<F, Fut>(name: &'static str, every: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = MatchResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🔁 {} worker started (every {:?})", name, every);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = tick().await {
                        error!("❌ {} iteration failed: {}", name, e);
                    }
                }
            }
        }
        info!("{} worker stopped", name);
    })
}

pub fn spawn_workers(engine: Arc<MatchEngine>, config: &WorkerConfig, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let e = engine.clone();
    handles.push(spawn_periodic("expiry-sweep", config.expiry_interval, cancel.clone(), move || {
        let e = e.clone();
        async move {
            let expired = e.sweep_expired(Utc::now()).await?;
            if expired > 0 {
                info!("⏰ Expired {} proposals", expired);
            }
            Ok(())
        }
    }));

    if config.run_matching_rounds {
        let e = engine.clone();
        handles.push(spawn_periodic("matching-round", config.matching_interval, cancel.clone(), move || {
            let e = e.clone();
            async move {
                let created = e.run_matching_round().await?;
                if created > 0 {
                    info!("🎯 Matching round created {} proposals", created);
                }
                Ok(())
            }
        }));
    }

    let e = engine.clone();
    handles.push(spawn_periodic("chat-retry", config.chat_retry_interval, cancel.clone(), move || {
        let e = e.clone();
        async move {
            let completed = e.retry_pending_chats().await?;
            if completed > 0 {
                info!("💬 Completed {} pending chats", completed);
            }
            Ok(())
        }
    }));

    let e = engine.clone();
    handles.push(spawn_periodic("reveal-tick", config.reveal_interval, cancel.clone(), move || {
        let e = e.clone();
        async move {
            let revealed = e.reveal_due(Utc::now()).await?;
            if revealed > 0 {
                info!("🎭 Revealed {} blind dates", revealed);
            }
            Ok(())
        }
    }));

    let e = engine.clone();
    handles.push(spawn_periodic("heartbeat", config.heartbeat_interval, cancel.clone(), move || {
        let e = e.clone();
        async move {
            let now = Utc::now();
            e.heartbeat(now).await?;
            e.sweep_disconnected(now).await?;
            Ok(())
        }
    }));

    let e = engine;
    handles.push(spawn_periodic("metrics-refresh", config.metrics_interval, cancel, move || {
        let e = e.clone();
        async move {
            let snapshot = e.refresh_metrics().await?;
            debug!(?snapshot, "metrics refreshed");
            Ok(())
        }
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_job_stops_on_cancel() {
        let ticks = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = ticks.clone();
        let handle = spawn_periodic("test", Duration::from_secs(1), cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        handle.await.unwrap();
        // Immediate first tick plus three more
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_iteration_keeps_job_alive() {
        let ticks = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = ticks.clone();
        let handle = spawn_periodic("flaky", Duration::from_secs(1), cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::MatchError::StoreUnavailable("down".into()))
            }
        });

        time::sleep(Duration::from_millis(2_500)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
