//! Delivers engine events to users wherever their connections live.
//!
//! Local channels sit in a map owned by this process; the shared registry in
//! the store says which process holds each channel. Events for channels on
//! other processes go through the relay. A user with no live connection gets
//! a best-effort push instead. Events for one user are sent in the order
//! `send` is called.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::CONNECTION_BUFFER;
use crate::db::MatchStore;
use crate::error::MatchResult;
use crate::models::*;
use crate::services::{EventRelay, PushNotifier};

struct LocalChannel {
    user_id: UserId,
    tx: mpsc::Sender<EngineEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    Delivered,
    /// The client is not draining its channel; this event is dropped.
    Backlogged,
    /// The channel is closed or unknown here.
    Gone,
}

pub struct RealtimeDispatcher {
    process_id: ProcessId,
    store: Arc<dyn MatchStore>,
    relay: Arc<dyn EventRelay>,
    push: Arc<dyn PushNotifier>,
    local: DashMap<ChannelId, LocalChannel>,
}

impl RealtimeDispatcher {
    pub fn new(
        process_id: ProcessId,
        store: Arc<dyn MatchStore>,
        relay: Arc<dyn EventRelay>,
        push: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            process_id,
            store,
            relay,
            push,
            local: DashMap::new(),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn local_connections(&self) -> usize {
        self.local.len()
    }

    /// Opens a channel for `user` on this process and records it in the
    /// shared registry.
    pub async fn register_connection(&self, user: UserId) -> MatchResult<(ChannelId, mpsc::Receiver<EngineEvent>)> {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let channel_id = Uuid::new_v4();
        self.local.insert(channel_id, LocalChannel { user_id: user, tx });

        let entry = ConnectionEntry {
            user_id: user,
            process_id: self.process_id,
            channel_id,
            connected_at: Utc::now(),
        };
        if let Err(e) = self.store.register_connection(&entry).await {
            self.local.remove(&channel_id);
            return Err(e);
        }

        info!(%user, %channel_id, "connection registered");
        Ok((channel_id, rx))
    }

    pub async fn unregister_connection(&self, channel_id: ChannelId) -> MatchResult<()> {
        if let Some((_, channel)) = self.local.remove(&channel_id) {
            info!(user = %channel.user_id, %channel_id, "connection closed");
        }
        self.store.unregister_connection(channel_id).await
    }

    /// Sends `event` to every live connection of `user`. Returns how many
    /// connections it was handed to. Never fails: delivery problems are
    /// logged and fall back to push.
    pub async fn send(&self, user: UserId, event: EngineEvent) -> usize {
        let entries = match self.store.connections_for(user).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%user, kind = event.kind(), "registry lookup failed: {}", e);
                Vec::new()
            }
        };

        let mut delivered = 0;
        for entry in entries {
            if entry.process_id == self.process_id {
                match self.deliver_local(entry.channel_id, event.clone()) {
                    LocalOutcome::Delivered => delivered += 1,
                    LocalOutcome::Backlogged => {}
                    LocalOutcome::Gone => self.forget(entry.channel_id).await,
                }
            } else {
                let delivery = Delivery {
                    process_id: entry.process_id,
                    channel_id: entry.channel_id,
                    user_id: user,
                    event: event.clone(),
                };
                match self.relay.publish(delivery).await {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!(%user, process_id = %entry.process_id, "relay publish failed: {}", e),
                }
            }
        }

        if delivered == 0 {
            debug!(%user, kind = event.kind(), "no live connection; falling back to push");
            self.push.notify(user, &event).await;
        }
        delivered
    }

    /// Pushes to a channel held by this process.
    pub fn deliver_local(&self, channel_id: ChannelId, event: EngineEvent) -> LocalOutcome {
        let Some(channel) = self.local.get(&channel_id) else {
            return LocalOutcome::Gone;
        };
        match channel.tx.try_send(event) {
            Ok(()) => LocalOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(user = %channel.user_id, %channel_id, kind = event.kind(), "connection backlogged; event dropped");
                LocalOutcome::Backlogged
            }
            Err(mpsc::error::TrySendError::Closed(_)) => LocalOutcome::Gone,
        }
    }

    /// Entry point for events relayed from other processes.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        if delivery.process_id != self.process_id {
            return;
        }
        if self.deliver_local(delivery.channel_id, delivery.event) == LocalOutcome::Gone {
            self.forget(delivery.channel_id).await;
        }
    }

    async fn forget(&self, channel_id: ChannelId) {
        self.local.remove(&channel_id);
        if let Err(e) = self.store.unregister_connection(channel_id).await {
            warn!(%channel_id, "failed to drop stale registry entry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::{LocalRelay, RecordingPushNotifier};

    fn dispatcher(store: Arc<MemoryStore>, push: Arc<RecordingPushNotifier>) -> RealtimeDispatcher {
        RealtimeDispatcher::new(Uuid::new_v4(), store, Arc::new(LocalRelay::new()), push)
    }

    #[tokio::test]
    async fn test_local_delivery_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        let push = Arc::new(RecordingPushNotifier::new());
        let d = dispatcher(store, push.clone());
        let user = Uuid::new_v4();
        let (_, mut rx) = d.register_connection(user).await.unwrap();

        let first = EngineEvent::MatchEnded { match_id: Uuid::new_v4() };
        let second = EngineEvent::MatchEnded { match_id: Uuid::new_v4() };
        assert_eq!(d.send(user, first.clone()).await, 1);
        assert_eq!(d.send(user, second.clone()).await, 1);

        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(rx.recv().await.unwrap(), second);
        assert!(push.sent().is_empty());
    }

    #[tokio::test]
    async fn test_offline_user_falls_back_to_push() {
        let store = Arc::new(MemoryStore::new());
        let push = Arc::new(RecordingPushNotifier::new());
        let d = dispatcher(store, push.clone());
        let user = Uuid::new_v4();

        let event = EngineEvent::MatchEnded { match_id: Uuid::new_v4() };
        assert_eq!(d.send(user, event.clone()).await, 0);
        assert_eq!(push.sent(), vec![(user, event)]);
    }

    #[tokio::test]
    async fn test_closed_channel_is_pruned_from_registry() {
        let store = Arc::new(MemoryStore::new());
        let push = Arc::new(RecordingPushNotifier::new());
        let d = dispatcher(store.clone(), push.clone());
        let user = Uuid::new_v4();
        let (_, rx) = d.register_connection(user).await.unwrap();
        drop(rx);

        let event = EngineEvent::MatchEnded { match_id: Uuid::new_v4() };
        assert_eq!(d.send(user, event).await, 0);
        assert!(store.connections_for(user).await.unwrap().is_empty());
        assert_eq!(d.local_connections(), 0);
        assert_eq!(push.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_fails_closed_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let d = dispatcher(store, Arc::new(RecordingPushNotifier::new()));
        assert!(d.register_connection(Uuid::new_v4()).await.is_err());
        assert_eq!(d.local_connections(), 0);
    }
}
