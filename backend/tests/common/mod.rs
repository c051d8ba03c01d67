#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use matchmaker::db::MemoryStore;
use matchmaker::engine::{Collaborators, EngineConfig, MatchEngine};
use matchmaker::models::*;
use matchmaker::services::relay::spawn_local_consumer;
use matchmaker::services::{InMemoryChatService, LocalRelay, MemoryAnalyticsSink, RecordingPushNotifier};
use matchmaker::utils::backoff::RetryPolicy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const BERLIN: GeoPoint = GeoPoint { lat: 52.5200, lon: 13.4050 };
/// About 2 km north of `BERLIN`.
pub const NEAR_BERLIN: GeoPoint = GeoPoint { lat: 52.5380, lon: 13.4050 };

/// Everything a test needs to drive and observe one or more engines that
/// share a store.
pub struct Harness {
    pub engine: Arc<MatchEngine>,
    pub store: Arc<MemoryStore>,
    pub chat: Arc<InMemoryChatService>,
    pub push: Arc<RecordingPushNotifier>,
    pub analytics: Arc<MemoryAnalyticsSink>,
    pub relay: Arc<LocalRelay>,
    pub cancel: CancellationToken,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        chat_retry: RetryPolicy::immediate(2),
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(InMemoryChatService::new());
        let push = Arc::new(RecordingPushNotifier::new());
        let analytics = Arc::new(MemoryAnalyticsSink::new());
        let relay = Arc::new(LocalRelay::new());
        let cancel = CancellationToken::new();

        let harness = Self {
            engine: Arc::new(MatchEngine::new(
                config,
                Uuid::new_v4(),
                store.clone(),
                Collaborators {
                    chat: chat.clone(),
                    push: push.clone(),
                    analytics: analytics.clone(),
                    relay: relay.clone(),
                },
            )),
            store,
            chat,
            push,
            analytics,
            relay,
            cancel,
        };
        let engine = harness.engine.clone();
        harness.attach(&engine);
        harness
    }

    /// Another process sharing this harness's store, relay and collaborators.
    pub fn spawn_process(&self) -> Arc<MatchEngine> {
        let engine = Arc::new(MatchEngine::new(
            test_config(),
            Uuid::new_v4(),
            self.store.clone(),
            Collaborators {
                chat: self.chat.clone(),
                push: self.push.clone(),
                analytics: self.analytics.clone(),
                relay: self.relay.clone(),
            },
        ));
        self.attach(&engine);
        engine
    }

    fn attach(&self, engine: &Arc<MatchEngine>) {
        let inbox = self.relay.attach(engine.dispatcher().process_id());
        spawn_local_consumer(inbox, engine.dispatcher().clone(), self.cancel.clone());
    }

    /// Seeds a profile and returns its id.
    pub fn user(&self, first: &str, last: &str, interests: &[&str]) -> UserId {
        let id = Uuid::new_v4();
        self.store
            .upsert_profile(Profile::new(id, first, last).with_age(30).with_interests(interests.iter().copied()));
        id
    }

    pub async fn search(&self, user: UserId, match_type: MatchType, location: Option<GeoPoint>) -> SearchingUser {
        self.engine
            .start_search(user, match_type, SearchCriteria::default().with_radius(5.0), location)
            .await
            .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Next event that is not a nearby alert, or panics after a second.
pub async fn next_event(rx: &mut mpsc::Receiver<EngineEvent>) -> EngineEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("connection closed");
        if !matches!(event, EngineEvent::NearbyUserAlert { .. }) {
            return event;
        }
    }
}

pub fn drain(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
