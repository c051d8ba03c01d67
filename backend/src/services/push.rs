use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::constants::COLLABORATOR_TIMEOUT_SECS;
use crate::models::{EngineEvent, UserId};

/// Fallback channel for users with no live connection. Best effort: failures
/// are reported as `false` and never retried.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user: UserId, event: &EngineEvent) -> bool;
}

pub struct HttpPushNotifier {
    client: Client,
    base_url: String,
}

impl HttpPushNotifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(COLLABORATOR_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PushNotifier for HttpPushNotifier {
    async fn notify(&self, user: UserId, event: &EngineEvent) -> bool {
        let result = self
            .client
            .post(format!("{}/notifications", self.base_url))
            .json(&json!({ "user_id": user, "event": event }))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => true,
            Err(e) => {
                debug!(%user, "push notification failed: {}", e);
                false
            }
        }
    }
}

/// Used when no push service is configured.
#[derive(Default)]
pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn notify(&self, user: UserId, event: &EngineEvent) -> bool {
        debug!(%user, kind = event.kind(), "no live connection; push skipped");
        false
    }
}

/// Records every notification. For tests.
#[derive(Default)]
pub struct RecordingPushNotifier {
    sent: Mutex<Vec<(UserId, EngineEvent)>>,
}

impl RecordingPushNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(UserId, EngineEvent)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushNotifier for RecordingPushNotifier {
    async fn notify(&self, user: UserId, event: &EngineEvent) -> bool {
        self.sent.lock().push((user, event.clone()));
        true
    }
}
