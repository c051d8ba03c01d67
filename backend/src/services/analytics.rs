use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::COLLABORATOR_TIMEOUT_SECS;
use crate::models::{MatchId, MatchType, ProposalId, ProposalStatus, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    SearchStarted {
        user_id: UserId,
        match_type: MatchType,
    },
    ProposalOutcome {
        proposal_id: ProposalId,
        match_type: MatchType,
        status: ProposalStatus,
        score: u8,
    },
    MatchConfirmed {
        match_id: MatchId,
        match_type: MatchType,
        score: u8,
    },
}

/// Fire-and-forget: `emit` never blocks the engine and never fails it.
pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

pub struct HttpAnalyticsSink {
    client: Client,
    url: String,
}

impl HttpAnalyticsSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(COLLABORATOR_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

impl AnalyticsSink for HttpAnalyticsSink {
    fn emit(&self, event: AnalyticsEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        // Dropped silently when called outside a runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.post(&url).json(&event).send().await {
                    debug!("analytics event dropped: {}", e);
                }
            });
        }
    }
}

#[derive(Default)]
pub struct LogAnalyticsSink;

impl AnalyticsSink for LogAnalyticsSink {
    fn emit(&self, event: AnalyticsEvent) {
        info!(target: "analytics", ?event);
    }
}

/// Keeps events in memory. For tests.
#[derive(Default)]
pub struct MemoryAnalyticsSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl MemoryAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }
}

impl AnalyticsSink for MemoryAnalyticsSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().push(event);
    }
}
