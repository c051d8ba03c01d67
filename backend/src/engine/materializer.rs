//! Turns a mutually accepted proposal into a durable match and a chat.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::dispatcher::RealtimeDispatcher;
use super::metrics::MetricsCollector;
use super::reveal::partner_identity;
use crate::db::MatchStore;
use crate::error::MatchResult;
use crate::models::*;
use crate::services::{AnalyticsEvent, AnalyticsSink, ChatService};
use crate::utils::backoff::{retry_with_backoff, RetryPolicy};

pub struct MatchMaterializer {
    store: Arc<dyn MatchStore>,
    chat: Arc<dyn ChatService>,
    dispatcher: Arc<RealtimeDispatcher>,
    metrics: Arc<MetricsCollector>,
    analytics: Arc<dyn AnalyticsSink>,
    chat_retry: RetryPolicy,
}

impl MatchMaterializer {
    pub fn new(
        store: Arc<dyn MatchStore>,
        chat: Arc<dyn ChatService>,
        dispatcher: Arc<RealtimeDispatcher>,
        metrics: Arc<MetricsCollector>,
        analytics: Arc<dyn AnalyticsSink>,
        chat_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            chat,
            dispatcher,
            metrics,
            analytics,
            chat_retry,
        }
    }

    /// Confirms `proposal` from the status it was read in. The store removes
    /// both searchers, writes the match and, for blind dates, its reveal
    /// state in one unit. `None` means another caller got there first.
    ///
    /// Chat creation happens after the match is durable. If the chat service
    /// stays down the match is returned without a chat id and the retry job
    /// finishes it later.
    pub async fn materialize(&self, proposal: &Proposal, now: DateTime<Utc>) -> MatchResult<Option<Match>> {
        let record = Match::from_proposal(proposal, now);
        let Some(mut record) = self
            .store
            .confirm_match(proposal.id, proposal.status, &record, now)
            .await?
        else {
            return Ok(None);
        };

        info!(
            match_id = %record.id,
            proposal_id = %proposal.id,
            match_type = %record.match_type,
            "match confirmed"
        );
        self.metrics.match_created();
        self.analytics.emit(AnalyticsEvent::MatchConfirmed {
            match_id: record.id,
            match_type: record.match_type,
            score: record.compatibility_score,
        });

        for user in proposal.participants() {
            self.dispatcher
                .send(
                    user,
                    EngineEvent::ProposalResolved {
                        proposal_id: proposal.id,
                        status: ProposalStatus::Confirmed,
                    },
                )
                .await;
        }

        match self.ensure_chat(&record).await {
            Ok(chat_id) => record.chat_id = Some(chat_id),
            Err(e) => warn!(match_id = %record.id, "chat creation pending retry: {}", e),
        }

        self.announce(&record).await;
        Ok(Some(record))
    }

    async fn ensure_chat(&self, record: &Match) -> MatchResult<ChatId> {
        let (a, b) = (record.user_a, record.user_b);
        let chat_id = retry_with_backoff(&self.chat_retry, "create-or-get-chat", || {
            self.chat.create_or_get_chat(a, b)
        })
        .await?;
        let stored = self.store.set_chat_id(record.id, &chat_id).await?;
        Ok(stored.unwrap_or(chat_id))
    }

    async fn announce(&self, record: &Match) {
        let masked = record.identity_masked();
        let profiles = match self.store.load_profiles(&[record.user_a, record.user_b]).await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(match_id = %record.id, "profiles unavailable for confirmation: {}", e);
                Default::default()
            }
        };
        let profile = |user: UserId| {
            profiles
                .get(&user)
                .cloned()
                .unwrap_or_else(|| Profile::new(user, "", ""))
        };
        let (pa, pb) = (profile(record.user_a), profile(record.user_b));

        for (viewer, partner) in [(&pa, &pb), (&pb, &pa)] {
            self.dispatcher
                .send(
                    viewer.user_id,
                    EngineEvent::MatchConfirmed {
                        match_id: record.id,
                        match_type: record.match_type,
                        chat_id: record.chat_id.clone(),
                        partner: partner_identity(viewer, partner, masked),
                    },
                )
                .await;
        }
    }

    /// Finishes matches whose chat creation failed earlier. Returns how many
    /// got a chat this round.
    pub async fn retry_pending_chats(&self, limit: usize) -> MatchResult<usize> {
        let pending = self.store.matches_pending_chat(limit).await?;
        let mut completed = 0;
        for record in pending {
            match self.ensure_chat(&record).await {
                Ok(chat_id) => {
                    info!(match_id = %record.id, %chat_id, "chat created on retry");
                    completed += 1;
                    for user in [record.user_a, record.user_b] {
                        self.dispatcher
                            .send(
                                user,
                                EngineEvent::ChatReady {
                                    match_id: record.id,
                                    chat_id: chat_id.clone(),
                                },
                            )
                            .await;
                    }
                }
                Err(e) => warn!(match_id = %record.id, "chat still unavailable: {}", e),
            }
        }
        Ok(completed)
    }
}
