//! Proposal lifecycle: claim, offer, respond, resolve.
//!
//! Every status change is a check-and-set in the store. A response that
//! loses a race re-reads the proposal and re-decides, so the losing side
//! either observes the winner's terminal state or applies its own transition
//! on top of it.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatcher::RealtimeDispatcher;
use super::materializer::MatchMaterializer;
use super::metrics::MetricsCollector;
use super::reveal::partner_identity;
use crate::constants::MAX_RESPOND_ATTEMPTS;
use crate::db::{MatchStore, Resolution};
use crate::error::{MatchError, MatchResult};
use crate::models::*;
use crate::services::{AnalyticsEvent, AnalyticsSink};

/// What a response did, plus the users it put back into the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct RespondOutcome {
    pub status: ProposalStatus,
    pub requeued: Vec<UserId>,
}

pub struct ProposalCoordinator {
    store: Arc<dyn MatchStore>,
    dispatcher: Arc<RealtimeDispatcher>,
    materializer: Arc<MatchMaterializer>,
    metrics: Arc<MetricsCollector>,
    analytics: Arc<dyn AnalyticsSink>,
    timeout: Duration,
}

impl ProposalCoordinator {
    pub fn new(
        store: Arc<dyn MatchStore>,
        dispatcher: Arc<RealtimeDispatcher>,
        materializer: Arc<MatchMaterializer>,
        metrics: Arc<MetricsCollector>,
        analytics: Arc<dyn AnalyticsSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            materializer,
            metrics,
            analytics,
            timeout,
        }
    }

    /// Claims both users and offers them the proposal. Fails with
    /// `AlreadyProposed` if either one is already claimed.
    pub async fn propose(&self, a: UserId, b: UserId, score: u8, now: DateTime<Utc>) -> MatchResult<Proposal> {
        let searcher = self
            .store
            .searching_user(a)
            .await?
            .ok_or(MatchError::NotSearching)?;
        let proposal = Proposal::new(a, b, searcher.match_type, score, now, self.timeout)?;
        self.store.claim_pair(&proposal).await?;
        info!(
            proposal_id = %proposal.id,
            user_a = %a,
            user_b = %b,
            score,
            "proposal created"
        );

        self.offer(&proposal).await;
        Ok(proposal)
    }

    async fn offer(&self, proposal: &Proposal) {
        let masked = proposal.match_type == MatchType::BlindDate;
        let profiles = match self.store.load_profiles(&proposal.participants()).await {
            Ok(profiles) => profiles,
            Err(e) => {
                // The proposal stands; clients can still respond by id
                warn!(proposal_id = %proposal.id, "profiles unavailable for offer: {}", e);
                Default::default()
            }
        };
        let profile = |user: UserId| {
            profiles
                .get(&user)
                .cloned()
                .unwrap_or_else(|| Profile::new(user, "", ""))
        };
        let (pa, pb) = (profile(proposal.user_a), profile(proposal.user_b));

        for (viewer, partner) in [(&pa, &pb), (&pb, &pa)] {
            self.dispatcher
                .send(
                    viewer.user_id,
                    EngineEvent::ProposalOffered {
                        proposal_id: proposal.id,
                        match_type: proposal.match_type,
                        score: proposal.score,
                        expires_at: proposal.expires_at,
                        partner: partner_identity(viewer, partner, masked),
                    },
                )
                .await;
        }
    }

    /// Applies `user`'s decision. Mutual acceptance materializes the match
    /// before returning.
    pub async fn respond(
        &self,
        proposal_id: ProposalId,
        user: UserId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> MatchResult<RespondOutcome> {
        for attempt in 1..=MAX_RESPOND_ATTEMPTS {
            let proposal = self
                .store
                .proposal(proposal_id)
                .await?
                .ok_or(MatchError::NotFound("proposal"))?;
            let next = proposal.next_status(user, decision, now)?;

            if next == ProposalStatus::Confirmed {
                if self.materializer.materialize(&proposal, now).await?.is_some() {
                    self.record_outcome(&proposal, ProposalStatus::Confirmed);
                    return Ok(RespondOutcome {
                        status: ProposalStatus::Confirmed,
                        requeued: Vec::new(),
                    });
                }
            } else if let Some(resolution) = self
                .store
                .transition_proposal(proposal_id, proposal.status, next, now)
                .await?
            {
                info!(%proposal_id, %user, ?decision, status = %next, "proposal response applied");
                let requeued = if next.releases_users() {
                    self.announce_resolution(&resolution).await;
                    resolution.requeued
                } else {
                    Vec::new()
                };
                return Ok(RespondOutcome { status: next, requeued });
            }

            debug!(%proposal_id, attempt, "proposal changed underneath response; retrying");
        }

        Err(MatchError::invalid_state("proposal kept changing; try again"))
    }

    /// Expires every due proposal. Runs safely on several processes at once.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> MatchResult<Vec<Resolution>> {
        let resolutions = self.store.expire_due(now).await?;
        for resolution in &resolutions {
            info!(proposal_id = %resolution.proposal.id, "proposal expired");
            self.announce_resolution(resolution).await;
        }
        Ok(resolutions)
    }

    async fn announce_resolution(&self, resolution: &Resolution) {
        let proposal = &resolution.proposal;
        self.record_outcome(proposal, proposal.status);
        for user in proposal.participants() {
            self.dispatcher
                .send(
                    user,
                    EngineEvent::ProposalResolved {
                        proposal_id: proposal.id,
                        status: proposal.status,
                    },
                )
                .await;
        }
        if !resolution.dropped.is_empty() {
            debug!(proposal_id = %proposal.id, dropped = ?resolution.dropped, "deferred cancels applied");
        }
    }

    fn record_outcome(&self, proposal: &Proposal, status: ProposalStatus) {
        self.metrics.proposal_resolved(status.as_str());
        self.analytics.emit(AnalyticsEvent::ProposalOutcome {
            proposal_id: proposal.id,
            match_type: proposal.match_type,
            status,
            score: proposal.score,
        });
    }
}
