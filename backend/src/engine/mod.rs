//! The matching engine and the facade the handlers and workers drive.

pub mod coordinator;
pub mod dispatcher;
pub mod materializer;
pub mod metrics;
pub mod queue;
pub mod reveal;
pub mod scorer;
pub mod workers;

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::db::MatchStore;
use crate::error::{MatchError, MatchResult};
use crate::models::*;
use crate::services::{AnalyticsEvent, AnalyticsSink, ChatService, EventRelay, PushNotifier};
use crate::utils::backoff::RetryPolicy;

pub use coordinator::{ProposalCoordinator, RespondOutcome};
pub use dispatcher::{LocalOutcome, RealtimeDispatcher};
pub use materializer::MatchMaterializer;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use queue::{NearbySearcher, QueueConfig, RankedCandidate, SearchQueue};
pub use reveal::{MatchView, RevealPolicy, RevealRule, RevealStateMachine};
pub use scorer::{CompatibilityScorer, ScoreSubject, ScoringWeights};
pub use workers::{spawn_workers, WorkerConfig};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub proposal_timeout: Duration,
    pub min_score: u8,
    pub max_candidates: usize,
    pub grid_cell_degrees: f64,
    pub max_radius_km: f64,
    pub inactive_days: i64,
    pub reveal_rule: RevealRule,
    pub chat_retry: RetryPolicy,
    /// How long a searcher without any live connection stays in the pool.
    pub disconnected_grace: Duration,
    pub stale_process_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proposal_timeout: Duration::seconds(DEFAULT_PROPOSAL_TIMEOUT_SECS),
            min_score: DEFAULT_MIN_COMPATIBILITY_SCORE,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            grid_cell_degrees: DEFAULT_GRID_CELL_DEGREES,
            max_radius_km: MAX_SEARCH_RADIUS_KM,
            inactive_days: DEFAULT_INACTIVE_DAYS,
            reveal_rule: RevealRule::default(),
            chat_retry: RetryPolicy::default(),
            disconnected_grace: Duration::seconds(DISCONNECTED_GRACE_SECS),
            stale_process_after: Duration::seconds(STALE_PROCESS_SECS),
        }
    }
}

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub chat: Arc<dyn ChatService>,
    pub push: Arc<dyn PushNotifier>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub relay: Arc<dyn EventRelay>,
}

pub struct MatchEngine {
    config: EngineConfig,
    store: Arc<dyn MatchStore>,
    queue: SearchQueue,
    coordinator: ProposalCoordinator,
    materializer: Arc<MatchMaterializer>,
    reveal: RevealStateMachine,
    dispatcher: Arc<RealtimeDispatcher>,
    metrics: Arc<MetricsCollector>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl MatchEngine {
    pub fn new(
        config: EngineConfig,
        process_id: ProcessId,
        store: Arc<dyn MatchStore>,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            chat,
            push,
            analytics,
            relay,
        } = collaborators;

        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = Arc::new(RealtimeDispatcher::new(process_id, store.clone(), relay, push));
        let queue = SearchQueue::new(
            store.clone(),
            CompatibilityScorer::default(),
            QueueConfig {
                min_score: config.min_score,
                max_candidates: config.max_candidates,
                grid_cell_degrees: config.grid_cell_degrees,
                max_radius_km: config.max_radius_km,
                inactive_days: config.inactive_days,
            },
        );
        let materializer = Arc::new(MatchMaterializer::new(
            store.clone(),
            chat,
            dispatcher.clone(),
            metrics.clone(),
            analytics.clone(),
            config.chat_retry,
        ));
        let coordinator = ProposalCoordinator::new(
            store.clone(),
            dispatcher.clone(),
            materializer.clone(),
            metrics.clone(),
            analytics.clone(),
            config.proposal_timeout,
        );
        let reveal = RevealStateMachine::new(
            store.clone(),
            dispatcher.clone(),
            Arc::new(config.reveal_rule.clone()),
        );

        Self {
            config,
            store,
            queue,
            coordinator,
            materializer,
            reveal,
            dispatcher,
            metrics,
            analytics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MatchStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<RealtimeDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn queue(&self) -> &SearchQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &ProposalCoordinator {
        &self.coordinator
    }

    pub fn reveal(&self) -> &RevealStateMachine {
        &self.reveal
    }

    // Inbound operations

    /// Enqueues the user and sends nearby alerts. The caller schedules the
    /// matching pass (see `schedule_matching_pass`).
    pub async fn start_search(
        &self,
        user: UserId,
        match_type: MatchType,
        criteria: SearchCriteria,
        location: Option<GeoPoint>,
    ) -> MatchResult<SearchingUser> {
        let entry = self
            .queue
            .enqueue(user, match_type, criteria, location, Utc::now())
            .await?;
        self.metrics.search_started();
        self.analytics.emit(AnalyticsEvent::SearchStarted {
            user_id: user,
            match_type,
        });

        if let Err(e) = self.alert_nearby(&entry).await {
            warn!(%user, "nearby alerts skipped: {}", e);
        }
        Ok(entry)
    }

    pub async fn cancel_search(&self, user: UserId) -> MatchResult<CancelOutcome> {
        self.queue.remove(user).await
    }

    pub async fn respond_proposal(
        &self,
        user: UserId,
        proposal_id: ProposalId,
        decision: Decision,
    ) -> MatchResult<RespondOutcome> {
        self.coordinator
            .respond(proposal_id, user, decision, Utc::now())
            .await
    }

    pub async fn request_reveal(&self, user: UserId, match_id: MatchId) -> MatchResult<MatchStatus> {
        self.reveal.request_reveal(match_id, user, Utc::now()).await
    }

    pub async fn end_match(&self, user: UserId, match_id: MatchId) -> MatchResult<()> {
        self.reveal.end(match_id, user, Utc::now()).await
    }

    /// A chat message was exchanged in the match.
    pub async fn record_message(&self, match_id: MatchId) -> MatchResult<MatchStatus> {
        self.reveal.record_message(match_id, Utc::now()).await
    }

    pub async fn match_view(&self, user: UserId, match_id: MatchId) -> MatchResult<MatchView> {
        self.reveal.view(match_id, user, Utc::now()).await
    }

    // Matching

    /// Proposes the best available partner to `user`. Candidates claimed by
    /// someone else in the meantime are skipped; the pass stops as soon as
    /// `user` is no longer free.
    pub async fn run_matching_pass(&self, user: UserId) -> MatchResult<Option<Proposal>> {
        let now = Utc::now();
        let candidates = match self
            .queue
            .find_candidates(user, self.config.max_candidates, now)
            .await
        {
            Ok(candidates) => candidates,
            Err(MatchError::NotSearching) => return Ok(None),
            Err(e) => return Err(e),
        };

        for candidate in candidates {
            match self
                .coordinator
                .propose(user, candidate.user_id, candidate.score, now)
                .await
            {
                Ok(proposal) => return Ok(Some(proposal)),
                Err(MatchError::AlreadyProposed) | Err(MatchError::NotSearching) => {
                    let still_free = self
                        .store
                        .searching_user(user)
                        .await?
                        .is_some_and(|s| s.status == SearchStatus::Searching && !s.cancel_requested);
                    if !still_free {
                        return Ok(None);
                    }
                    debug!(%user, candidate = %candidate.user_id, "candidate taken; trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Spawns a matching pass for `user` without waiting for it.
    pub fn schedule_matching_pass(self: &Arc<Self>, user: UserId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run_matching_pass(user).await {
                warn!(%user, "matching pass failed: {}", e);
            }
        });
    }

    /// One pass for each free searcher, longest waiting first. Returns how
    /// many proposals were created.
    pub async fn run_matching_round(&self) -> MatchResult<usize> {
        let searchers = self.store.oldest_searching(MATCHING_ROUND_BATCH).await?;
        let mut created = 0;
        for searcher in searchers {
            if self.run_matching_pass(searcher.user_id).await?.is_some() {
                created += 1;
            }
        }
        Ok(created)
    }

    // Background maintenance

    /// Expires due proposals and immediately re-matches the released users.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> MatchResult<usize> {
        let resolutions = self.coordinator.sweep_expired(now).await?;
        for resolution in &resolutions {
            for user in &resolution.requeued {
                if let Err(e) = self.run_matching_pass(*user).await {
                    warn!(%user, "re-match after expiry failed: {}", e);
                }
            }
        }
        Ok(resolutions.len())
    }

    /// Reveals blind dates whose time-based reveal condition came due.
    pub async fn reveal_due(&self, now: DateTime<Utc>) -> MatchResult<usize> {
        self.reveal.reveal_due(now).await
    }

    pub async fn retry_pending_chats(&self) -> MatchResult<usize> {
        self.materializer.retry_pending_chats(CHAT_RETRY_BATCH).await
    }

    /// Drops searchers that have held no live connection for the grace
    /// period.
    pub async fn sweep_disconnected(&self, now: DateTime<Utc>) -> MatchResult<usize> {
        let removed = self
            .store
            .remove_disconnected(now - self.config.disconnected_grace)
            .await?;
        if !removed.is_empty() {
            info!(count = removed.len(), "removed disconnected searchers");
        }
        Ok(removed.len())
    }

    /// Heartbeats this process and purges processes that stopped.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> MatchResult<u64> {
        self.store.heartbeat(self.dispatcher.process_id(), now).await?;
        let purged = self
            .store
            .purge_stale_processes(now - self.config.stale_process_after)
            .await?;
        if purged > 0 {
            info!(purged, "purged stale processes from the registry");
        }
        Ok(purged)
    }

    pub async fn refresh_metrics(&self) -> MatchResult<MetricsSnapshot> {
        self.metrics.refresh(self.store.as_ref()).await
    }

    async fn alert_nearby(&self, entry: &SearchingUser) -> MatchResult<()> {
        for nearby in self.queue.nearby_searchers(entry).await? {
            for user in [entry.user_id, nearby.user_id] {
                self.dispatcher
                    .send(
                        user,
                        EngineEvent::NearbyUserAlert {
                            match_type: entry.match_type,
                            distance_km: (nearby.distance_km * 10.0).round() / 10.0,
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }
}
