//! The process-independent store behind every engine component.
//!
//! Each mutating method is one atomic unit (a Postgres transaction or a
//! single critical section in memory). Callers never read-then-write across
//! two calls to make a decision that must hold for other processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::error::MatchResult;
use crate::models::*;
use crate::utils::geo::{CellRange, GridCell};

/// Outcome of a proposal reaching `rejected` or `expired`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub proposal: Proposal,
    /// Users put back into the searching pool.
    pub requeued: Vec<UserId>,
    /// Users whose deferred cancel took effect.
    pub dropped: Vec<UserId>,
}

/// Resume point for paging the searching pool in `(enqueued_at, user_id)`
/// order: the last row of the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub enqueued_at: DateTime<Utc>,
    pub user_id: UserId,
}

impl ScanCursor {
    pub fn after(entry: &SearchingUser) -> Self {
        Self {
            enqueued_at: entry.enqueued_at,
            user_id: entry.user_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub searching: u64,
    pub open_proposals: u64,
    pub open_matches: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub proposals: u64,
    pub matches: u64,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn ping(&self) -> MatchResult<()>;

    // Profiles and relations (owned by the profile service, read-only here)

    async fn load_profiles(&self, users: &[UserId]) -> MatchResult<HashMap<UserId, Profile>>;

    /// Users that must never be proposed to `user`: blocks in either
    /// direction, friends, anyone already matched with them, and anyone
    /// either side rejected in an earlier proposal.
    async fn excluded_partners(&self, user: UserId) -> MatchResult<HashSet<UserId>>;

    // Search queue

    /// Fails with `AlreadySearching` if a record exists and `AlreadyMatched`
    /// if the user holds an open match of the same type.
    async fn enqueue(&self, entry: &SearchingUser, cell: Option<GridCell>) -> MatchResult<()>;

    async fn searching_user(&self, user: UserId) -> MatchResult<Option<SearchingUser>>;

    /// Removes the record, or marks it for removal when a proposal holds it.
    async fn dequeue(&self, user: UserId) -> MatchResult<CancelOutcome>;

    /// Searching (unclaimed) users of `match_type` inside `range`, plus users
    /// without a location. `None` scans every cell. Users in `exclude` are
    /// skipped before `limit` applies. Oldest first, strictly after `after`.
    async fn searching_in_range(
        &self,
        match_type: MatchType,
        range: Option<CellRange>,
        exclude: &HashSet<UserId>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> MatchResult<Vec<SearchingUser>>;

    /// Unclaimed searchers, oldest first.
    async fn oldest_searching(&self, limit: usize) -> MatchResult<Vec<SearchingUser>>;

    /// Drops unclaimed searchers enqueued before `cutoff` that hold no live
    /// connection.
    async fn remove_disconnected(&self, cutoff: DateTime<Utc>) -> MatchResult<Vec<UserId>>;

    // Proposals

    /// Atomically claims both users and stores the proposal. Fails with
    /// `AlreadyProposed` if either user is already claimed and
    /// `NotSearching` if either left the pool.
    async fn claim_pair(&self, proposal: &Proposal) -> MatchResult<()>;

    async fn proposal(&self, id: ProposalId) -> MatchResult<Option<Proposal>>;

    async fn open_proposal_for(&self, user: UserId) -> MatchResult<Option<Proposal>>;

    /// Check-and-set from `from` to `to` (not `confirmed`, see
    /// `confirm_match`). Returns `None` when the status already moved on.
    /// Releasing states free both claims in the same unit.
    async fn transition_proposal(
        &self,
        id: ProposalId,
        from: ProposalStatus,
        to: ProposalStatus,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Resolution>>;

    /// Expires every open proposal past its deadline, exactly once each.
    async fn expire_due(&self, now: DateTime<Utc>) -> MatchResult<Vec<Resolution>>;

    // Matches

    async fn open_match_for(&self, user: UserId, match_type: MatchType) -> MatchResult<Option<Match>>;

    /// Moves the proposal from `from` to `confirmed`, removes both searchers,
    /// stores `record` and, for blind dates, its reveal progress. `None` when
    /// the proposal status already moved on.
    async fn confirm_match(
        &self,
        proposal_id: ProposalId,
        from: ProposalStatus,
        record: &Match,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Match>>;

    async fn match_record(&self, id: MatchId) -> MatchResult<Option<Match>>;

    /// First writer wins; returns the chat id now stored.
    async fn set_chat_id(&self, id: MatchId, chat_id: &str) -> MatchResult<Option<ChatId>>;

    async fn matches_pending_chat(&self, limit: usize) -> MatchResult<Vec<Match>>;

    /// Check-and-set on the match status.
    async fn update_match_status(
        &self,
        id: MatchId,
        from: MatchStatus,
        to: MatchStatus,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Match>>;

    async fn reveal_progress(&self, id: MatchId) -> MatchResult<Option<RevealProgress>>;

    async fn record_reveal_request(&self, id: MatchId, by_user_a: bool) -> MatchResult<Option<RevealProgress>>;

    async fn increment_messages(&self, id: MatchId) -> MatchResult<Option<RevealProgress>>;

    /// Active blind dates whose reveal clock started at or before
    /// `started_before`, oldest first.
    async fn active_reveals_started_before(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> MatchResult<Vec<MatchId>>;

    // Connection registry

    async fn register_connection(&self, entry: &ConnectionEntry) -> MatchResult<()>;

    async fn unregister_connection(&self, channel_id: ChannelId) -> MatchResult<()>;

    async fn connections_for(&self, user: UserId) -> MatchResult<Vec<ConnectionEntry>>;

    async fn heartbeat(&self, process_id: ProcessId, now: DateTime<Utc>) -> MatchResult<()>;

    /// Deletes processes silent since `cutoff` along with their connections.
    async fn purge_stale_processes(&self, cutoff: DateTime<Utc>) -> MatchResult<u64>;

    // Monitoring and maintenance

    async fn counts(&self) -> MatchResult<StoreCounts>;

    /// Deletes ended matches and terminal proposals older than `before`.
    async fn prune_history(&self, before: DateTime<Utc>, dry_run: bool) -> MatchResult<PruneReport>;
}
