//! Single-process store backed by a mutex around plain maps.
//!
//! Every trait method takes the lock once, so each one is atomic exactly like
//! its Postgres transaction. Used for `STORE_BACKEND=memory` and by the tests,
//! which can also seed profiles and relations and simulate an outage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};

use super::store::{MatchStore, PruneReport, Resolution, ScanCursor, StoreCounts};
use crate::error::{MatchError, MatchResult};
use crate::models::*;
use crate::utils::geo::{CellRange, GridCell};

#[derive(Default)]
struct State {
    profiles: HashMap<UserId, Profile>,
    blocks: HashSet<(UserId, UserId)>,
    friendships: HashSet<(UserId, UserId)>,
    searching: HashMap<UserId, (SearchingUser, Option<GridCell>)>,
    proposals: HashMap<ProposalId, Proposal>,
    claims: HashMap<UserId, ProposalId>,
    matches: HashMap<MatchId, Match>,
    reveals: HashMap<MatchId, RevealProgress>,
    connections: HashMap<ChannelId, ConnectionEntry>,
    processes: HashMap<ProcessId, DateTime<Utc>>,
}

impl State {
    fn release(&mut self, proposal: &Proposal) -> (Vec<UserId>, Vec<UserId>) {
        let mut requeued = Vec::new();
        let mut dropped = Vec::new();
        for user in proposal.participants() {
            if self.claims.get(&user) == Some(&proposal.id) {
                self.claims.remove(&user);
            }
            let cancelled = match self.searching.get_mut(&user) {
                Some((entry, _)) if entry.cancel_requested => true,
                Some((entry, _)) => {
                    entry.status = SearchStatus::Searching;
                    requeued.push(user);
                    false
                }
                None => false,
            };
            if cancelled {
                self.searching.remove(&user);
                dropped.push(user);
            }
        }
        (requeued, dropped)
    }

    fn searching_sorted<'a>(
        &'a self,
        filter: impl Fn(&SearchingUser, Option<GridCell>) -> bool + 'a,
    ) -> Vec<SearchingUser> {
        let mut out: Vec<SearchingUser> = self
            .searching
            .values()
            .filter(|(entry, cell)| entry.status == SearchStatus::Searching && filter(entry, *cell))
            .map(|(entry, _)| entry.clone())
            .collect();
        out.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.user_id.cmp(&b.user_id)));
        out
    }
}

fn pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b { (a, b) } else { (b, a) }
}

pub struct MemoryStore {
    state: Mutex<State>,
    available: Mutex<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Mutex::new(true),
        }
    }

    /// While unavailable every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        *self.available.lock() = available;
    }

    pub fn upsert_profile(&self, profile: Profile) {
        self.state.lock().profiles.insert(profile.user_id, profile);
    }

    pub fn block(&self, blocker: UserId, blocked: UserId) {
        self.state.lock().blocks.insert((blocker, blocked));
    }

    pub fn befriend(&self, a: UserId, b: UserId) {
        self.state.lock().friendships.insert(pair(a, b));
    }

    fn lock(&self) -> MatchResult<MutexGuard<'_, State>> {
        if !*self.available.lock() {
            return Err(MatchError::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(self.state.lock())
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn ping(&self) -> MatchResult<()> {
        self.lock().map(|_| ())
    }

    async fn load_profiles(&self, users: &[UserId]) -> MatchResult<HashMap<UserId, Profile>> {
        let st = self.lock()?;
        Ok(users
            .iter()
            .filter_map(|id| st.profiles.get(id).map(|p| (*id, p.clone())))
            .collect())
    }

    async fn excluded_partners(&self, user: UserId) -> MatchResult<HashSet<UserId>> {
        let st = self.lock()?;
        let mut out = HashSet::new();
        for (blocker, blocked) in &st.blocks {
            if *blocker == user {
                out.insert(*blocked);
            } else if *blocked == user {
                out.insert(*blocker);
            }
        }
        for (a, b) in &st.friendships {
            if *a == user {
                out.insert(*b);
            } else if *b == user {
                out.insert(*a);
            }
        }
        for m in st.matches.values() {
            if let Some(partner) = m.partner_of(user) {
                out.insert(partner);
            }
        }
        for p in st.proposals.values() {
            if p.status == ProposalStatus::Rejected {
                if let Some(partner) = p.partner_of(user) {
                    out.insert(partner);
                }
            }
        }
        Ok(out)
    }

    async fn enqueue(&self, entry: &SearchingUser, cell: Option<GridCell>) -> MatchResult<()> {
        let mut st = self.lock()?;
        if st.searching.contains_key(&entry.user_id) {
            return Err(MatchError::AlreadySearching);
        }
        let matched = st
            .matches
            .values()
            .any(|m| m.is_open() && m.match_type == entry.match_type && m.involves(entry.user_id));
        if matched {
            return Err(MatchError::AlreadyMatched);
        }
        st.searching.insert(entry.user_id, (entry.clone(), cell));
        Ok(())
    }

    async fn searching_user(&self, user: UserId) -> MatchResult<Option<SearchingUser>> {
        let st = self.lock()?;
        Ok(st.searching.get(&user).map(|(entry, _)| entry.clone()))
    }

    async fn dequeue(&self, user: UserId) -> MatchResult<CancelOutcome> {
        let mut st = self.lock()?;
        let Some((entry, _)) = st.searching.get_mut(&user) else {
            return Ok(CancelOutcome::NotSearching);
        };
        if entry.status == SearchStatus::ProposalPending {
            entry.cancel_requested = true;
            return Ok(CancelOutcome::Deferred);
        }
        st.searching.remove(&user);
        Ok(CancelOutcome::Removed)
    }

    async fn searching_in_range(
        &self,
        match_type: MatchType,
        range: Option<CellRange>,
        exclude: &HashSet<UserId>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> MatchResult<Vec<SearchingUser>> {
        let st = self.lock()?;
        let mut out = st.searching_sorted(move |entry, cell| {
            entry.match_type == match_type
                && !exclude.contains(&entry.user_id)
                && after.is_none_or(|c| (entry.enqueued_at, entry.user_id) > (c.enqueued_at, c.user_id))
                && match (range, cell) {
                    (Some(range), Some(cell)) => range.contains(cell),
                    _ => true,
                }
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn oldest_searching(&self, limit: usize) -> MatchResult<Vec<SearchingUser>> {
        let st = self.lock()?;
        let mut out = st.searching_sorted(|_, _| true);
        out.truncate(limit);
        Ok(out)
    }

    async fn remove_disconnected(&self, cutoff: DateTime<Utc>) -> MatchResult<Vec<UserId>> {
        let mut st = self.lock()?;
        let connected: HashSet<UserId> = st.connections.values().map(|c| c.user_id).collect();
        let stale: Vec<UserId> = st
            .searching
            .values()
            .filter(|(entry, _)| {
                entry.status == SearchStatus::Searching
                    && entry.enqueued_at < cutoff
                    && !connected.contains(&entry.user_id)
            })
            .map(|(entry, _)| entry.user_id)
            .collect();
        for user in &stale {
            st.searching.remove(user);
        }
        Ok(stale)
    }

    async fn claim_pair(&self, proposal: &Proposal) -> MatchResult<()> {
        let mut st = self.lock()?;
        for user in proposal.participants() {
            if st.claims.contains_key(&user) {
                return Err(MatchError::AlreadyProposed);
            }
            match st.searching.get(&user) {
                Some((entry, _)) if entry.match_type == proposal.match_type && !entry.cancel_requested => {
                    if entry.status != SearchStatus::Searching {
                        return Err(MatchError::AlreadyProposed);
                    }
                }
                _ => return Err(MatchError::NotSearching),
            }
        }
        for user in proposal.participants() {
            st.claims.insert(user, proposal.id);
            if let Some((entry, _)) = st.searching.get_mut(&user) {
                entry.status = SearchStatus::ProposalPending;
            }
        }
        st.proposals.insert(proposal.id, proposal.clone());
        Ok(())
    }

    async fn proposal(&self, id: ProposalId) -> MatchResult<Option<Proposal>> {
        Ok(self.lock()?.proposals.get(&id).cloned())
    }

    async fn open_proposal_for(&self, user: UserId) -> MatchResult<Option<Proposal>> {
        let st = self.lock()?;
        Ok(st
            .claims
            .get(&user)
            .and_then(|id| st.proposals.get(id))
            .filter(|p| !p.status.is_terminal())
            .cloned())
    }

    async fn transition_proposal(
        &self,
        id: ProposalId,
        from: ProposalStatus,
        to: ProposalStatus,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Resolution>> {
        let mut st = self.lock()?;
        let Some(proposal) = st.proposals.get_mut(&id) else {
            return Ok(None);
        };
        if proposal.status != from {
            return Ok(None);
        }
        proposal.status = to;
        if to.is_terminal() {
            proposal.resolved_at = Some(now);
        }
        let proposal = proposal.clone();
        let (requeued, dropped) = if to.releases_users() {
            st.release(&proposal)
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(Some(Resolution {
            proposal,
            requeued,
            dropped,
        }))
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> MatchResult<Vec<Resolution>> {
        let mut st = self.lock()?;
        let due: Vec<ProposalId> = st
            .proposals
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| p.id)
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for id in due {
            let Some(proposal) = st.proposals.get_mut(&id) else {
                continue;
            };
            proposal.status = ProposalStatus::Expired;
            proposal.resolved_at = Some(now);
            let proposal = proposal.clone();
            let (requeued, dropped) = st.release(&proposal);
            out.push(Resolution {
                proposal,
                requeued,
                dropped,
            });
        }
        Ok(out)
    }

    async fn open_match_for(&self, user: UserId, match_type: MatchType) -> MatchResult<Option<Match>> {
        let st = self.lock()?;
        Ok(st
            .matches
            .values()
            .find(|m| m.is_open() && m.match_type == match_type && m.involves(user))
            .cloned())
    }

    async fn confirm_match(
        &self,
        proposal_id: ProposalId,
        from: ProposalStatus,
        record: &Match,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Match>> {
        let mut st = self.lock()?;
        let Some(proposal) = st.proposals.get_mut(&proposal_id) else {
            return Ok(None);
        };
        if proposal.status != from {
            return Ok(None);
        }
        proposal.status = ProposalStatus::Confirmed;
        proposal.resolved_at = Some(now);
        let participants = proposal.participants();
        for user in participants {
            st.claims.remove(&user);
            st.searching.remove(&user);
        }
        if record.match_type == MatchType::BlindDate {
            st.reveals.insert(record.id, RevealProgress::new(record.id, now));
        }
        st.matches.insert(record.id, record.clone());
        Ok(Some(record.clone()))
    }

    async fn match_record(&self, id: MatchId) -> MatchResult<Option<Match>> {
        Ok(self.lock()?.matches.get(&id).cloned())
    }

    async fn set_chat_id(&self, id: MatchId, chat_id: &str) -> MatchResult<Option<ChatId>> {
        let mut st = self.lock()?;
        Ok(st.matches.get_mut(&id).map(|m| {
            m.chat_id
                .get_or_insert_with(|| chat_id.to_string())
                .clone()
        }))
    }

    async fn matches_pending_chat(&self, limit: usize) -> MatchResult<Vec<Match>> {
        let st = self.lock()?;
        let mut out: Vec<Match> = st
            .matches
            .values()
            .filter(|m| m.chat_id.is_none() && m.is_open())
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_match_status(
        &self,
        id: MatchId,
        from: MatchStatus,
        to: MatchStatus,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Match>> {
        let mut st = self.lock()?;
        let Some(m) = st.matches.get_mut(&id) else {
            return Ok(None);
        };
        if m.status != from {
            return Ok(None);
        }
        m.status = to;
        match to {
            MatchStatus::Revealed => m.revealed_at = Some(now),
            MatchStatus::Ended => m.ended_at = Some(now),
            MatchStatus::Active => {}
        }
        Ok(Some(m.clone()))
    }

    async fn reveal_progress(&self, id: MatchId) -> MatchResult<Option<RevealProgress>> {
        Ok(self.lock()?.reveals.get(&id).cloned())
    }

    async fn record_reveal_request(&self, id: MatchId, by_user_a: bool) -> MatchResult<Option<RevealProgress>> {
        let mut st = self.lock()?;
        Ok(st.reveals.get_mut(&id).map(|progress| {
            if by_user_a {
                progress.requested_by_a = true;
            } else {
                progress.requested_by_b = true;
            }
            progress.clone()
        }))
    }

    async fn increment_messages(&self, id: MatchId) -> MatchResult<Option<RevealProgress>> {
        let mut st = self.lock()?;
        Ok(st.reveals.get_mut(&id).map(|progress| {
            progress.message_count = progress.message_count.saturating_add(1);
            progress.clone()
        }))
    }

    async fn active_reveals_started_before(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> MatchResult<Vec<MatchId>> {
        let st = self.lock()?;
        let mut due: Vec<&RevealProgress> = st
            .reveals
            .values()
            .filter(|progress| {
                progress.started_at <= started_before
                    && st
                        .matches
                        .get(&progress.match_id)
                        .is_some_and(|m| m.status == MatchStatus::Active)
            })
            .collect();
        due.sort_by_key(|progress| progress.started_at);
        Ok(due.into_iter().take(limit).map(|progress| progress.match_id).collect())
    }

    async fn register_connection(&self, entry: &ConnectionEntry) -> MatchResult<()> {
        let mut st = self.lock()?;
        st.processes.entry(entry.process_id).or_insert(entry.connected_at);
        st.connections.insert(entry.channel_id, entry.clone());
        Ok(())
    }

    async fn unregister_connection(&self, channel_id: ChannelId) -> MatchResult<()> {
        self.lock()?.connections.remove(&channel_id);
        Ok(())
    }

    async fn connections_for(&self, user: UserId) -> MatchResult<Vec<ConnectionEntry>> {
        let st = self.lock()?;
        let mut out: Vec<ConnectionEntry> = st
            .connections
            .values()
            .filter(|c| c.user_id == user)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.connected_at);
        Ok(out)
    }

    async fn heartbeat(&self, process_id: ProcessId, now: DateTime<Utc>) -> MatchResult<()> {
        self.lock()?.processes.insert(process_id, now);
        Ok(())
    }

    async fn purge_stale_processes(&self, cutoff: DateTime<Utc>) -> MatchResult<u64> {
        let mut st = self.lock()?;
        let stale: HashSet<ProcessId> = st
            .processes
            .iter()
            .filter(|(_, beat)| **beat < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            st.processes.remove(id);
        }
        st.connections.retain(|_, c| !stale.contains(&c.process_id));
        Ok(stale.len() as u64)
    }

    async fn counts(&self) -> MatchResult<StoreCounts> {
        let st = self.lock()?;
        Ok(StoreCounts {
            searching: st.searching.len() as u64,
            open_proposals: st.proposals.values().filter(|p| !p.status.is_terminal()).count() as u64,
            open_matches: st.matches.values().filter(|m| m.is_open()).count() as u64,
        })
    }

    async fn prune_history(&self, before: DateTime<Utc>, dry_run: bool) -> MatchResult<PruneReport> {
        let mut st = self.lock()?;
        let old_matches: Vec<MatchId> = st
            .matches
            .values()
            .filter(|m| m.ended_at.is_some_and(|t| t < before))
            .map(|m| m.id)
            .collect();
        let old_match_set: HashSet<MatchId> = old_matches.iter().copied().collect();
        let referenced: HashSet<ProposalId> = st
            .matches
            .values()
            .filter(|m| !old_match_set.contains(&m.id))
            .map(|m| m.proposal_id)
            .collect();
        let old_proposals: Vec<ProposalId> = st
            .proposals
            .values()
            .filter(|p| {
                p.status.is_terminal()
                    && p.resolved_at.is_some_and(|t| t < before)
                    && !referenced.contains(&p.id)
            })
            .map(|p| p.id)
            .collect();

        let report = PruneReport {
            proposals: old_proposals.len() as u64,
            matches: old_matches.len() as u64,
        };
        if !dry_run {
            for id in &old_matches {
                st.matches.remove(id);
                st.reveals.remove(id);
            }
            for id in &old_proposals {
                st.proposals.remove(id);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    async fn searcher(store: &MemoryStore, match_type: MatchType) -> UserId {
        let user = Uuid::new_v4();
        let entry = SearchingUser::new(user, match_type, SearchCriteria::default(), None, Utc::now());
        store.enqueue(&entry, None).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_second_claim_on_same_user_conflicts() {
        let store = MemoryStore::new();
        let a = searcher(&store, MatchType::Standard).await;
        let b = searcher(&store, MatchType::Standard).await;
        let c = searcher(&store, MatchType::Standard).await;
        let now = Utc::now();
        let first = Proposal::new(a, b, MatchType::Standard, 50, now, Duration::seconds(45)).unwrap();
        store.claim_pair(&first).await.unwrap();

        let second = Proposal::new(c, b, MatchType::Standard, 60, now, Duration::seconds(45)).unwrap();
        assert!(matches!(store.claim_pair(&second).await, Err(MatchError::AlreadyProposed)));
        // c was not claimed by the failed attempt
        assert_eq!(
            store.searching_user(c).await.unwrap().unwrap().status,
            SearchStatus::Searching
        );
    }

    #[tokio::test]
    async fn test_range_pages_skip_excluded_users() {
        let store = MemoryStore::new();
        let mut users = Vec::new();
        for _ in 0..5 {
            users.push(searcher(&store, MatchType::Standard).await);
        }
        searcher(&store, MatchType::BlindDate).await;
        let exclude: HashSet<UserId> = [users[0], users[2]].into_iter().collect();

        let first = store
            .searching_in_range(MatchType::Standard, None, &exclude, None, 2)
            .await
            .unwrap();
        let cursor = first.last().map(ScanCursor::after);
        let rest = store
            .searching_in_range(MatchType::Standard, None, &exclude, cursor, 2)
            .await
            .unwrap();

        let seen: Vec<UserId> = first.iter().chain(&rest).map(|e| e.user_id).collect();
        let mut expected = store
            .searching_in_range(MatchType::Standard, None, &HashSet::new(), None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.user_id)
            .filter(|u| !exclude.contains(u))
            .collect::<Vec<_>>();
        expected.truncate(3);
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_expiry_requeues_and_honours_deferred_cancel() {
        let store = MemoryStore::new();
        let a = searcher(&store, MatchType::Standard).await;
        let b = searcher(&store, MatchType::Standard).await;
        let now = Utc::now();
        let p = Proposal::new(a, b, MatchType::Standard, 50, now, Duration::seconds(45)).unwrap();
        store.claim_pair(&p).await.unwrap();

        assert_eq!(store.dequeue(b).await.unwrap(), CancelOutcome::Deferred);

        let resolved = store.expire_due(now + Duration::seconds(46)).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].requeued, vec![a]);
        assert_eq!(resolved[0].dropped, vec![b]);
        assert!(store.searching_user(b).await.unwrap().is_none());

        // already expired, nothing left to do
        assert!(store.expire_due(now + Duration::seconds(90)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_is_check_and_set() {
        let store = MemoryStore::new();
        let a = searcher(&store, MatchType::BlindDate).await;
        let b = searcher(&store, MatchType::BlindDate).await;
        let now = Utc::now();
        let p = Proposal::new(a, b, MatchType::BlindDate, 50, now, Duration::seconds(45)).unwrap();
        store.claim_pair(&p).await.unwrap();

        let record = Match::from_proposal(&p, now);
        let first = store.confirm_match(p.id, ProposalStatus::Pending, &record, now).await.unwrap();
        assert!(first.is_some());
        let again = store.confirm_match(p.id, ProposalStatus::Pending, &record, now).await.unwrap();
        assert!(again.is_none());

        assert!(store.reveal_progress(record.id).await.unwrap().is_some());
        assert!(matches!(
            store
                .enqueue(&SearchingUser::new(a, MatchType::BlindDate, SearchCriteria::default(), None, now), None)
                .await,
            Err(MatchError::AlreadyMatched)
        ));
    }

    #[tokio::test]
    async fn test_offline_store_fails_closed() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.ping().await, Err(MatchError::StoreUnavailable(_))));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_chat_id_first_writer_wins() {
        let store = MemoryStore::new();
        let a = searcher(&store, MatchType::Standard).await;
        let b = searcher(&store, MatchType::Standard).await;
        let now = Utc::now();
        let p = Proposal::new(a, b, MatchType::Standard, 50, now, Duration::seconds(45)).unwrap();
        store.claim_pair(&p).await.unwrap();
        let record = Match::from_proposal(&p, now);
        store.confirm_match(p.id, ProposalStatus::Pending, &record, now).await.unwrap();

        assert_eq!(store.set_chat_id(record.id, "chat-1").await.unwrap().as_deref(), Some("chat-1"));
        assert_eq!(store.set_chat_id(record.id, "chat-2").await.unwrap().as_deref(), Some("chat-1"));
        assert!(store.matches_pending_chat(10).await.unwrap().is_empty());
    }
}
