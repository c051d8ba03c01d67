//! Blind-date identity reveal: the pluggable trigger policy, masking, and
//! the `active -> revealed -> ended` transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::dispatcher::RealtimeDispatcher;
use crate::constants::{MASK_CHAR, REVEAL_TICK_BATCH};
use crate::db::MatchStore;
use crate::error::{MatchError, MatchResult};
use crate::models::*;

/// Decides when a blind date's identities are revealed.
pub trait RevealPolicy: Send + Sync + fmt::Debug {
    fn should_reveal(&self, progress: &RevealProgress, now: DateTime<Utc>) -> bool;

    /// Shortest match age at which the policy can fire on time alone. `None`
    /// when only participant activity can trigger it.
    fn elapsed_threshold(&self) -> Option<Duration> {
        None
    }
}

/// Built-in policies, parsed from `REVEAL_POLICY`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RevealRule {
    /// Both participants asked for the reveal.
    #[default]
    MutualRequest,
    /// The chat reached this many messages.
    MessageCount(u32),
    /// This much time passed since the match was created.
    Elapsed(Duration),
    AnyOf(Vec<RevealRule>),
}

impl RevealPolicy for RevealRule {
    fn should_reveal(&self, progress: &RevealProgress, now: DateTime<Utc>) -> bool {
        match self {
            RevealRule::MutualRequest => progress.both_requested(),
            RevealRule::MessageCount(n) => progress.message_count >= *n,
            RevealRule::Elapsed(after) => now - progress.started_at >= *after,
            RevealRule::AnyOf(rules) => rules.iter().any(|r| r.should_reveal(progress, now)),
        }
    }

    fn elapsed_threshold(&self) -> Option<Duration> {
        match self {
            RevealRule::Elapsed(after) => Some(*after),
            RevealRule::AnyOf(rules) => rules.iter().filter_map(RevealPolicy::elapsed_threshold).min(),
            RevealRule::MutualRequest | RevealRule::MessageCount(_) => None,
        }
    }
}

impl FromStr for RevealRule {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("any:") {
            let rules = rest
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<RevealRule>, _>>()?;
            if rules.is_empty() {
                return Err(MatchError::Validation("any: needs at least one policy".to_string()));
            }
            return Ok(RevealRule::AnyOf(rules));
        }

        let bad = || MatchError::Validation(format!("unknown reveal policy: {s}"));
        match s.split_once(':') {
            None if s == "mutual" => Ok(RevealRule::MutualRequest),
            Some(("messages", n)) => n.trim().parse().map(RevealRule::MessageCount).map_err(|_| bad()),
            Some(("minutes", n)) => n
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|m| *m > 0)
                .map(|m| RevealRule::Elapsed(Duration::minutes(m)))
                .ok_or_else(bad),
            _ => Err(bad()),
        }
    }
}

/// Keeps the first character and masks the rest.
pub fn mask_name(name: &str) -> String {
    let mut chars = name.trim().chars();
    match chars.next() {
        Some(first) => std::iter::once(first)
            .chain(chars.map(|_| MASK_CHAR))
            .collect(),
        None => String::new(),
    }
}

/// Label shown in place of raw needs while a blind date is masked.
pub fn match_reason(viewer: &Profile, partner: &Profile) -> String {
    fn overlap(a: &[String], b: &[String]) -> usize {
        let a: HashSet<String> = a.iter().map(|t| t.trim().to_lowercase()).collect();
        b.iter().filter(|t| a.contains(&t.trim().to_lowercase())).count()
    }
    if overlap(&viewer.needs, &partner.needs) > 0 {
        "Looking for the same things".to_string()
    } else {
        match overlap(&viewer.interests, &partner.interests) {
            0 => "Compatible profiles".to_string(),
            1 => "You share an interest".to_string(),
            n => format!("You share {n} interests"),
        }
    }
}

/// How `viewer` sees `partner`.
pub fn partner_identity(viewer: &Profile, partner: &Profile, masked: bool) -> PartnerIdentity {
    if masked {
        PartnerIdentity {
            user_id: None,
            first_name: mask_name(&partner.first_name),
            last_name: mask_name(&partner.last_name),
            age: partner.age,
            bio: None,
            interests: partner.interests.clone(),
            needs: None,
            match_reason: Some(match_reason(viewer, partner)),
            masked: true,
        }
    } else {
        PartnerIdentity {
            user_id: Some(partner.user_id),
            first_name: partner.first_name.clone(),
            last_name: partner.last_name.clone(),
            age: partner.age,
            bio: partner.bio.clone(),
            interests: partner.interests.clone(),
            needs: Some(partner.needs.clone()),
            match_reason: None,
            masked: false,
        }
    }
}

/// Placeholder when the profile service has no row for the partner.
fn unknown_profile(user: UserId) -> Profile {
    Profile::new(user, "", "")
}

/// A match as shown to one of its participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchView {
    pub match_id: MatchId,
    pub match_type: MatchType,
    pub status: MatchStatus,
    pub chat_id: Option<ChatId>,
    pub compatibility_score: u8,
    pub created_at: DateTime<Utc>,
    pub partner: PartnerIdentity,
    pub reveal: Option<RevealProgress>,
}

pub struct RevealStateMachine {
    store: Arc<dyn MatchStore>,
    dispatcher: Arc<RealtimeDispatcher>,
    policy: Arc<dyn RevealPolicy>,
}

impl RevealStateMachine {
    pub fn new(
        store: Arc<dyn MatchStore>,
        dispatcher: Arc<RealtimeDispatcher>,
        policy: Arc<dyn RevealPolicy>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            policy,
        }
    }

    async fn participant_match(&self, match_id: MatchId, user: UserId) -> MatchResult<Match> {
        let record = self
            .store
            .match_record(match_id)
            .await?
            .ok_or(MatchError::NotFound("match"))?;
        if !record.involves(user) {
            return Err(MatchError::Forbidden);
        }
        Ok(record)
    }

    /// Both profiles for a match, keyed as (user_a, user_b).
    async fn profiles(&self, record: &Match) -> MatchResult<(Profile, Profile)> {
        let mut profiles = self.store.load_profiles(&[record.user_a, record.user_b]).await?;
        let a = profiles
            .remove(&record.user_a)
            .unwrap_or_else(|| unknown_profile(record.user_a));
        let b = profiles
            .remove(&record.user_b)
            .unwrap_or_else(|| unknown_profile(record.user_b));
        Ok((a, b))
    }

    pub async fn request_reveal(&self, match_id: MatchId, user: UserId, now: DateTime<Utc>) -> MatchResult<MatchStatus> {
        let record = self.participant_match(match_id, user).await?;
        if record.match_type != MatchType::BlindDate {
            return Err(MatchError::Validation("only blind dates can be revealed".to_string()));
        }
        match record.status {
            MatchStatus::Revealed => return Ok(MatchStatus::Revealed),
            MatchStatus::Ended => return Err(MatchError::invalid_state("match has ended")),
            MatchStatus::Active => {}
        }

        let progress = self
            .store
            .record_reveal_request(match_id, user == record.user_a)
            .await?
            .ok_or(MatchError::NotFound("reveal state"))?;
        info!(%match_id, %user, "reveal requested");

        self.evaluate(&record, &progress, now).await
    }

    /// Counts one chat message towards the message-threshold policy. Standard
    /// and already revealed matches are left alone.
    pub async fn record_message(&self, match_id: MatchId, now: DateTime<Utc>) -> MatchResult<MatchStatus> {
        let record = self
            .store
            .match_record(match_id)
            .await?
            .ok_or(MatchError::NotFound("match"))?;
        if record.match_type != MatchType::BlindDate || record.status != MatchStatus::Active {
            return Ok(record.status);
        }

        let Some(progress) = self.store.increment_messages(match_id).await? else {
            return Ok(record.status);
        };
        self.evaluate(&record, &progress, now).await
    }

    /// Reveals every active blind date a time-based policy has come due for.
    /// Returns how many were revealed.
    pub async fn reveal_due(&self, now: DateTime<Utc>) -> MatchResult<usize> {
        let Some(after) = self.policy.elapsed_threshold() else {
            return Ok(0);
        };
        let due = self
            .store
            .active_reveals_started_before(now - after, REVEAL_TICK_BATCH)
            .await?;

        let mut revealed = 0;
        for match_id in due {
            match self.tick(match_id, now).await {
                Ok(MatchStatus::Revealed) => revealed += 1,
                Ok(_) => {}
                Err(e) => warn!(%match_id, "reveal tick failed: {}", e),
            }
        }
        Ok(revealed)
    }

    /// Re-checks time-based policies for a match nobody touched recently.
    pub async fn tick(&self, match_id: MatchId, now: DateTime<Utc>) -> MatchResult<MatchStatus> {
        let record = self
            .store
            .match_record(match_id)
            .await?
            .ok_or(MatchError::NotFound("match"))?;
        if record.status != MatchStatus::Active {
            return Ok(record.status);
        }
        match self.store.reveal_progress(match_id).await? {
            Some(progress) => self.evaluate(&record, &progress, now).await,
            None => Ok(record.status),
        }
    }

    async fn evaluate(&self, record: &Match, progress: &RevealProgress, now: DateTime<Utc>) -> MatchResult<MatchStatus> {
        if !self.policy.should_reveal(progress, now) {
            return Ok(MatchStatus::Active);
        }

        let Some(revealed) = self
            .store
            .update_match_status(record.id, MatchStatus::Active, MatchStatus::Revealed, now)
            .await?
        else {
            // Someone else moved it first; report whatever it is now
            let current = self.store.match_record(record.id).await?;
            return Ok(current.map(|m| m.status).unwrap_or(MatchStatus::Ended));
        };

        info!(match_id = %revealed.id, "blind date revealed");
        let (a, b) = self.profiles(&revealed).await?;
        self.dispatcher
            .send(
                revealed.user_a,
                EngineEvent::MatchRevealed {
                    match_id: revealed.id,
                    partner: partner_identity(&a, &b, false),
                },
            )
            .await;
        self.dispatcher
            .send(
                revealed.user_b,
                EngineEvent::MatchRevealed {
                    match_id: revealed.id,
                    partner: partner_identity(&b, &a, false),
                },
            )
            .await;

        Ok(MatchStatus::Revealed)
    }

    /// Either participant ends the match, revealed or not.
    pub async fn end(&self, match_id: MatchId, user: UserId, now: DateTime<Utc>) -> MatchResult<()> {
        let record = self.participant_match(match_id, user).await?;
        let mut from = record.status;
        loop {
            if from == MatchStatus::Ended {
                return Err(MatchError::invalid_state("match has already ended"));
            }
            if let Some(ended) = self
                .store
                .update_match_status(match_id, from, MatchStatus::Ended, now)
                .await?
            {
                info!(%match_id, %user, "match ended");
                for participant in [ended.user_a, ended.user_b] {
                    self.dispatcher
                        .send(participant, EngineEvent::MatchEnded { match_id })
                        .await;
                }
                return Ok(());
            }
            // Raced with a reveal; retry from the new status
            from = self
                .store
                .match_record(match_id)
                .await?
                .map(|m| m.status)
                .ok_or(MatchError::NotFound("match"))?;
        }
    }

    /// The match as `viewer` sees it. A blind date whose reveal condition
    /// already holds is revealed first, so a view never shows a stale mask.
    pub async fn view(&self, match_id: MatchId, viewer: UserId, now: DateTime<Utc>) -> MatchResult<MatchView> {
        let mut record = self.participant_match(match_id, viewer).await?;
        let mut reveal = if record.match_type == MatchType::BlindDate {
            self.store.reveal_progress(match_id).await?
        } else {
            None
        };
        let due = match &reveal {
            Some(progress) if record.status == MatchStatus::Active && self.policy.should_reveal(progress, now) => {
                Some(progress.clone())
            }
            _ => None,
        };
        if let Some(progress) = due {
            if self.evaluate(&record, &progress, now).await? != MatchStatus::Active {
                record = self.participant_match(match_id, viewer).await?;
                reveal = self.store.reveal_progress(match_id).await?;
            }
        }

        let (a, b) = self.profiles(&record).await?;
        let (me, partner) = if viewer == record.user_a { (&a, &b) } else { (&b, &a) };

        Ok(MatchView {
            match_id: record.id,
            match_type: record.match_type,
            status: record.status,
            chat_id: record.chat_id.clone(),
            compatibility_score: record.compatibility_score,
            created_at: record.created_at,
            partner: partner_identity(me, partner, record.identity_masked()),
            reveal,
        })
    }
}
