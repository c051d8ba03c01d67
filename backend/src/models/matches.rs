use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::proposals::{Proposal, ProposalId};
use super::search::{MatchType, UserId};
use crate::error::MatchError;

pub type MatchId = Uuid;
pub type ChatId = String;

/// `active -> revealed -> ended`, or `active -> ended`. Standard matches never
/// pass through `revealed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Active,
    Revealed,
    Ended,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Active => "active",
            MatchStatus::Revealed => "revealed",
            MatchStatus::Ended => "ended",
        }
    }
}

impl FromStr for MatchStatus {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MatchStatus::Active),
            "revealed" => Ok(MatchStatus::Revealed),
            "ended" => Ok(MatchStatus::Ended),
            other => Err(MatchError::StoreUnavailable(format!(
                "corrupt match status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub proposal_id: ProposalId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub chat_id: Option<ChatId>,
    pub compatibility_score: u8,
    pub match_type: MatchType,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub revealed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Match {
    pub fn from_proposal(proposal: &Proposal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id: proposal.id,
            user_a: proposal.user_a,
            user_b: proposal.user_b,
            chat_id: None,
            compatibility_score: proposal.score,
            match_type: proposal.match_type,
            status: MatchStatus::Active,
            created_at: now,
            revealed_at: None,
            ended_at: None,
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }

    pub fn partner_of(&self, user: UserId) -> Option<UserId> {
        if user == self.user_a {
            Some(self.user_b)
        } else if user == self.user_b {
            Some(self.user_a)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != MatchStatus::Ended
    }

    /// Identity stays masked for blind dates until the reveal, including
    /// blind dates that ended before one.
    pub fn identity_masked(&self) -> bool {
        self.match_type == MatchType::BlindDate && self.revealed_at.is_none()
    }
}

/// Progress towards the reveal of a blind date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealProgress {
    pub match_id: MatchId,
    pub requested_by_a: bool,
    pub requested_by_b: bool,
    pub message_count: u32,
    pub started_at: DateTime<Utc>,
}

impl RevealProgress {
    pub fn new(match_id: MatchId, started_at: DateTime<Utc>) -> Self {
        Self {
            match_id,
            requested_by_a: false,
            requested_by_b: false,
            message_count: 0,
            started_at,
        }
    }

    pub fn both_requested(&self) -> bool {
        self.requested_by_a && self.requested_by_b
    }
}
