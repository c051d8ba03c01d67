use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::search::{MatchType, UserId};
use crate::error::{MatchError, MatchResult};

pub type ProposalId = Uuid;

/// Proposal lifecycle. Transitions only move forward:
/// `pending -> accepted_by_{a,b} -> confirmed`, and any open state to
/// `rejected` or `expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    AcceptedByA,
    AcceptedByB,
    Confirmed,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub const OPEN: [ProposalStatus; 3] = [
        ProposalStatus::Pending,
        ProposalStatus::AcceptedByA,
        ProposalStatus::AcceptedByB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::AcceptedByA => "accepted_by_a",
            ProposalStatus::AcceptedByB => "accepted_by_b",
            ProposalStatus::Confirmed => "confirmed",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Confirmed | ProposalStatus::Rejected | ProposalStatus::Expired
        )
    }

    /// Rejected and expired proposals hand their users back to the pool.
    pub fn releases_users(&self) -> bool {
        matches!(self, ProposalStatus::Rejected | ProposalStatus::Expired)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "accepted_by_a" => Ok(ProposalStatus::AcceptedByA),
            "accepted_by_b" => Ok(ProposalStatus::AcceptedByB),
            "confirmed" => Ok(ProposalStatus::Confirmed),
            "rejected" => Ok(ProposalStatus::Rejected),
            "expired" => Ok(ProposalStatus::Expired),
            other => Err(MatchError::StoreUnavailable(format!(
                "corrupt proposal status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub match_type: MatchType,
    pub score: u8,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn new(
        user_a: UserId,
        user_b: UserId,
        match_type: MatchType,
        score: u8,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> MatchResult<Self> {
        if user_a == user_b {
            return Err(MatchError::Validation(
                "a user cannot be proposed to themselves".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_a,
            user_b,
            match_type,
            score,
            status: ProposalStatus::Pending,
            created_at: now,
            expires_at: now + timeout,
            resolved_at: None,
        })
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

    pub fn participants(&self) -> [UserId; 2] {
        [self.user_a, self.user_b]
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at <= now
    }

    /// The status this proposal moves to when `user` answers with `decision`.
    /// Pure: the caller applies the result with a check-and-set.
    pub fn next_status(
        &self,
        user: UserId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> MatchResult<ProposalStatus> {
        if !self.involves(user) {
            return Err(MatchError::invalid_state("proposal belongs to other users"));
        }
        if self.status.is_terminal() {
            return Err(MatchError::invalid_state(format!(
                "proposal is already {}",
                self.status
            )));
        }
        if self.expires_at <= now {
            return Err(MatchError::invalid_state("proposal has expired"));
        }

        let is_a = user == self.user_a;
        match (decision, self.status, is_a) {
            (Decision::Reject, _, _) => Ok(ProposalStatus::Rejected),
            (Decision::Accept, ProposalStatus::Pending, true) => Ok(ProposalStatus::AcceptedByA),
            (Decision::Accept, ProposalStatus::Pending, false) => Ok(ProposalStatus::AcceptedByB),
            (Decision::Accept, ProposalStatus::AcceptedByB, true)
            | (Decision::Accept, ProposalStatus::AcceptedByA, false) => Ok(ProposalStatus::Confirmed),
            (Decision::Accept, _, _) => {
                Err(MatchError::invalid_state("user already accepted this proposal"))
            }
        }
    }
}
