use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::matches::{ChatId, MatchId};
use super::proposals::{ProposalId, ProposalStatus};
use super::search::{MatchType, UserId};

pub type ProcessId = Uuid;
pub type ChannelId = Uuid;

/// How one user sees the other side of a proposal or match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerIdentity {
    /// Withheld while masked.
    pub user_id: Option<UserId>,
    pub first_name: String,
    pub last_name: String,
    pub age: Option<u8>,
    pub bio: Option<String>,
    pub interests: Vec<String>,
    /// Raw needs are replaced by `match_reason` while masked.
    pub needs: Option<Vec<String>>,
    pub match_reason: Option<String>,
    pub masked: bool,
}

/// Events pushed to users over their live connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProposalOffered {
        proposal_id: ProposalId,
        match_type: MatchType,
        score: u8,
        expires_at: DateTime<Utc>,
        partner: PartnerIdentity,
    },
    ProposalResolved {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },
    MatchConfirmed {
        match_id: MatchId,
        match_type: MatchType,
        chat_id: Option<ChatId>,
        partner: PartnerIdentity,
    },
    ChatReady {
        match_id: MatchId,
        chat_id: ChatId,
    },
    MatchRevealed {
        match_id: MatchId,
        partner: PartnerIdentity,
    },
    MatchEnded {
        match_id: MatchId,
    },
    NearbyUserAlert {
        match_type: MatchType,
        distance_km: f64,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ProposalOffered { .. } => "proposal_offered",
            EngineEvent::ProposalResolved { .. } => "proposal_resolved",
            EngineEvent::MatchConfirmed { .. } => "match_confirmed",
            EngineEvent::ChatReady { .. } => "chat_ready",
            EngineEvent::MatchRevealed { .. } => "match_revealed",
            EngineEvent::MatchEnded { .. } => "match_ended",
            EngineEvent::NearbyUserAlert { .. } => "nearby_user_alert",
        }
    }
}

/// One live real-time connection in the shared registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub user_id: UserId,
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub connected_at: DateTime<Utc>,
}

/// An event addressed to a specific channel on a specific process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub event: EngineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged_by_kind() {
        let event = EngineEvent::MatchEnded {
            match_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "match_ended");
        assert_eq!(json["type"], event.kind());
    }

    #[test]
    fn test_delivery_survives_json_transport() {
        let delivery = Delivery {
            process_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            event: EngineEvent::ProposalResolved {
                proposal_id: Uuid::new_v4(),
                status: ProposalStatus::Expired,
            },
        };
        let text = serde_json::to_string(&delivery).unwrap();
        let back: Delivery = serde_json::from_str(&text).unwrap();
        assert_eq!(back, delivery);
    }
}
