pub mod events;
pub mod matches;
pub mod profiles;
pub mod proposals;
pub mod search;

pub use events::{ChannelId, ConnectionEntry, Delivery, EngineEvent, PartnerIdentity, ProcessId};
pub use matches::{ChatId, Match, MatchId, MatchStatus, RevealProgress};
pub use profiles::Profile;
pub use proposals::{Decision, Proposal, ProposalId, ProposalStatus};
pub use search::{
    AgeRange, CancelOutcome, Gender, GeoPoint, MatchType, SearchCriteria, SearchStatus,
    SearchingUser, UserId,
};
