use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::*;
use crate::error::{MatchError, MatchResult};

pub type UserId = Uuid;

/// Kind of pairing a user is searching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Standard,
    BlindDate,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Standard => "standard",
            MatchType::BlindDate => "blind_date",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(MatchType::Standard),
            "blind_date" => Ok(MatchType::BlindDate),
            other => Err(MatchError::Validation(format!("unknown match type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    NonBinary,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::NonBinary => "non_binary",
            Gender::Other => "other",
        }
    }
}

impl FromStr for Gender {
    type Err = MatchError;

    // Profile rows store gender in free-form lowercase text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" | "man" => Ok(Gender::Male),
            "female" | "woman" => Ok(Gender::Female),
            "non_binary" | "non-binary" | "nonbinary" => Ok(Gender::NonBinary),
            "other" => Ok(Gender::Other),
            other => Err(MatchError::Validation(format!("unknown gender: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn validate(&self) -> MatchResult<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(MatchError::Validation("lat out of range".to_string()));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(MatchError::Validation("lon out of range".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: u8,
    pub max: u8,
}

impl AgeRange {
    pub fn contains(&self, age: u8) -> bool {
        (self.min..=self.max).contains(&age)
    }
}

fn default_radius() -> f64 {
    DEFAULT_SEARCH_RADIUS_KM
}

/// What a searcher is looking for. Interests and needs, when given, replace
/// the profile's own lists for scoring this search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub gender_preference: Option<Gender>,
    #[serde(default)]
    pub age_range: Option<AgeRange>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default = "default_radius")]
    pub radius_km: f64,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            gender_preference: None,
            age_range: None,
            interests: Vec::new(),
            needs: Vec::new(),
            radius_km: DEFAULT_SEARCH_RADIUS_KM,
        }
    }
}

impl SearchCriteria {
    pub fn with_radius(mut self, radius_km: f64) -> Self {
        self.radius_km = radius_km;
        self
    }

    pub fn with_interests<I, S>(mut self, interests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interests = interests.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self, max_radius_km: f64) -> MatchResult<()> {
        if !self.radius_km.is_finite() || self.radius_km <= 0.0 || self.radius_km > max_radius_km {
            return Err(MatchError::Validation(format!(
                "radius_km must be within (0, {max_radius_km}]"
            )));
        }

        if let Some(range) = self.age_range {
            if range.min < MIN_AGE || range.max > MAX_AGE || range.min > range.max {
                return Err(MatchError::Validation(format!(
                    "age_range must satisfy {MIN_AGE} <= min <= max <= {MAX_AGE}"
                )));
            }
        }

        for (field, tags) in [("interests", &self.interests), ("needs", &self.needs)] {
            if tags.len() > MAX_CRITERIA_TAGS {
                return Err(MatchError::Validation(format!(
                    "{field} accepts at most {MAX_CRITERIA_TAGS} entries"
                )));
            }
            if tags
                .iter()
                .any(|t| t.trim().is_empty() || t.len() > MAX_TAG_LENGTH)
            {
                return Err(MatchError::Validation(format!(
                    "{field} entries must be non-empty and at most {MAX_TAG_LENGTH} bytes"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Searching,
    ProposalPending,
}

impl SearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStatus::Searching => "searching",
            SearchStatus::ProposalPending => "proposal_pending",
        }
    }
}

impl FromStr for SearchStatus {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "searching" => Ok(SearchStatus::Searching),
            "proposal_pending" => Ok(SearchStatus::ProposalPending),
            other => Err(MatchError::StoreUnavailable(format!(
                "corrupt search status: {other}"
            ))),
        }
    }
}

/// A user enqueued in the searching pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchingUser {
    pub user_id: UserId,
    pub match_type: MatchType,
    pub criteria: SearchCriteria,
    pub location: Option<GeoPoint>,
    pub enqueued_at: DateTime<Utc>,
    pub status: SearchStatus,
    /// Set when the user cancelled while a proposal held them; the record is
    /// dropped instead of re-enqueued once that proposal resolves.
    pub cancel_requested: bool,
}

impl SearchingUser {
    pub fn new(
        user_id: UserId,
        match_type: MatchType,
        criteria: SearchCriteria,
        location: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            match_type,
            criteria,
            location,
            enqueued_at: now,
            status: SearchStatus::Searching,
            cancel_requested: false,
        }
    }
}

/// Result of a cancel-search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Removed,
    /// A pending proposal holds the user; removal happens when it resolves.
    Deferred,
    NotSearching,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_defaults_from_empty_json() {
        let criteria: SearchCriteria = serde_json::from_str("{}").unwrap();
        assert_eq!(criteria, SearchCriteria::default());
        assert!(criteria.validate(MAX_SEARCH_RADIUS_KM).is_ok());
    }

    #[test]
    fn test_criteria_rejects_bad_radius_and_ages() {
        let criteria = SearchCriteria::default().with_radius(0.0);
        assert!(criteria.validate(MAX_SEARCH_RADIUS_KM).is_err());

        let criteria = SearchCriteria::default().with_radius(MAX_SEARCH_RADIUS_KM + 1.0);
        assert!(criteria.validate(MAX_SEARCH_RADIUS_KM).is_err());

        let criteria = SearchCriteria {
            age_range: Some(AgeRange { min: 30, max: 25 }),
            ..SearchCriteria::default()
        };
        assert!(matches!(
            criteria.validate(MAX_SEARCH_RADIUS_KM),
            Err(MatchError::Validation(_))
        ));
    }

    #[test]
    fn test_criteria_rejects_blank_tags() {
        let criteria = SearchCriteria::default().with_interests(["hiking", "  "]);
        assert!(criteria.validate(MAX_SEARCH_RADIUS_KM).is_err());
    }

    #[test]
    fn test_geo_point_bounds() {
        assert!(GeoPoint::new(52.52, 13.40).validate().is_ok());
        assert!(GeoPoint::new(91.0, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_match_type_round_trips_through_text() {
        for t in [MatchType::Standard, MatchType::BlindDate] {
            assert_eq!(t.as_str().parse::<MatchType>().unwrap(), t);
        }
        assert_eq!(
            serde_json::to_string(&MatchType::BlindDate).unwrap(),
            "\"blind_date\""
        );
    }

    #[test]
    fn test_gender_parsing_is_lenient() {
        assert_eq!("Female".parse::<Gender>().unwrap(), Gender::Female);
        assert_eq!("non-binary".parse::<Gender>().unwrap(), Gender::NonBinary);
        assert!("robot".parse::<Gender>().is_err());
    }
}
