//! Pairwise compatibility scoring.
//!
//! The score is a sum of bounded, independent dimensions clamped to 0..=100.
//! It is a pure function of its inputs and symmetric in the two profiles
//! apart from the radius, which comes from the searcher's criteria.

use std::collections::HashSet;

use crate::constants::*;
use crate::models::{GeoPoint, Profile, SearchCriteria, SearchingUser};
use crate::utils::geo::haversine_km;

/// Points available per dimension and how quickly they taper.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub age_max: f64,
    /// Age gap, in years, at which the age dimension reaches zero.
    pub age_zero_gap: f64,
    pub interest_each: f64,
    /// Shared interests past this count are worth a quarter each.
    pub interest_full_cap: usize,
    pub interest_max: f64,
    pub need_each: f64,
    pub need_full_cap: usize,
    pub need_max: f64,
    pub distance_max: f64,
    pub bio_max: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            age_max: AGE_MAX_POINTS,
            age_zero_gap: AGE_ZERO_SCORE_GAP,
            interest_each: INTEREST_POINTS_EACH,
            interest_full_cap: INTEREST_FULL_VALUE_CAP,
            interest_max: INTEREST_MAX_POINTS,
            need_each: NEED_POINTS_EACH,
            need_full_cap: NEED_FULL_VALUE_CAP,
            need_max: NEED_MAX_POINTS,
            distance_max: DISTANCE_MAX_POINTS,
            bio_max: BIO_MAX_POINTS,
        }
    }
}

/// One side of a scoring call: the profile plus what the current search
/// says about it.
#[derive(Debug, Clone, Copy)]
pub struct ScoreSubject<'a> {
    pub profile: &'a Profile,
    pub interests: &'a [String],
    pub needs: &'a [String],
    pub location: Option<GeoPoint>,
}

impl<'a> ScoreSubject<'a> {
    #[cfg(test)]
    pub fn from_profile(profile: &'a Profile) -> Self {
        Self {
            profile,
            interests: &profile.interests,
            needs: &profile.needs,
            location: None,
        }
    }

    /// Criteria interests and needs, when given, replace the profile's own.
    pub fn searching(profile: &'a Profile, entry: &'a SearchingUser) -> Self {
        let pick = |criteria: &'a [String], own: &'a [String]| if criteria.is_empty() { own } else { criteria };
        Self {
            profile,
            interests: pick(entry.criteria.interests.as_slice(), profile.interests.as_slice()),
            needs: pick(entry.criteria.needs.as_slice(), profile.needs.as_slice()),
            location: entry.location,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompatibilityScorer {
    weights: ScoringWeights,
}

impl CompatibilityScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, a: &ScoreSubject<'_>, b: &ScoreSubject<'_>, criteria: &SearchCriteria) -> u8 {
        let total = self.age_points(a.profile, b.profile)
            + self.interest_points(a.interests, b.interests)
            + self.need_points(a.needs, b.needs)
            + self.distance_points(a.location, b.location, criteria.radius_km)
            + self.bio_points(a.profile, b.profile);

        total.round().clamp(0.0, 100.0) as u8
    }

    fn age_points(&self, a: &Profile, b: &Profile) -> f64 {
        match (a.age, b.age) {
            (Some(x), Some(y)) => {
                let gap = f64::from(x.abs_diff(y));
                (self.weights.age_max * (1.0 - gap / self.weights.age_zero_gap)).max(0.0)
            }
            _ => 0.0,
        }
    }

    fn interest_points(&self, a: &[String], b: &[String]) -> f64 {
        let shared = shared_count(a, b);
        tapered(shared, self.weights.interest_each, self.weights.interest_full_cap, self.weights.interest_max)
    }

    fn need_points(&self, a: &[String], b: &[String]) -> f64 {
        let shared = shared_count(a, b);
        tapered(shared, self.weights.need_each, self.weights.need_full_cap, self.weights.need_max)
    }

    fn distance_points(&self, a: Option<GeoPoint>, b: Option<GeoPoint>, radius_km: f64) -> f64 {
        match (a, b) {
            (Some(a), Some(b)) if radius_km > 0.0 => {
                let d = haversine_km(a, b);
                (self.weights.distance_max * (1.0 - d / radius_km)).max(0.0)
            }
            _ => 0.0,
        }
    }

    fn bio_points(&self, a: &Profile, b: &Profile) -> f64 {
        let (Some(x), Some(y)) = (a.bio.as_deref(), b.bio.as_deref()) else {
            return 0.0;
        };
        let words_x = bio_words(x);
        let words_y = bio_words(y);
        let union = words_x.union(&words_y).count();
        if union == 0 {
            return 0.0;
        }
        let overlap = words_x.intersection(&words_y).count();
        self.weights.bio_max * overlap as f64 / union as f64
    }
}

/// Full value for the first `cap` items, a quarter each after that.
fn tapered(count: usize, each: f64, cap: usize, max: f64) -> f64 {
    let full = count.min(cap) as f64 * each;
    let extra = count.saturating_sub(cap) as f64 * each * 0.25;
    (full + extra).min(max)
}

fn normalize(tags: &[String]) -> HashSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn shared_count(a: &[String], b: &[String]) -> usize {
    normalize(a).intersection(&normalize(b)).count()
}

fn bio_words(bio: &str) -> HashSet<String> {
    bio.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}
