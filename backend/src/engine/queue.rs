//! The searching pool and candidate discovery.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use super::scorer::{CompatibilityScorer, ScoreSubject};
use crate::constants::CANDIDATE_SCAN_LIMIT;
use crate::db::{MatchStore, ScanCursor};
use crate::error::{MatchError, MatchResult};
use crate::models::*;
use crate::utils::geo::{covering_cells, haversine_km, GridCell};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub min_score: u8,
    pub max_candidates: usize,
    pub grid_cell_degrees: f64,
    pub max_radius_km: f64,
    pub inactive_days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub user_id: UserId,
    pub score: u8,
    pub enqueued_at: DateTime<Utc>,
    pub distance_km: Option<f64>,
}

/// Another searcher close enough to be worth a nearby alert.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbySearcher {
    pub user_id: UserId,
    pub distance_km: f64,
}

/// Both radii must cover the distance when both users are located.
fn within_both_radii(me: &SearchingUser, other: &SearchingUser) -> Option<Option<f64>> {
    match (me.location, other.location) {
        (Some(a), Some(b)) => {
            let d = haversine_km(a, b);
            (d <= me.criteria.radius_km && d <= other.criteria.radius_km).then_some(Some(d))
        }
        _ => Some(None),
    }
}

/// The searcher's gender preference and age range, applied to `candidate`.
/// Unknown values never satisfy a stated preference.
fn accepts(criteria: &SearchCriteria, candidate: &Profile) -> bool {
    let gender_ok = match criteria.gender_preference {
        Some(wanted) => candidate.gender == Some(wanted),
        None => true,
    };
    let age_ok = match criteria.age_range {
        Some(range) => candidate.age.is_some_and(|age| range.contains(age)),
        None => true,
    };
    gender_ok && age_ok
}

fn rank(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score
        .cmp(&a.score)
        .then(a.enqueued_at.cmp(&b.enqueued_at))
        .then(a.user_id.cmp(&b.user_id))
}

pub struct SearchQueue {
    store: Arc<dyn MatchStore>,
    scorer: CompatibilityScorer,
    config: QueueConfig,
}

impl SearchQueue {
    pub fn new(store: Arc<dyn MatchStore>, scorer: CompatibilityScorer, config: QueueConfig) -> Self {
        Self {
            store,
            scorer,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(
        &self,
        user: UserId,
        match_type: MatchType,
        criteria: SearchCriteria,
        location: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> MatchResult<SearchingUser> {
        criteria.validate(self.config.max_radius_km)?;
        if let Some(point) = location {
            point.validate()?;
        }

        let entry = SearchingUser::new(user, match_type, criteria, location, now);
        let cell = location.map(|p| GridCell::containing(p, self.config.grid_cell_degrees));
        self.store.enqueue(&entry, cell).await?;

        info!(%user, %match_type, located = location.is_some(), "user enqueued");
        Ok(entry)
    }

    pub async fn remove(&self, user: UserId) -> MatchResult<CancelOutcome> {
        let outcome = self.store.dequeue(user).await?;
        info!(%user, ?outcome, "search cancelled");
        Ok(outcome)
    }

    /// Eligible partners for `user`, best first: score descending, then
    /// longest waiting. Every candidate is currently unclaimed, of the same
    /// match type, mutually within radius, passes both users' filters, and is
    /// neither blocked, befriended, previously matched nor inactive.
    ///
    /// The pool is read in pages, oldest first. Paging stops once a page
    /// leaves at least `max_n` candidates ranked or the pool runs out, so a
    /// crowd of ineligible older searchers never hides a newer eligible one.
    pub async fn find_candidates(
        &self,
        user: UserId,
        max_n: usize,
        now: DateTime<Utc>,
    ) -> MatchResult<Vec<RankedCandidate>> {
        let me = self
            .store
            .searching_user(user)
            .await?
            .ok_or(MatchError::NotSearching)?;
        if me.status != SearchStatus::Searching || me.cancel_requested {
            return Ok(Vec::new());
        }

        let my_profile = self
            .store
            .load_profiles(&[user])
            .await?
            .remove(&user)
            .ok_or(MatchError::NotFound("profile"))?;
        if !my_profile.is_matchable(now, self.config.inactive_days) {
            debug!(%user, "searcher profile not matchable");
            return Ok(Vec::new());
        }

        let range = me
            .location
            .map(|p| covering_cells(p, me.criteria.radius_km, self.config.grid_cell_degrees));
        let mut excluded = self.store.excluded_partners(user).await?;
        excluded.insert(user);

        let mut ranked = Vec::new();
        let mut cursor = None;
        let mut pages = 0;
        loop {
            let page = self
                .store
                .searching_in_range(me.match_type, range, &excluded, cursor, CANDIDATE_SCAN_LIMIT)
                .await?;
            pages += 1;
            let exhausted = page.len() < CANDIDATE_SCAN_LIMIT;
            cursor = page.last().map(ScanCursor::after);
            ranked.extend(self.rank_page(&me, &my_profile, page, now).await?);
            if exhausted || ranked.len() >= max_n {
                break;
            }
        }

        ranked.sort_by(rank);
        ranked.truncate(max_n);
        debug!(%user, pages, candidates = ranked.len(), "candidates ranked");
        Ok(ranked)
    }

    /// Scores one page of the pool against the searcher, dropping everyone
    /// the radius, profile or preference filters rule out.
    async fn rank_page(
        &self,
        me: &SearchingUser,
        my_profile: &Profile,
        page: Vec<SearchingUser>,
        now: DateTime<Utc>,
    ) -> MatchResult<Vec<RankedCandidate>> {
        let nearby: Vec<(SearchingUser, Option<f64>)> = page
            .into_iter()
            .filter_map(|other| within_both_radii(me, &other).map(|d| (other, d)))
            .collect();
        if nearby.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<UserId> = nearby.iter().map(|(o, _)| o.user_id).collect();
        let profiles = self.store.load_profiles(&ids).await?;
        let my_subject = ScoreSubject::searching(my_profile, me);

        Ok(nearby
            .iter()
            .filter_map(|(other, distance_km)| {
                let profile = profiles.get(&other.user_id)?;
                if !profile.is_matchable(now, self.config.inactive_days)
                    || !accepts(&me.criteria, profile)
                    || !accepts(&other.criteria, my_profile)
                {
                    return None;
                }
                let score = self
                    .scorer
                    .score(&my_subject, &ScoreSubject::searching(profile, other), &me.criteria);
                (score >= self.config.min_score).then(|| RankedCandidate {
                    user_id: other.user_id,
                    score,
                    enqueued_at: other.enqueued_at,
                    distance_km: *distance_km,
                })
            })
            .collect())
    }

    /// Located searchers of the same type whose radius and ours both cover the
    /// distance, excluding blocked and befriended users. Reads one page.
    pub async fn nearby_searchers(&self, entry: &SearchingUser) -> MatchResult<Vec<NearbySearcher>> {
        let Some(point) = entry.location else {
            return Ok(Vec::new());
        };
        let range = covering_cells(point, entry.criteria.radius_km, self.config.grid_cell_degrees);
        let mut excluded = self.store.excluded_partners(entry.user_id).await?;
        excluded.insert(entry.user_id);
        let pool = self
            .store
            .searching_in_range(entry.match_type, Some(range), &excluded, None, CANDIDATE_SCAN_LIMIT)
            .await?;

        Ok(pool
            .iter()
            .filter_map(|other| match within_both_radii(entry, other) {
                Some(Some(distance_km)) => Some(NearbySearcher {
                    user_id: other.user_id,
                    distance_km,
                }),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgeRange;
    use uuid::Uuid;

    #[test]
    fn test_filters_require_known_values() {
        let profile = Profile::new(Uuid::new_v4(), "A", "B");
        let criteria = SearchCriteria {
            gender_preference: Some(Gender::Female),
            ..SearchCriteria::default()
        };
        assert!(!accepts(&criteria, &profile));
        assert!(accepts(&criteria, &profile.clone().with_gender(Gender::Female)));

        let criteria = SearchCriteria {
            age_range: Some(AgeRange { min: 25, max: 35 }),
            ..SearchCriteria::default()
        };
        assert!(!accepts(&criteria, &profile));
        assert!(accepts(&criteria, &profile.clone().with_age(30)));
        assert!(!accepts(&criteria, &profile.with_age(40)));
    }

    #[test]
    fn test_rank_breaks_ties_by_wait_time() {
        let now = Utc::now();
        let older = RankedCandidate {
            user_id: Uuid::new_v4(),
            score: 40,
            enqueued_at: now - chrono::Duration::seconds(30),
            distance_km: None,
        };
        let newer = RankedCandidate {
            enqueued_at: now,
            user_id: Uuid::new_v4(),
            ..older.clone()
        };
        let better = RankedCandidate {
            score: 60,
            enqueued_at: now,
            user_id: Uuid::new_v4(),
            ..older.clone()
        };
        let mut list = vec![newer.clone(), older.clone(), better.clone()];
        list.sort_by(rank);
        assert_eq!(list, vec![better, older, newer]);
    }

    #[test]
    fn test_radius_must_hold_both_ways() {
        let now = Utc::now();
        let here = GeoPoint::new(52.52, 13.40);
        let there = GeoPoint::new(52.70, 13.40); // ~20km north
        let wide = SearchingUser::new(Uuid::new_v4(), MatchType::Standard, SearchCriteria::default().with_radius(50.0), Some(here), now);
        let narrow = SearchingUser::new(Uuid::new_v4(), MatchType::Standard, SearchCriteria::default().with_radius(10.0), Some(there), now);
        assert_eq!(within_both_radii(&wide, &narrow), None);

        let unlocated = SearchingUser::new(Uuid::new_v4(), MatchType::Standard, SearchCriteria::default(), None, now);
        assert_eq!(within_both_radii(&wide, &unlocated), Some(None));
    }
}
