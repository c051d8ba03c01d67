use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::search::{Gender, UserId};

/// Read-only snapshot of a user's profile, owned by the profile service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub age: Option<u8>,
    pub gender: Option<Gender>,
    pub bio: Option<String>,
    pub interests: Vec<String>,
    pub needs: Vec<String>,
    pub is_suspended: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn new(user_id: UserId, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            user_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            age: None,
            gender: None,
            bio: None,
            interests: Vec::new(),
            needs: Vec::new(),
            is_suspended: false,
            deleted_at: None,
            last_active: None,
        }
    }

    pub fn with_age(mut self, age: u8) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_gender(mut self, gender: Gender) -> Self {
        self.gender = Some(gender);
        self
    }

    pub fn with_bio(mut self, bio: impl Into<String>) -> Self {
        self.bio = Some(bio.into());
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

    /// Suspended, deleted and long-inactive users never take part in matching.
    pub fn is_matchable(&self, now: DateTime<Utc>, inactive_days: i64) -> bool {
        if self.is_suspended || self.deleted_at.is_some() {
            return false;
        }
        match self.last_active {
            Some(last) => last >= now - Duration::days(inactive_days),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_inactive_and_suspended_profiles_are_not_matchable() {
        let now = Utc::now();
        let mut profile = Profile::new(Uuid::new_v4(), "Ada", "Lovelace");
        assert!(profile.is_matchable(now, 45));

        profile.last_active = Some(now - Duration::days(60));
        assert!(!profile.is_matchable(now, 45));

        profile.last_active = Some(now);
        profile.is_suspended = true;
        assert!(!profile.is_matchable(now, 45));

        profile.is_suspended = false;
        profile.deleted_at = Some(now);
        assert!(!profile.is_matchable(now, 45));
    }
}
