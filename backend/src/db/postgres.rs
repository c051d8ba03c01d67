use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::store::{MatchStore, PruneReport, Resolution, ScanCursor, StoreCounts};
use crate::error::{MatchError, MatchResult};
use crate::models::*;
use crate::utils::geo::{CellRange, GridCell};

const OPEN_STATUSES: &str = "('pending', 'accepted_by_a', 'accepted_by_b')";

const SEARCHING_COLUMNS: &str = "user_id, match_type, criteria, latitude, longitude, status, cancel_requested, enqueued_at";

const PROPOSAL_COLUMNS: &str = "id, user_a, user_b, match_type, score, status, created_at, expires_at, resolved_at";

const MATCH_COLUMNS: &str = "id, proposal_id, user_a, user_b, chat_id, compatibility_score, match_type, status, created_at, revealed_at, ended_at";

const REVEAL_COLUMNS: &str = "match_id, requested_by_a, requested_by_b, message_count, started_at";

// Row types mirror the tables; conversions into the domain types validate the
// text-encoded enums.

#[derive(FromRow)]
struct ProfileRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    age: Option<i16>,
    gender: Option<String>,
    about: Option<String>,
    interests: Vec<String>,
    needs: Vec<String>,
    is_suspended: bool,
    deleted_at: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        Profile {
            user_id: row.id,
            first_name: row.first_name,
            last_name: row.last_name,
            age: row.age.and_then(|a| u8::try_from(a).ok()),
            // Unrecognised free-form genders are treated as unknown
            gender: row.gender.and_then(|g| g.parse().ok()),
            bio: row.about,
            interests: row.interests,
            needs: row.needs,
            is_suspended: row.is_suspended,
            deleted_at: row.deleted_at,
            last_active: row.last_active,
        }
    }
}

#[derive(FromRow)]
struct SearchingRow {
    user_id: Uuid,
    match_type: String,
    criteria: Json<SearchCriteria>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    status: String,
    cancel_requested: bool,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<SearchingRow> for SearchingUser {
    type Error = MatchError;

    fn try_from(row: SearchingRow) -> MatchResult<Self> {
        let location = match (row.latitude, row.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        };
        Ok(SearchingUser {
            user_id: row.user_id,
            match_type: parse_stored(&row.match_type)?,
            criteria: row.criteria.0,
            location,
            enqueued_at: row.enqueued_at,
            status: row.status.parse()?,
            cancel_requested: row.cancel_requested,
        })
    }
}

#[derive(FromRow)]
struct ProposalRow {
    id: Uuid,
    user_a: Uuid,
    user_b: Uuid,
    match_type: String,
    score: i16,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProposalRow> for Proposal {
    type Error = MatchError;

    fn try_from(row: ProposalRow) -> MatchResult<Self> {
        Ok(Proposal {
            id: row.id,
            user_a: row.user_a,
            user_b: row.user_b,
            match_type: parse_stored(&row.match_type)?,
            score: row.score.clamp(0, 100) as u8,
            status: row.status.parse()?,
            created_at: row.created_at,
            expires_at: row.expires_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(FromRow)]
struct MatchRow {
    id: Uuid,
    proposal_id: Uuid,
    user_a: Uuid,
    user_b: Uuid,
    chat_id: Option<String>,
    compatibility_score: i16,
    match_type: String,
    status: String,
    created_at: DateTime<Utc>,
    revealed_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<MatchRow> for Match {
    type Error = MatchError;

    fn try_from(row: MatchRow) -> MatchResult<Self> {
        Ok(Match {
            id: row.id,
            proposal_id: row.proposal_id,
            user_a: row.user_a,
            user_b: row.user_b,
            chat_id: row.chat_id,
            compatibility_score: row.compatibility_score.clamp(0, 100) as u8,
            match_type: parse_stored(&row.match_type)?,
            status: row.status.parse()?,
            created_at: row.created_at,
            revealed_at: row.revealed_at,
            ended_at: row.ended_at,
        })
    }
}

#[derive(FromRow)]
struct RevealRow {
    match_id: Uuid,
    requested_by_a: bool,
    requested_by_b: bool,
    message_count: i32,
    started_at: DateTime<Utc>,
}

impl From<RevealRow> for RevealProgress {
    fn from(row: RevealRow) -> Self {
        RevealProgress {
            match_id: row.match_id,
            requested_by_a: row.requested_by_a,
            requested_by_b: row.requested_by_b,
            message_count: row.message_count.max(0) as u32,
            started_at: row.started_at,
        }
    }
}

#[derive(FromRow)]
struct ConnectionRow {
    channel_id: Uuid,
    user_id: Uuid,
    process_id: Uuid,
    connected_at: DateTime<Utc>,
}

impl From<ConnectionRow> for ConnectionEntry {
    fn from(row: ConnectionRow) -> Self {
        ConnectionEntry {
            user_id: row.user_id,
            process_id: row.process_id,
            channel_id: row.channel_id,
            connected_at: row.connected_at,
        }
    }
}

fn parse_stored(match_type: &str) -> MatchResult<MatchType> {
    match_type
        .parse()
        .map_err(|_| MatchError::StoreUnavailable(format!("corrupt match type: {match_type}")))
}

fn convert_all<R, T>(rows: Vec<R>) -> MatchResult<Vec<T>>
where
    T: TryFrom<R, Error = MatchError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|e| e.is_unique_violation())
}

/// Shared store on Postgres. Status changes are conditional updates, and
/// multi-row changes run in one transaction.
#[derive(Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Frees both claims and puts the users back into the pool, dropping those
    /// who cancelled while the proposal held them.
    async fn release(tx: &mut Transaction<'_, Postgres>, proposal: &Proposal) -> MatchResult<(Vec<UserId>, Vec<UserId>)> {
        let users = proposal.participants().to_vec();

        sqlx::query("DELETE FROM proposal_claims WHERE proposal_id = $1")
            .bind(proposal.id)
            .execute(&mut **tx)
            .await?;

        let dropped: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM searching_users WHERE user_id = ANY($1) AND cancel_requested RETURNING user_id",
        )
        .bind(&users)
        .fetch_all(&mut **tx)
        .await?;

        let requeued: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE searching_users SET status = 'searching' WHERE user_id = ANY($1) RETURNING user_id",
        )
        .bind(&users)
        .fetch_all(&mut **tx)
        .await?;

        Ok((requeued, dropped))
    }
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn ping(&self) -> MatchResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load_profiles(&self, users: &[UserId]) -> MatchResult<HashMap<UserId, Profile>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(
            r#"
            SELECT id, first_name, last_name, age, gender, about, interests, needs,
                   is_suspended, deleted_at, last_active
            FROM profiles
            WHERE id = ANY($1)
            "#,
        )
        .bind(users.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.id, Profile::from(r))).collect())
    }

    async fn excluded_partners(&self, user: UserId) -> MatchResult<HashSet<UserId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT blocked_id FROM user_blocks WHERE blocker_id = $1
            UNION
            SELECT blocker_id FROM user_blocks WHERE blocked_id = $1
            UNION
            SELECT CASE WHEN user_a = $1 THEN user_b ELSE user_a END
            FROM friendships WHERE user_a = $1 OR user_b = $1
            UNION
            SELECT CASE WHEN user_a = $1 THEN user_b ELSE user_a END
            FROM matches WHERE user_a = $1 OR user_b = $1
            UNION
            SELECT CASE WHEN user_a = $1 THEN user_b ELSE user_a END
            FROM proposals WHERE (user_a = $1 OR user_b = $1) AND status = 'rejected'
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn enqueue(&self, entry: &SearchingUser, cell: Option<GridCell>) -> MatchResult<()> {
        let mut tx = self.pool.begin().await?;

        let matched: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM matches WHERE (user_a = $1 OR user_b = $1) AND match_type = $2 AND status <> 'ended' LIMIT 1",
        )
        .bind(entry.user_id)
        .bind(entry.match_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if matched.is_some() {
            return Err(MatchError::AlreadyMatched);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO searching_users
                (user_id, match_type, criteria, latitude, longitude, cell_lat, cell_lon, status, cancel_requested, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.match_type.as_str())
        .bind(Json(&entry.criteria))
        .bind(entry.location.map(|l| l.lat))
        .bind(entry.location.map(|l| l.lon))
        .bind(cell.map(|c| c.lat))
        .bind(cell.map(|c| c.lon))
        .bind(entry.status.as_str())
        .bind(entry.cancel_requested)
        .bind(entry.enqueued_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(MatchError::AlreadySearching),
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn searching_user(&self, user: UserId) -> MatchResult<Option<SearchingUser>> {
        let row: Option<SearchingRow> = sqlx::query_as(&format!(
            "SELECT {SEARCHING_COLUMNS} FROM searching_users WHERE user_id = $1"
        ))
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SearchingUser::try_from).transpose()
    }

    async fn dequeue(&self, user: UserId) -> MatchResult<CancelOutcome> {
        let removed = sqlx::query("DELETE FROM searching_users WHERE user_id = $1 AND status = 'searching'")
            .bind(user)
            .execute(&self.pool)
            .await?;
        if removed.rows_affected() > 0 {
            return Ok(CancelOutcome::Removed);
        }

        let deferred = sqlx::query(
            "UPDATE searching_users SET cancel_requested = TRUE WHERE user_id = $1 AND status = 'proposal_pending'",
        )
        .bind(user)
        .execute(&self.pool)
        .await?;
        if deferred.rows_affected() > 0 {
            Ok(CancelOutcome::Deferred)
        } else {
            Ok(CancelOutcome::NotSearching)
        }
    }

    async fn searching_in_range(
        &self,
        match_type: MatchType,
        range: Option<CellRange>,
        exclude: &HashSet<UserId>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> MatchResult<Vec<SearchingUser>> {
        let exclude: Vec<Uuid> = exclude.iter().copied().collect();
        let (lat_min, lat_max) = range.map(|r| (r.lat_min, r.lat_max)).unzip();
        let (lon_min, lon_max) = range.and_then(|r| r.lon).unzip();

        // A NULL lat bound scans every cell; a NULL lon bound spans all longitudes
        let rows: Vec<SearchingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SEARCHING_COLUMNS} FROM searching_users
            WHERE status = 'searching' AND match_type = $1
              AND NOT (user_id = ANY($2))
              AND ($3::TIMESTAMPTZ IS NULL OR (enqueued_at, user_id) > ($3, $4))
              AND ($5::INTEGER IS NULL
                   OR cell_lat IS NULL
                   OR (cell_lat BETWEEN $5 AND $6
                       AND ($7::INTEGER IS NULL OR cell_lon BETWEEN $7 AND $8)))
            ORDER BY enqueued_at, user_id
            LIMIT $9
            "#
        ))
        .bind(match_type.as_str())
        .bind(exclude)
        .bind(after.map(|c| c.enqueued_at))
        .bind(after.map(|c| c.user_id))
        .bind(lat_min)
        .bind(lat_max)
        .bind(lon_min)
        .bind(lon_max)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn oldest_searching(&self, limit: usize) -> MatchResult<Vec<SearchingUser>> {
        let rows: Vec<SearchingRow> = sqlx::query_as(&format!(
            "SELECT {SEARCHING_COLUMNS} FROM searching_users WHERE status = 'searching' ORDER BY enqueued_at, user_id LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn remove_disconnected(&self, cutoff: DateTime<Utc>) -> MatchResult<Vec<UserId>> {
        let removed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM searching_users s
            WHERE s.status = 'searching'
              AND s.enqueued_at < $1
              AND NOT EXISTS (SELECT 1 FROM connections c WHERE c.user_id = s.user_id)
            RETURNING s.user_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(removed)
    }

    async fn claim_pair(&self, proposal: &Proposal) -> MatchResult<()> {
        let users = proposal.participants().to_vec();
        let mut tx = self.pool.begin().await?;

        // Lock both rows in a fixed order so concurrent claims cannot deadlock
        let rows: Vec<(Uuid, String, String, bool)> = sqlx::query_as(
            r#"
            SELECT user_id, match_type, status, cancel_requested
            FROM searching_users
            WHERE user_id = ANY($1)
            ORDER BY user_id
            FOR UPDATE
            "#,
        )
        .bind(&users)
        .fetch_all(&mut *tx)
        .await?;

        if rows.len() != 2 {
            return Err(MatchError::NotSearching);
        }
        for (_, match_type, status, cancel_requested) in &rows {
            if *match_type != proposal.match_type.as_str() || *cancel_requested {
                return Err(MatchError::NotSearching);
            }
            if status != SearchStatus::Searching.as_str() {
                return Err(MatchError::AlreadyProposed);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO proposals (id, user_a, user_b, match_type, score, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(proposal.id)
        .bind(proposal.user_a)
        .bind(proposal.user_b)
        .bind(proposal.match_type.as_str())
        .bind(i16::from(proposal.score))
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .bind(proposal.expires_at)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            "INSERT INTO proposal_claims (user_id, proposal_id) VALUES ($1, $3), ($2, $3)",
        )
        .bind(proposal.user_a)
        .bind(proposal.user_b)
        .bind(proposal.id)
        .execute(&mut *tx)
        .await;
        match claimed {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(MatchError::AlreadyProposed),
            Err(e) => return Err(e.into()),
        }

        sqlx::query("UPDATE searching_users SET status = 'proposal_pending' WHERE user_id = ANY($1)")
            .bind(&users)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn proposal(&self, id: ProposalId) -> MatchResult<Option<Proposal>> {
        let row: Option<ProposalRow> = sqlx::query_as(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Proposal::try_from).transpose()
    }

    async fn open_proposal_for(&self, user: UserId) -> MatchResult<Option<Proposal>> {
        let row: Option<ProposalRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PROPOSAL_COLUMNS} FROM proposals
            WHERE id = (SELECT proposal_id FROM proposal_claims WHERE user_id = $1)
              AND status IN {OPEN_STATUSES}
            "#
        ))
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Proposal::try_from).transpose()
    }

    async fn transition_proposal(
        &self,
        id: ProposalId,
        from: ProposalStatus,
        to: ProposalStatus,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Resolution>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ProposalRow> = sqlx::query_as(&format!(
            r#"
            UPDATE proposals
            SET status = $3,
                resolved_at = CASE WHEN $4 THEN $5 ELSE resolved_at END
            WHERE id = $1 AND status = $2
            RETURNING {PROPOSAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let proposal = Proposal::try_from(row)?;

        let (requeued, dropped) = if to.releases_users() {
            Self::release(&mut tx, &proposal).await?
        } else {
            (Vec::new(), Vec::new())
        };

        tx.commit().await?;
        Ok(Some(Resolution {
            proposal,
            requeued,
            dropped,
        }))
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> MatchResult<Vec<Resolution>> {
        let mut tx = self.pool.begin().await?;

        // Concurrent sweeps block on the row locks and then skip rows whose
        // status no longer matches, so each proposal expires once.
        let rows: Vec<ProposalRow> = sqlx::query_as(&format!(
            r#"
            UPDATE proposals
            SET status = 'expired', resolved_at = $1
            WHERE status IN {OPEN_STATUSES} AND expires_at <= $1
            RETURNING {PROPOSAL_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let proposal = Proposal::try_from(row)?;
            let (requeued, dropped) = Self::release(&mut tx, &proposal).await?;
            out.push(Resolution {
                proposal,
                requeued,
                dropped,
            });
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn open_match_for(&self, user: UserId, match_type: MatchType) -> MatchResult<Option<Match>> {
        let row: Option<MatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MATCH_COLUMNS} FROM matches
            WHERE (user_a = $1 OR user_b = $1) AND match_type = $2 AND status <> 'ended'
            LIMIT 1
            "#
        ))
        .bind(user)
        .bind(match_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Match::try_from).transpose()
    }

    async fn confirm_match(
        &self,
        proposal_id: ProposalId,
        from: ProposalStatus,
        record: &Match,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Match>> {
        let mut tx = self.pool.begin().await?;

        let confirmed: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE proposals SET status = 'confirmed', resolved_at = $3
            WHERE id = $1 AND status = $2
            RETURNING id
            "#,
        )
        .bind(proposal_id)
        .bind(from.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if confirmed.is_none() {
            return Ok(None);
        }

        let users = vec![record.user_a, record.user_b];
        sqlx::query("DELETE FROM proposal_claims WHERE proposal_id = $1")
            .bind(proposal_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM searching_users WHERE user_id = ANY($1)")
            .bind(&users)
            .execute(&mut *tx)
            .await?;

        let row: MatchRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO matches
                (id, proposal_id, user_a, user_b, chat_id, compatibility_score, match_type, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {MATCH_COLUMNS}
            "#
        ))
        .bind(record.id)
        .bind(proposal_id)
        .bind(record.user_a)
        .bind(record.user_b)
        .bind(record.chat_id.as_deref())
        .bind(i16::from(record.compatibility_score))
        .bind(record.match_type.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .fetch_one(&mut *tx)
        .await?;

        if record.match_type == MatchType::BlindDate {
            sqlx::query("INSERT INTO reveal_states (match_id, started_at) VALUES ($1, $2)")
                .bind(record.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Match::try_from(row).map(Some)
    }

    async fn match_record(&self, id: MatchId) -> MatchResult<Option<Match>> {
        let row: Option<MatchRow> = sqlx::query_as(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Match::try_from).transpose()
    }

    async fn set_chat_id(&self, id: MatchId, chat_id: &str) -> MatchResult<Option<ChatId>> {
        let stored: Option<Option<String>> = sqlx::query_scalar(
            "UPDATE matches SET chat_id = COALESCE(chat_id, $2) WHERE id = $1 RETURNING chat_id",
        )
        .bind(id)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stored.flatten())
    }

    async fn matches_pending_chat(&self, limit: usize) -> MatchResult<Vec<Match>> {
        let rows: Vec<MatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MATCH_COLUMNS} FROM matches
            WHERE chat_id IS NULL AND status <> 'ended'
            ORDER BY created_at
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn update_match_status(
        &self,
        id: MatchId,
        from: MatchStatus,
        to: MatchStatus,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<Match>> {
        let row: Option<MatchRow> = sqlx::query_as(&format!(
            r#"
            UPDATE matches
            SET status = $3,
                revealed_at = CASE WHEN $3 = 'revealed' THEN $4 ELSE revealed_at END,
                ended_at = CASE WHEN $3 = 'ended' THEN $4 ELSE ended_at END
            WHERE id = $1 AND status = $2
            RETURNING {MATCH_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Match::try_from).transpose()
    }

    async fn reveal_progress(&self, id: MatchId) -> MatchResult<Option<RevealProgress>> {
        let row: Option<RevealRow> = sqlx::query_as(&format!(
            "SELECT {REVEAL_COLUMNS} FROM reveal_states WHERE match_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RevealProgress::from))
    }

    async fn record_reveal_request(&self, id: MatchId, by_user_a: bool) -> MatchResult<Option<RevealProgress>> {
        let row: Option<RevealRow> = sqlx::query_as(&format!(
            r#"
            UPDATE reveal_states
            SET requested_by_a = requested_by_a OR $2,
                requested_by_b = requested_by_b OR $3
            WHERE match_id = $1
            RETURNING {REVEAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(by_user_a)
        .bind(!by_user_a)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RevealProgress::from))
    }

    async fn increment_messages(&self, id: MatchId) -> MatchResult<Option<RevealProgress>> {
        let row: Option<RevealRow> = sqlx::query_as(&format!(
            r#"
            UPDATE reveal_states SET message_count = message_count + 1
            WHERE match_id = $1
            RETURNING {REVEAL_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RevealProgress::from))
    }

    async fn active_reveals_started_before(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> MatchResult<Vec<MatchId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT r.match_id FROM reveal_states r
            JOIN matches m ON m.id = r.match_id
            WHERE m.status = 'active' AND r.started_at <= $1
            ORDER BY r.started_at
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn register_connection(&self, entry: &ConnectionEntry) -> MatchResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO processes (process_id, heartbeat_at) VALUES ($1, $2)
            ON CONFLICT (process_id) DO NOTHING
            "#,
        )
        .bind(entry.process_id)
        .bind(entry.connected_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO connections (channel_id, user_id, process_id, connected_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.channel_id)
        .bind(entry.user_id)
        .bind(entry.process_id)
        .bind(entry.connected_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn unregister_connection(&self, channel_id: ChannelId) -> MatchResult<()> {
        sqlx::query("DELETE FROM connections WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn connections_for(&self, user: UserId) -> MatchResult<Vec<ConnectionEntry>> {
        let rows: Vec<ConnectionRow> = sqlx::query_as(
            r#"
            SELECT channel_id, user_id, process_id, connected_at
            FROM connections
            WHERE user_id = $1
            ORDER BY connected_at
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ConnectionEntry::from).collect())
    }

    async fn heartbeat(&self, process_id: ProcessId, now: DateTime<Utc>) -> MatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processes (process_id, heartbeat_at) VALUES ($1, $2)
            ON CONFLICT (process_id) DO UPDATE SET heartbeat_at = EXCLUDED.heartbeat_at
            "#,
        )
        .bind(process_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_stale_processes(&self, cutoff: DateTime<Utc>) -> MatchResult<u64> {
        let mut tx = self.pool.begin().await?;

        let stale: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM processes WHERE heartbeat_at < $1 RETURNING process_id",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        if !stale.is_empty() {
            sqlx::query("DELETE FROM connections WHERE process_id = ANY($1)")
                .bind(&stale)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(stale.len() as u64)
    }

    async fn counts(&self) -> MatchResult<StoreCounts> {
        let (searching, open_proposals, open_matches): (i64, i64, i64) = sqlx::query_as(&format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM searching_users),
                (SELECT COUNT(*) FROM proposals WHERE status IN {OPEN_STATUSES}),
                (SELECT COUNT(*) FROM matches WHERE status <> 'ended')
            "#
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreCounts {
            searching: searching.max(0) as u64,
            open_proposals: open_proposals.max(0) as u64,
            open_matches: open_matches.max(0) as u64,
        })
    }

    async fn prune_history(&self, before: DateTime<Utc>, dry_run: bool) -> MatchResult<PruneReport> {
        let mut tx = self.pool.begin().await?;

        let matches = sqlx::query("DELETE FROM matches WHERE status = 'ended' AND ended_at < $1")
            .bind(before)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let proposals = sqlx::query(
            r#"
            DELETE FROM proposals p
            WHERE p.status IN ('confirmed', 'rejected', 'expired')
              AND p.resolved_at < $1
              AND NOT EXISTS (SELECT 1 FROM matches m WHERE m.proposal_id = p.id)
            "#,
        )
        .bind(before)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        Ok(PruneReport { proposals, matches })
    }
}
