use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::auth::AuthUser;
use super::error::ApiResult;
use super::AppState;
use crate::models::{CancelOutcome, GeoPoint, MatchType, SearchCriteria, SearchStatus};

#[derive(Debug, Deserialize)]
pub struct StartSearchRequest {
    pub match_type: MatchType,
    #[serde(default)]
    pub criteria: SearchCriteria,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
pub struct StartSearchResponse {
    pub status: SearchStatus,
    pub match_type: MatchType,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CancelSearchResponse {
    pub status: CancelOutcome,
}

/// Acknowledges the enqueue; proposals arrive over the real-time channel.
pub async fn start_search(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<StartSearchRequest>,
) -> ApiResult<(StatusCode, Json<StartSearchResponse>)> {
    let entry = state
        .engine
        .start_search(user, req.match_type, req.criteria, req.location)
        .await?;
    state.engine.schedule_matching_pass(user);

    info!(%user, match_type = %entry.match_type, "search started");
    Ok((
        StatusCode::ACCEPTED,
        Json(StartSearchResponse {
            status: entry.status,
            match_type: entry.match_type,
            enqueued_at: entry.enqueued_at,
        }),
    ))
}

pub async fn cancel_search(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<CancelSearchResponse>> {
    let status = state.engine.cancel_search(user).await?;
    Ok(Json(CancelSearchResponse { status }))
}
