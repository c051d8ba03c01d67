use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use super::auth::AuthUser;
use super::error::ApiResult;
use super::AppState;
use crate::engine::MatchView;
use crate::models::{MatchId, MatchStatus};

#[derive(Debug, Serialize)]
pub struct MatchStatusResponse {
    pub match_id: MatchId,
    pub status: MatchStatus,
}

pub async fn get_match(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(match_id): Path<MatchId>,
) -> ApiResult<Json<MatchView>> {
    Ok(Json(state.engine.match_view(user, match_id).await?))
}

pub async fn request_reveal(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(match_id): Path<MatchId>,
) -> ApiResult<Json<MatchStatusResponse>> {
    let status = state.engine.request_reveal(user, match_id).await?;
    Ok(Json(MatchStatusResponse { match_id, status }))
}

pub async fn end_match(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(match_id): Path<MatchId>,
) -> ApiResult<Json<MatchStatusResponse>> {
    state.engine.end_match(user, match_id).await?;
    Ok(Json(MatchStatusResponse {
        match_id,
        status: MatchStatus::Ended,
    }))
}

/// Chat-service webhook: one more message was exchanged in the match.
pub async fn record_message(
    State(state): State<AppState>,
    Path(match_id): Path<MatchId>,
) -> ApiResult<Json<MatchStatusResponse>> {
    let status = state.engine.record_message(match_id).await?;
    Ok(Json(MatchStatusResponse { match_id, status }))
}
