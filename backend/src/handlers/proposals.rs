use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::error::ApiResult;
use super::AppState;
use crate::models::{Decision, ProposalId, ProposalStatus};

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub decision: Decision,
}

#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub proposal_id: ProposalId,
    pub status: ProposalStatus,
}

pub async fn respond_proposal(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(proposal_id): Path<ProposalId>,
    Json(req): Json<RespondRequest>,
) -> ApiResult<(StatusCode, Json<RespondResponse>)> {
    let outcome = state
        .engine
        .respond_proposal(user, proposal_id, req.decision)
        .await?;
    for released in outcome.requeued {
        state.engine.schedule_matching_pass(released);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(RespondResponse {
            proposal_id,
            status: outcome.status,
        }),
    ))
}
