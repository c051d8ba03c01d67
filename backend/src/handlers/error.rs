use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{ErrorKind, MatchError};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    Engine(MatchError),
    Unauthorized(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Engine(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                ErrorKind::Dependency => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::Unauthorized(message) => ErrorBody {
                code: "UNAUTHORIZED",
                message: message.clone(),
                retryable: false,
            },
            ApiError::Engine(e) => ErrorBody {
                code: error_code(e),
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }
}

/// Stable machine-readable code for each engine error.
pub fn error_code(err: &MatchError) -> &'static str {
    match err {
        MatchError::Validation(_) => "VALIDATION",
        MatchError::AlreadySearching => "ALREADY_SEARCHING",
        MatchError::AlreadyProposed => "ALREADY_PROPOSED",
        MatchError::AlreadyMatched => "ALREADY_MATCHED",
        MatchError::NotSearching => "NOT_SEARCHING",
        MatchError::InvalidProposalState(_) => "INVALID_PROPOSAL_STATE",
        MatchError::NotFound(_) => "NOT_FOUND",
        MatchError::Forbidden => "FORBIDDEN",
        MatchError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        MatchError::ChatUnavailable(_) => "CHAT_UNAVAILABLE",
    }
}

impl From<MatchError> for ApiError {
    fn from(err: MatchError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!("request failed: {:?}", self);
        }
        (status, Json(serde_json::json!({ "error": self.body() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
