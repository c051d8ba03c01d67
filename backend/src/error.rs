use thiserror::Error;

/// Errors surfaced by the matching engine.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("user is already searching")]
    AlreadySearching,

    #[error("user already holds an open proposal")]
    AlreadyProposed,

    #[error("user already has an active match of this type")]
    AlreadyMatched,

    #[error("user is not searching")]
    NotSearching,

    #[error("invalid proposal state: {0}")]
    InvalidProposalState(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not a participant")]
    Forbidden,

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("chat service unavailable: {0}")]
    ChatUnavailable(String),
}

/// Coarse classification used for propagation and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Forbidden,
    Dependency,
}

impl MatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchError::Validation(_) => ErrorKind::Validation,
            MatchError::AlreadySearching
            | MatchError::AlreadyProposed
            | MatchError::AlreadyMatched
            | MatchError::NotSearching
            | MatchError::InvalidProposalState(_) => ErrorKind::Conflict,
            MatchError::NotFound(_) => ErrorKind::NotFound,
            MatchError::Forbidden => ErrorKind::Forbidden,
            MatchError::StoreUnavailable(_) | MatchError::ChatUnavailable(_) => {
                ErrorKind::Dependency
            }
        }
    }

    /// Dependency failures may succeed on retry; everything else needs the
    /// caller's state to change first.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Dependency
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        MatchError::InvalidProposalState(msg.into())
    }
}

impl From<sqlx::Error> for MatchError {
    fn from(err: sqlx::Error) -> Self {
        MatchError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for MatchError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        MatchError::StoreUnavailable(err.to_string())
    }
}

pub type MatchResult<T> = std::result::Result<T, MatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_are_not_retryable() {
        assert_eq!(MatchError::AlreadyProposed.kind(), ErrorKind::Conflict);
        assert!(!MatchError::AlreadySearching.is_retryable());
        assert!(!MatchError::invalid_state("terminal").is_retryable());
    }

    #[test]
    fn test_dependency_failures_are_retryable() {
        let err = MatchError::StoreUnavailable("connection refused".into());
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert!(err.is_retryable());
        assert!(MatchError::ChatUnavailable("503".into()).is_retryable());
    }
}
