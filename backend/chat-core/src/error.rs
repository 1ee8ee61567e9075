use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AppError {
    #[error("user is not an active participant of this chat")]
    NotAParticipant,

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("content rejected by moderation (flags: {flags:?})")]
    ContentRejected { flags: Vec<String> },

    #[error("chat not found")]
    ChatNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("concurrent update contention: {0}")]
    Contention(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::Permanent
        }
    }

    /// Returns whether the operation may succeed if attempted again unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Contention(_) | AppError::ServiceUnavailable(_)
        )
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidParticipants(_)
            | AppError::InvalidContent(_)
            | AppError::BadRequest(_) => 400,
            AppError::NotAParticipant | AppError::PermissionDenied(_) => 403,
            AppError::ChatNotFound | AppError::MessageNotFound => 404,
            AppError::Contention(_) => 409,
            AppError::ContentRejected { .. } => 422,
            AppError::ServiceUnavailable(_) => 503,
            AppError::Config(_) | AppError::Storage(_) => 500,
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::ServiceUnavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        match e.code() {
            Some(code)
                if *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::LOCK_NOT_AVAILABLE =>
            {
                AppError::Contention(e.to_string())
            }
            None if e.is_closed() => AppError::ServiceUnavailable(e.to_string()),
            _ => AppError::Storage(e.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::ServiceUnavailable(format!("get client: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotAParticipant.status_code(), 403);
        assert_eq!(AppError::ChatNotFound.status_code(), 404);
        assert_eq!(AppError::MessageNotFound.status_code(), 404);
        assert_eq!(
            AppError::ContentRejected {
                flags: vec!["profanity".into()]
            }
            .status_code(),
            422
        );
        assert_eq!(AppError::InvalidContent("empty".into()).status_code(), 400);
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(AppError::Contention("unread".into()).is_retryable());
        assert!(AppError::ServiceUnavailable("redis".into()).is_retryable());
        assert!(!AppError::NotAParticipant.is_retryable());
        assert_eq!(AppError::ChatNotFound.kind(), ErrorKind::Permanent);
    }
}
