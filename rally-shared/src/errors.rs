use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::clients::data::DataError;
use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{area}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/infrastructure errors
/// - E1xxx: Auth errors
/// - E3xxx: Matching errors (discovery, swipes, matches, proposals)
/// - E4xxx: Messaging errors
/// - E5xxx: Notification errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    BadRequest,
    ServiceUnavailable,
    Conflict,

    // Auth (E1xxx)
    TokenExpired,
    TokenInvalid,

    // Matching (E3xxx)
    ProfileNotFound,
    CannotSwipeSelf,
    AlreadySwiped,
    MatchNotFound,
    NotMatchParticipant,
    ProposalNotFound,
    InvalidProposalTransition,
    ProposalConflict,
    ProposalInPast,

    // Messaging (E4xxx)
    MessageNotFound,
    EmptyMessage,
    MessageTooLong,

    // Notification (E5xxx)
    NotificationNotFound,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            // Shared
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",
            Self::Unauthorized => "E0004",
            Self::Forbidden => "E0005",
            Self::BadRequest => "E0006",
            Self::ServiceUnavailable => "E0007",
            Self::Conflict => "E0008",

            // Auth
            Self::TokenExpired => "E1001",
            Self::TokenInvalid => "E1002",

            // Matching
            Self::ProfileNotFound => "E3001",
            Self::CannotSwipeSelf => "E3002",
            Self::AlreadySwiped => "E3003",
            Self::MatchNotFound => "E3004",
            Self::NotMatchParticipant => "E3005",
            Self::ProposalNotFound => "E3006",
            Self::InvalidProposalTransition => "E3007",
            Self::ProposalConflict => "E3008",
            Self::ProposalInPast => "E3009",

            // Messaging
            Self::MessageNotFound => "E4001",
            Self::EmptyMessage => "E4002",
            Self::MessageTooLong => "E4003",

            // Notification
            Self::NotificationNotFound => "E5001",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::BAD_GATEWAY,
            Self::ValidationError | Self::BadRequest | Self::CannotSwipeSelf
            | Self::EmptyMessage | Self::MessageTooLong | Self::ProposalInPast => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::ProfileNotFound | Self::MatchNotFound
            | Self::ProposalNotFound | Self::MessageNotFound
            | Self::NotificationNotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::TokenExpired | Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::NotMatchParticipant => StatusCode::FORBIDDEN,
            Self::Conflict | Self::AlreadySwiped | Self::ProposalConflict => StatusCode::CONFLICT,
            Self::InvalidProposalTransition => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),

    #[error("data service error: {0}")]
    Data(#[from] DataError),

    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The error code this error renders as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::Known { code, .. } => *code,
            AppError::Internal(_) => ErrorCode::InternalError,
            AppError::Data(DataError::UniqueViolation { .. }) => ErrorCode::Conflict,
            AppError::Data(_) => ErrorCode::ServiceUnavailable,
            AppError::Validation(_) => ErrorCode::ValidationError,
        }
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.error_code() == code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Known { code, message, details } => {
                let status = code.status_code();
                let mut resp = ApiErrorResponse::new(code.code(), message);
                if let Some(d) = details {
                    resp = resp.with_details(d.clone());
                }
                (status, resp)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new("E0001", "internal error"),
                )
            }
            AppError::Data(err) => {
                tracing::error!(error = %err, "data service error");
                match err {
                    DataError::UniqueViolation { .. } => (
                        StatusCode::CONFLICT,
                        ApiErrorResponse::new("E0008", "resource already exists"),
                    ),
                    _ => (
                        StatusCode::BAD_GATEWAY,
                        ApiErrorResponse::new("E0007", "data service unavailable"),
                    ),
                }
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new("E0002", msg),
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Logs a failed call at the point it happened, then converts it into [`AppError`].
pub trait LogErr<T> {
    fn log_err(self, operation: &'static str) -> AppResult<T>;
}

impl<T, E> LogErr<T> for Result<T, E>
where
    E: Into<AppError> + std::fmt::Display,
{
    fn log_err(self, operation: &'static str) -> AppResult<T> {
        self.map_err(|e| {
            tracing::error!(operation, error = %e, "remote call failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_renders_as_conflict() {
        let err = AppError::from(DataError::UniqueViolation {
            table: "matches".into(),
            message: "duplicate key".into(),
        });
        assert!(err.is(ErrorCode::Conflict));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn transport_failure_renders_as_bad_gateway() {
        let err = AppError::from(DataError::Transport("connection refused".into()));
        assert_eq!(err.error_code(), ErrorCode::ServiceUnavailable);
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn known_codes_keep_their_status() {
        let err = AppError::new(ErrorCode::AlreadySwiped, "already swiped");
        assert_eq!(err.error_code().code(), "E3003");
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
