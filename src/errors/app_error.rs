use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Control-plane errors returned by the session endpoints.
///
/// Every variant renders as `{error, message, code}` where `error` is the
/// stable machine-readable identifier and `code` repeats the HTTP status.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("x-api-key header is required")]
    MissingApiKey,

    #[error("The provided API key is not valid")]
    InvalidApiKey,

    #[error("{message}")]
    Validation { field: String, message: String },

    #[error("Session {0} was not found or has already been terminated")]
    SessionNotFound(String),

    #[error("session_token does not match the session")]
    InvalidSessionToken,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// Wire shape of every control-plane error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl AppError {
    /// Validation failure naming the offending field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Validation failure for a required field that is absent.
    pub fn missing_field(field: &str) -> Self {
        Self::validation(field, format!("{field} is required"))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::MissingApiKey => "MISSING_API_KEY",
            AppError::InvalidApiKey => "INVALID_API_KEY",
            AppError::Validation { .. } => "VALIDATION_ERROR",
            AppError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            AppError::InvalidSessionToken => "INVALID_SESSION_TOKEN",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingApiKey => StatusCode::FORBIDDEN,
            AppError::InvalidApiKey | AppError::InvalidSessionToken => StatusCode::UNAUTHORIZED,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let field = match self {
            AppError::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
            code: self.status_code().as_u16(),
            field,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(ref detail) = self {
            tracing::error!(error = %detail, "Control-plane request failed");
        }
        (self.status_code(), Json(self.to_body())).into_response()
    }
}
