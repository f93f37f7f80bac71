//! API error taxonomy and its HTTP mapping.
//!
//! Every handler returns `Result<_, ApiError>`; user-visible bodies are
//! always `{"detail": ...}` and never expose internals beyond the message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use weft::agent::RegistryError;
use weft::auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Not authenticated")]
    Unauthorized,
    #[error("Not authorized")]
    Forbidden,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_) | ApiError::ServiceUnavailable(_)) {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::NotAuthenticated | AuthError::InvalidCredentials => ApiError::Unauthorized,
            AuthError::NotAuthorized => ApiError::Forbidden,
            AuthError::SetupDone => ApiError::BadRequest("Setup already completed".into()),
            AuthError::Token(msg) => ApiError::Internal(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidId(_) | RegistryError::InvalidWebhookName(_) => {
                ApiError::Validation(e.to_string())
            }
            RegistryError::DuplicateWebhookName(_, _) => ApiError::Conflict(e.to_string()),
            RegistryError::NotFound(id) => ApiError::NotFound(format!("Agent {id} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
