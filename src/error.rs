// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::TokenError;

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Admin authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Credential lifecycle failure for an integration
    #[error(transparent)]
    Integration(#[from] TokenError),

    /// Error response from a protected integration API
    #[error("{system} API error: {status} - {message}")]
    Upstream {
        system: String,
        status: u16,
        message: String,
    },

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Short category used in the error body
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::AuthError(_) => "auth_error",
            ApiError::ValidationError(_) => "validation_error",
            ApiError::Integration(TokenError::NotConfigured { .. })
            | ApiError::Integration(TokenError::NotAuthorized { .. }) => {
                "integration_not_connected"
            }
            ApiError::Integration(TokenError::RefreshFailed { .. })
            | ApiError::Integration(TokenError::ExchangeFailed { .. }) => {
                "integration_auth_failed"
            }
            ApiError::Integration(TokenError::StoreUnavailable { .. }) => {
                "credential_store_unavailable"
            }
            ApiError::Upstream { .. } => "upstream_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthError(_) => StatusCode::UNAUTHORIZED,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Integration(TokenError::NotConfigured { .. })
            | ApiError::Integration(TokenError::NotAuthorized { .. })
            | ApiError::Integration(TokenError::StoreUnavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Integration(TokenError::RefreshFailed { .. })
            | ApiError::Integration(TokenError::ExchangeFailed { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            ApiError::Integration(err) => {
                tracing::error!("Integration error: {}", err);
                match err {
                    // Upstream detail stays in the logs
                    TokenError::RefreshFailed { system, .. } => {
                        format!("{} integration could not refresh its credentials", system)
                    }
                    TokenError::ExchangeFailed { system, .. } => {
                        format!("{} authorization could not be completed", system)
                    }
                    TokenError::StoreUnavailable { system, .. } => {
                        format!("{} credentials are temporarily unavailable", system)
                    }
                    other => other.to_string(),
                }
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
