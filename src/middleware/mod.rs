// Admin authentication and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ApiError, Result};
use crate::routes::AppState;

/// Admin authentication middleware
///
/// Accepts "Authorization: Bearer {ADMIN_API_KEY}" or the bare key in x-api-key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if bearer == Some(state.admin_api_key.as_str()) || api_key == Some(state.admin_api_key.as_str())
    {
        return Ok(next.run(request).await);
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Admin access attempt with invalid or missing API key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );
    Err(ApiError::AuthError("Invalid or missing API Key".to_string()))
}

/// Create CORS middleware layer
///
/// The registration form is served from another origin, so any origin,
/// method, and header is allowed. Preflight requests are answered here.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
