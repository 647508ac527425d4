use axum::{
    extract::{Path, Query, State},
    middleware::{self as axum_middleware},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{OAuthStateStore, System, TokenError, TokenManager};
use crate::error::{ApiError, Result};
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub admin_api_key: String,
    pub tokens: Arc<TokenManager>,
    pub oauth_states: OAuthStateStore,
}

/// Full application: routes, CORS and request tracing
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(admin_routes(state.clone()))
        .merge(oauth_routes(state))
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Integration management routes (require the admin API key)
pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/admin/integrations", get(list_integrations_handler))
        .route(
            "/admin/integrations/:system/connect",
            get(connect_handler),
        )
        .route(
            "/admin/integrations/:system/token/refresh-check",
            post(refresh_check_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// OAuth redirect target (public; protected by the single-use state token)
pub fn oauth_routes(state: AppState) -> Router {
    Router::new()
        .route("/oauth/:system/callback", get(oauth_callback_handler))
        .with_state(state)
}

fn parse_system(raw: &str) -> Result<System> {
    raw.parse::<System>().map_err(ApiError::ValidationError)
}

fn format_millis(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339())
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Signup Gateway is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /admin/integrations - Connection status of every integration
///
/// Never includes token values.
async fn list_integrations_handler(State(state): State<AppState>) -> Result<Json<Value>> {
    let now = Utc::now().timestamp_millis();
    let mut integrations = Vec::with_capacity(System::ALL.len());

    for system in System::ALL {
        let record = state.tokens.load_record(system).await?;
        integrations.push(json!({
            "system": system,
            "configured": state.tokens.is_configured(system),
            "connected": record.is_some(),
            "expires_at": record.as_ref().and_then(|r| format_millis(r.expires_at)),
            "updated_at": record.as_ref().and_then(|r| format_millis(r.updated_at)),
            "expired": record.as_ref().map(|r| r.is_expired_at(now)),
        }));
    }

    Ok(Json(json!({ "integrations": integrations })))
}

/// GET /admin/integrations/:system/connect - Start the authorization-code flow
///
/// Returns the provider URL the operator opens to grant access.
async fn connect_handler(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<Json<Value>> {
    let system = parse_system(&system)?;
    let oauth = state
        .tokens
        .oauth_client(system)
        .ok_or(TokenError::NotConfigured { system })?;
    let redirect_uri = oauth.redirect_uri.as_deref().ok_or_else(|| {
        ApiError::ValidationError(format!(
            "{}_REDIRECT_URI is not configured",
            system.env_prefix()
        ))
    })?;

    let oauth_state = state.oauth_states.issue(system);
    let scope = oauth.scopes.join(" ");
    let authorize_url = reqwest::Url::parse_with_params(
        &oauth.authorize_url,
        &[
            ("response_type", "code"),
            ("client_id", oauth.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", oauth_state.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("Invalid authorize URL: {}", e)))?;

    tracing::info!("Issued {} authorization URL", system);

    Ok(Json(json!({
        "system": system,
        "authorize_url": authorize_url.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /oauth/:system/callback - Finish the authorization-code flow
async fn oauth_callback_handler(
    State(state): State<AppState>,
    Path(system): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>> {
    let system = parse_system(&system)?;

    if let Some(error) = params.error {
        tracing::warn!("{} authorization denied: {}", system, error);
        return Err(ApiError::ValidationError(format!(
            "Authorization denied: {}{}",
            error,
            params
                .error_description
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        )));
    }

    let oauth_state = params
        .state
        .ok_or_else(|| ApiError::ValidationError("Missing state parameter".to_string()))?;
    if !state.oauth_states.consume(&oauth_state, system) {
        return Err(ApiError::ValidationError(
            "Invalid or expired state parameter".to_string(),
        ));
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::ValidationError("Missing code parameter".to_string()))?;

    let redirect_uri = state
        .tokens
        .oauth_client(system)
        .ok_or(TokenError::NotConfigured { system })?
        .redirect_uri
        .clone()
        .ok_or_else(|| {
            ApiError::ValidationError(format!(
                "{}_REDIRECT_URI is not configured",
                system.env_prefix()
            ))
        })?;

    let record = state
        .tokens
        .complete_authorization(system, &code, &redirect_uri)
        .await?;

    Ok(Json(json!({
        "system": system,
        "connected": true,
        "expires_at": format_millis(record.expires_at),
    })))
}

/// POST /admin/integrations/:system/token/refresh-check
///
/// Obtains a valid token (refreshing if due) and reports its expiry.
async fn refresh_check_handler(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<Json<Value>> {
    let system = parse_system(&system)?;

    state.tokens.get_valid_access_token(system).await?;
    let expires_at = state
        .tokens
        .load_record(system)
        .await?
        .and_then(|r| format_millis(r.expires_at));

    Ok(Json(json!({
        "system": system,
        "valid": true,
        "expires_at": expires_at,
    })))
}
