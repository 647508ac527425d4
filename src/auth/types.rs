// Authentication types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// External system whose API is protected by an OAuth credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum System {
    /// Contact CRM
    Crm,

    /// Calendar API used for class events
    Calendar,
}

impl System {
    pub const ALL: [System; 2] = [System::Crm, System::Calendar];

    pub fn as_str(&self) -> &'static str {
        match self {
            System::Crm => "crm",
            System::Calendar => "calendar",
        }
    }

    /// Prefix for per-system environment variables (e.g. `CRM_CLIENT_ID`)
    pub fn env_prefix(&self) -> &'static str {
        match self {
            System::Crm => "CRM",
            System::Calendar => "CALENDAR",
        }
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for System {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crm" => Ok(System::Crm),
            "calendar" => Ok(System::Calendar),
            other => Err(format!("Unknown integration: {}", other)),
        }
    }
}

/// Persisted credential for one external system
///
/// Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub updated_at: i64,
}

impl CredentialRecord {
    /// Whether the access token can still be used `margin_ms` from `now_ms`
    pub fn is_usable_at(&self, now_ms: i64, margin_ms: i64) -> bool {
        now_ms.saturating_add(margin_ms) < self.expires_at
    }

    /// Whether the access token is past its literal expiry
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Token data extracted from a successful token endpoint response
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

impl TokenData {
    /// Build the replacement record, keeping `previous_refresh` when the
    /// server did not rotate the refresh token.
    pub fn into_record(self, previous_refresh: &str, now_ms: i64) -> CredentialRecord {
        CredentialRecord {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| previous_refresh.to_string()),
            expires_at: self.expires_at,
            updated_at: now_ms,
        }
    }
}

/// OAuth client registration for one external system
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub authorize_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

/// Standard OAuth 2.0 token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// OAuth error body (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Failures of [`super::TokenManager::get_valid_access_token`]
#[derive(Error, Debug)]
pub enum TokenError {
    /// OAuth client settings are missing for this system
    #[error("{system} integration is not configured")]
    NotConfigured { system: System },

    /// No credential record exists yet
    #[error("{system} integration requires initial setup")]
    NotAuthorized { system: System },

    /// The refresh exchange failed; the stored record is untouched
    #[error("{system} token refresh failed: {source:#}")]
    RefreshFailed {
        system: System,
        #[source]
        source: anyhow::Error,
    },

    /// The authorization-code exchange failed; nothing was stored
    #[error("{system} authorization failed: {source:#}")]
    ExchangeFailed {
        system: System,
        #[source]
        source: anyhow::Error,
    },

    /// The credential store could not be read or written
    #[error("{system} credential store unavailable: {source:#}")]
    StoreUnavailable {
        system: System,
        #[source]
        source: anyhow::Error,
    },
}

impl TokenError {
    pub fn system(&self) -> System {
        match self {
            TokenError::NotConfigured { system }
            | TokenError::NotAuthorized { system }
            | TokenError::RefreshFailed { system, .. }
            | TokenError::ExchangeFailed { system, .. }
            | TokenError::StoreUnavailable { system, .. } => *system,
        }
    }
}
