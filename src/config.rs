use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::auth::{OAuthClient, System, MAX_STATE_TTL_SECS};

/// Largest accepted refresh margin; must stay well under provider token
/// lifetimes (30 minutes for the CRM) or every call would refresh
pub const MAX_REFRESH_MARGIN_SECS: u64 = 15 * 60;

/// Signup Gateway - OAuth credential service for CRM and calendar integrations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// API key protecting the admin endpoints
    #[arg(short = 'k', long, env = "ADMIN_API_KEY")]
    pub api_key: Option<String>,

    /// Path to the credentials SQLite database (":memory:" for a throwaway store)
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Seconds before expiry at which a token is refreshed
    #[arg(long, env = "TOKEN_REFRESH_MARGIN", default_value = "60")]
    pub refresh_margin: u64,

    /// Timeout for one token endpoint exchange in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "15")]
    pub refresh_timeout: u64,

    /// Outbound API request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Outbound API max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,
}

/// OAuth settings for one system, resolved once at startup
#[derive(Clone, Debug)]
pub enum IntegrationConfig {
    Configured(OAuthClient),
    Unconfigured { missing: Vec<String> },
}

impl IntegrationConfig {
    /// Resolve `<PREFIX>_*` settings through `lookup` (normally the process env)
    pub fn from_lookup<F>(system: System, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = system.env_prefix();
        let get = |name: &str| {
            lookup(&format!("{}_{}", prefix, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let client_id = get("CLIENT_ID");
        let client_secret = get("CLIENT_SECRET");

        let (client_id, client_secret) = match (client_id, client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            (id, secret) => {
                let mut missing = Vec::new();
                if id.is_none() {
                    missing.push(format!("{}_CLIENT_ID", prefix));
                }
                if secret.is_none() {
                    missing.push(format!("{}_CLIENT_SECRET", prefix));
                }
                return IntegrationConfig::Unconfigured { missing };
            }
        };

        let (default_token_url, default_authorize_url) = default_endpoints(system);

        IntegrationConfig::Configured(OAuthClient {
            client_id,
            client_secret,
            token_url: get("TOKEN_URL").unwrap_or_else(|| default_token_url.to_string()),
            authorize_url: get("AUTHORIZE_URL")
                .unwrap_or_else(|| default_authorize_url.to_string()),
            redirect_uri: get("REDIRECT_URI"),
            scopes: get("SCOPES").map(|s| parse_scopes(&s)).unwrap_or_default(),
        })
    }

    pub fn oauth_client(&self) -> Option<&OAuthClient> {
        match self {
            IntegrationConfig::Configured(client) => Some(client),
            IntegrationConfig::Unconfigured { .. } => None,
        }
    }
}

/// Token and authorize endpoints used when none are configured
fn default_endpoints(system: System) -> (&'static str, &'static str) {
    match system {
        System::Crm => (
            "https://api.hubapi.com/oauth/v1/token",
            "https://app.hubspot.com/oauth/authorize",
        ),
        System::Calendar => (
            "https://oauth2.googleapis.com/token",
            "https://accounts.google.com/o/oauth2/v2/auth",
        ),
    }
}

/// Split a scope list on whitespace or commas
fn parse_scopes(s: &str) -> Vec<String> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub admin_api_key: String,

    // Credential storage
    pub credentials_db_file: PathBuf,

    // Token lifecycle
    pub token_refresh_margin: u64,
    pub token_refresh_timeout: u64,
    pub oauth_state_ttl: u64,

    // Outbound HTTP client
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    // Integrations
    pub integrations: HashMap<System, IntegrationConfig>,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        let integrations = System::ALL
            .iter()
            .map(|&system| {
                (
                    system,
                    IntegrationConfig::from_lookup(system, |key| std::env::var(key).ok()),
                )
            })
            .collect();

        let config = Config {
            server_host: args.host,
            server_port: args.port,

            admin_api_key: args
                .api_key
                .context("ADMIN_API_KEY is required (use -k or set ADMIN_API_KEY env var)")?,

            credentials_db_file: args.db_file.map(|s| expand_tilde(&s)).context(
                "CREDENTIALS_DB_FILE is required (use -d or set CREDENTIALS_DB_FILE env var)",
            )?,

            token_refresh_margin: args.refresh_margin,
            token_refresh_timeout: args.refresh_timeout,

            oauth_state_ttl: std::env::var("OAUTH_STATE_TTL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(600),

            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),

            integrations,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.admin_api_key.trim().is_empty() {
            anyhow::bail!("ADMIN_API_KEY cannot be empty");
        }

        if self.token_refresh_timeout == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }

        if self.token_refresh_margin > MAX_REFRESH_MARGIN_SECS {
            anyhow::bail!(
                "TOKEN_REFRESH_MARGIN must be at most {} seconds",
                MAX_REFRESH_MARGIN_SECS
            );
        }

        if self.oauth_state_ttl == 0 || self.oauth_state_ttl > MAX_STATE_TTL_SECS {
            anyhow::bail!(
                "OAUTH_STATE_TTL must be between 1 and {} seconds",
                MAX_STATE_TTL_SECS
            );
        }

        for (system, integration) in &self.integrations {
            if let IntegrationConfig::Unconfigured { missing } = integration {
                tracing::warn!(
                    "{} integration disabled, missing: {}",
                    system,
                    missing.join(", ")
                );
            }
        }

        Ok(())
    }

    /// OAuth clients of every configured system
    pub fn oauth_clients(&self) -> HashMap<System, OAuthClient> {
        self.integrations
            .iter()
            .filter_map(|(system, integration)| {
                integration
                    .oauth_client()
                    .map(|client| (*system, client.clone()))
            })
            .collect()
    }

    /// Whether credentials live only in memory
    pub fn is_in_memory_store(&self) -> bool {
        self.credentials_db_file.as_os_str() == ":memory:"
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
