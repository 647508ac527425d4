use anyhow::Context;
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::credentials::CredentialStore;
use super::refresh;
use super::types::{CredentialRecord, OAuthClient, System, TokenError};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-system OAuth client plus the lock that serializes its refreshes
struct Integration {
    oauth: OAuthClient,
    refresh_lock: Arc<Mutex<()>>,
}

/// Token manager
/// Hands out valid access tokens per system, refreshing on demand.
///
/// Refreshes are single-flight per system: callers that find an expiring
/// token queue on that system's lock and re-check the store once they hold
/// it, so a refresh finished by another caller is reused instead of repeated.
///
/// The exchange and the save run in a spawned task that owns the lock. A
/// caller dropped mid-refresh leaves the task running, so a rotated refresh
/// token is always persisted.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,

    /// Systems with OAuth client settings; anything absent is unconfigured
    integrations: HashMap<System, Integration>,

    /// HTTP client for token endpoint requests
    client: Client,

    /// Tokens are treated as expired this long before `expires_at`
    refresh_margin_ms: i64,

    /// Upper bound on one refresh exchange
    refresh_timeout: Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clients: HashMap<System, OAuthClient>,
        refresh_margin_secs: u64,
        refresh_timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(refresh_timeout_secs.max(1)))
            .build()
            .context("Failed to create HTTP client")?;

        let integrations = clients
            .into_iter()
            .map(|(system, oauth)| {
                (
                    system,
                    Integration {
                        oauth,
                        refresh_lock: Arc::new(Mutex::new(())),
                    },
                )
            })
            .collect();

        Ok(Self {
            store,
            integrations,
            client,
            refresh_margin_ms: i64::try_from(refresh_margin_secs)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000),
            refresh_timeout: Duration::from_secs(refresh_timeout_secs),
        })
    }

    pub fn is_configured(&self, system: System) -> bool {
        self.integrations.contains_key(&system)
    }

    pub fn oauth_client(&self, system: System) -> Option<&OAuthClient> {
        self.integrations.get(&system).map(|i| &i.oauth)
    }

    fn integration(&self, system: System) -> Result<&Integration, TokenError> {
        self.integrations
            .get(&system)
            .ok_or(TokenError::NotConfigured { system })
    }

    /// Current record for a system, without refreshing
    pub async fn load_record(&self, system: System) -> Result<Option<CredentialRecord>, TokenError> {
        self.store
            .load(system)
            .await
            .map_err(|source| TokenError::StoreUnavailable { system, source })
    }

    async fn load_authorized(&self, system: System) -> Result<CredentialRecord, TokenError> {
        self.load_record(system)
            .await?
            .ok_or(TokenError::NotAuthorized { system })
    }

    /// Get a valid access token for `system`, refreshing if necessary
    ///
    /// Never returns a token that is past its expiry. On refresh failure the
    /// stored record is left exactly as it was.
    pub async fn get_valid_access_token(&self, system: System) -> Result<String, TokenError> {
        let integration = self.integration(system)?;

        let record = self.load_authorized(system).await?;
        if record.is_usable_at(now_ms(), self.refresh_margin_ms) {
            return Ok(record.access_token);
        }

        let guard = integration.refresh_lock.clone().lock_owned().await;

        // Another caller may have refreshed while we waited for the lock
        let record = self.load_authorized(system).await?;
        if record.is_usable_at(now_ms(), self.refresh_margin_ms) {
            tracing::debug!("Using {} token refreshed by a concurrent request", system);
            return Ok(record.access_token);
        }

        let store = self.store.clone();
        let client = self.client.clone();
        let oauth = integration.oauth.clone();
        let refresh_timeout = self.refresh_timeout;

        let task = tokio::spawn(async move {
            let _guard = guard;
            refresh_and_save(store, client, oauth, system, record, refresh_timeout).await
        });

        let updated = task.await.map_err(|e| TokenError::RefreshFailed {
            system,
            source: anyhow::Error::new(e).context("Refresh task failed"),
        })??;

        Ok(updated.access_token)
    }

    /// Store the first credential for `system` from an authorization code
    ///
    /// Runs under the system's refresh lock so it cannot interleave with a
    /// refresh of the record it replaces.
    pub async fn complete_authorization(
        &self,
        system: System,
        code: &str,
        redirect_uri: &str,
    ) -> Result<CredentialRecord, TokenError> {
        let integration = self.integration(system)?;
        let guard = integration.refresh_lock.clone().lock_owned().await;

        let store = self.store.clone();
        let client = self.client.clone();
        let oauth = integration.oauth.clone();
        let code = code.to_string();
        let redirect_uri = redirect_uri.to_string();
        let exchange_timeout = self.refresh_timeout;

        let task = tokio::spawn(async move {
            let _guard = guard;

            let exchange = async {
                let data =
                    refresh::exchange_authorization_code(&client, &oauth, &code, &redirect_uri)
                        .await?;
                let refresh_token = data
                    .refresh_token
                    .clone()
                    .filter(|t| !t.is_empty())
                    .context("Authorization response does not contain refresh_token")?;
                Ok::<_, anyhow::Error>(data.into_record(&refresh_token, now_ms()))
            };

            let record = match tokio::time::timeout(exchange_timeout, exchange).await {
                Ok(Ok(record)) => record,
                Ok(Err(source)) => {
                    tracing::error!("{} authorization exchange failed: {:#}", system, source);
                    return Err(TokenError::ExchangeFailed { system, source });
                }
                Err(_) => {
                    return Err(TokenError::ExchangeFailed {
                        system,
                        source: anyhow::anyhow!(
                            "Authorization exchange timed out after {}s",
                            exchange_timeout.as_secs()
                        ),
                    });
                }
            };

            store
                .save(system, &record)
                .await
                .map_err(|source| TokenError::StoreUnavailable { system, source })?;

            tracing::info!("✅ {} integration connected", system);
            Ok(record)
        });

        task.await.map_err(|e| TokenError::ExchangeFailed {
            system,
            source: anyhow::Error::new(e).context("Authorization task failed"),
        })?
    }
}

/// Exchange `current.refresh_token` and persist the replacement record
///
/// The save happens only with a complete record; any failure before it
/// leaves the store untouched.
async fn refresh_and_save(
    store: Arc<dyn CredentialStore>,
    client: Client,
    oauth: OAuthClient,
    system: System,
    current: CredentialRecord,
    refresh_timeout: Duration,
) -> Result<CredentialRecord, TokenError> {
    tracing::info!("Refreshing {} access token...", system);

    let data = match tokio::time::timeout(
        refresh_timeout,
        refresh::refresh_access_token(&client, &oauth, &current.refresh_token),
    )
    .await
    {
        Ok(Ok(data)) => data,
        Ok(Err(source)) => {
            tracing::error!("{} token refresh failed: {:#}", system, source);
            return Err(TokenError::RefreshFailed { system, source });
        }
        Err(_) => {
            tracing::error!(
                "{} token refresh timed out after {}s",
                system,
                refresh_timeout.as_secs()
            );
            return Err(TokenError::RefreshFailed {
                system,
                source: anyhow::anyhow!(
                    "Refresh request timed out after {}s",
                    refresh_timeout.as_secs()
                ),
            });
        }
    };

    let updated = data.into_record(&current.refresh_token, now_ms());
    store.save(system, &updated).await.map_err(|source| {
        tracing::error!("{} refreshed token could not be saved: {:#}", system, source);
        TokenError::StoreUnavailable { system, source }
    })?;

    tracing::info!(
        "{} token refreshed, expires: {}",
        system,
        chrono::DateTime::from_timestamp_millis(updated.expires_at)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    );

    Ok(updated)
}
