use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{System, TokenManager};
use crate::error::ApiError;

/// HTTP client for the protected CRM and calendar APIs
///
/// Every attempt asks the token manager for a token, so a retry after a
/// refresh window always carries the current credential.
///
/// The gateway binary only manages credentials and never builds one of
/// these. It is library API for embedding consumers (the registration
/// backend) that share a [`TokenManager`] with the gateway's store.
pub struct IntegrationClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    tokens: Arc<TokenManager>,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl IntegrationClient {
    pub fn new(tokens: Arc<TokenManager>, request_timeout: u64, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            tokens,
            max_retries,
            base_delay_ms: 500,
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Underlying client for building requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send a request to `system` with a bearer token attached
    ///
    /// - 429 / 5xx / network errors: exponential backoff up to `max_retries`
    /// - other non-success statuses: returned as [`ApiError::Upstream`]
    pub async fn send(&self, system: System, request: RequestBuilder) -> Result<Response, ApiError> {
        let request = request
            .build()
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("Invalid {} request: {}", system, e)))?;
        let method = request.method().clone();
        let url = request.url().clone();
        let mut attempt = 0;

        tracing::debug!(system = %system, method = %method, url = %url, "Sending integration request");

        loop {
            let mut req = request.try_clone().ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            let token = self.tokens.get_valid_access_token(system).await?;
            let header = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Access token is not a valid header value")?;
            req.headers_mut().insert(AUTHORIZATION, header);

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "{} returned {}, retrying after {}ms (attempt {}/{})",
                            system,
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let message = response.text().await.unwrap_or_default();
                    tracing::error!(
                        system = %system,
                        status = status.as_u16(),
                        url = %url,
                        response_body = %message,
                        attempt = attempt + 1,
                        "Integration request failed"
                    );
                    return Err(ApiError::Upstream {
                        system: system.to_string(),
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else {
                        "request_error"
                    };

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            "{} request failed, retrying after {}ms (attempt {}/{})",
                            system,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "Integration request failed after all retries"
                    );
                    return Err(ApiError::Internal(anyhow::anyhow!(
                        "{} request failed: {} (kind: {})",
                        system,
                        e,
                        error_kind
                    )));
                }
            }
        }
    }

    /// Exponential backoff with up to 10% jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * jitter_fraction()) as u64;
        delay + jitter
    }
}

/// Pseudo-random value in [0, 1) from a randomly seeded hasher
fn jitter_fraction() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    (RandomState::new().hash_one(std::time::SystemTime::now()) % 1000) as f64 / 1000.0
}
