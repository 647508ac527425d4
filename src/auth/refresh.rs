// Token endpoint exchanges (refresh_token and authorization_code grants)

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;

use super::types::{OAuthClient, TokenData, TokenErrorResponse, TokenResponse};

/// Refresh an access token with the `refresh_token` grant
pub async fn refresh_access_token(
    client: &Client,
    oauth: &OAuthClient,
    refresh_token: &str,
) -> Result<TokenData> {
    tracing::debug!(
        "Refresh request: url={}, client_id={}...",
        oauth.token_url,
        oauth.client_id.chars().take(8).collect::<String>()
    );

    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", oauth.client_id.as_str()),
        ("client_secret", oauth.client_secret.as_str()),
        ("refresh_token", refresh_token),
    ];

    request_token(client, &oauth.token_url, &form).await
}

/// Exchange an authorization code for the first token pair
pub async fn exchange_authorization_code(
    client: &Client,
    oauth: &OAuthClient,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenData> {
    tracing::debug!("Exchanging authorization code at {}", oauth.token_url);

    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", oauth.client_id.as_str()),
        ("client_secret", oauth.client_secret.as_str()),
        ("redirect_uri", redirect_uri),
        ("code", code),
    ];

    request_token(client, &oauth.token_url, &form).await
}

async fn request_token(client: &Client, url: &str, form: &[(&str, &str)]) -> Result<TokenData> {
    let response = client
        .post(url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .context("Failed to send token request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!("Token request failed: status={}, body={}", status, error_text);

        if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&error_text) {
            tracing::error!(
                "OAuth error details: error={}, description={}",
                err.error,
                err.error_description.as_deref().unwrap_or("-")
            );
        }

        anyhow::bail!("Token endpoint returned {} - {}", status, error_text);
    }

    let data: TokenResponse = response
        .json()
        .await
        .context("Failed to parse token response")?;

    // Expiry is anchored to when the response arrived
    let received_at = Utc::now().timestamp_millis();

    let access_token = data
        .access_token
        .filter(|t| !t.is_empty())
        .context("Token response does not contain access_token")?;
    let expires_in = data
        .expires_in
        .context("Token response does not contain expires_in")?;
    if expires_in <= 0 {
        anyhow::bail!("Token response has non-positive expires_in: {}", expires_in);
    }

    let expires_at = received_at.saturating_add(expires_in.saturating_mul(1000));

    Ok(TokenData {
        access_token,
        refresh_token: data.refresh_token,
        expires_at,
    })
}
