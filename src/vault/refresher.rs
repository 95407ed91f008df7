//! Token refresh against partner OAuth endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token itself was rejected; re-auth by an operator is the
    /// only way out.
    #[error("refresh rejected: {0}")]
    AuthRejected(String),
    #[error("refresh failed: {0}")]
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Some providers rotate the refresh token on every use.
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
    pub scope: Option<String>,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

/// Standard `refresh_token` grant over HTTP, one token URL per provider.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    token_urls: HashMap<String, String>,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client, token_urls: HashMap<String, String>) -> Self {
        Self { client, token_urls }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError> {
        let url = self
            .token_urls
            .get(provider)
            .ok_or_else(|| RefreshError::Transient(format!("no token url for {provider}")))?;

        let resp = self
            .client
            .post(url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("token endpoint unreachable: {e}")))?;

        let status = resp.status();
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::AuthRejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::Transient(format!("{status}: {body}")));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RefreshError::Transient(format!("bad token response: {e}")))?;

        debug!(provider, "token endpoint returned new access token");

        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in_secs: token.expires_in.unwrap_or(3600),
            scope: token.scope,
        })
    }
}
