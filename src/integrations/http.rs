//! Shared HTTP plumbing for partner adapters.
//!
//! Every outbound call: fresh token from the vault, one immediate re-fetch
//! and replay on a 401, then classified errors for everything else. Backoff
//! policy lives with the caller (`retry::with_retry`), not here.

use crate::retry::{ClassifiedError, ErrorCategory};
use crate::vault::CredentialVault;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct PartnerHttp {
    client: reqwest::Client,
    base_url: String,
    provider: String,
    vault: Arc<CredentialVault>,
    request_timeout: Duration,
}

impl PartnerHttp {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        provider: impl Into<String>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            provider: provider.into(),
            vault,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value, ClassifiedError> {
        self.send(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ClassifiedError> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, ClassifiedError> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ClassifiedError> {
        self.send(Method::DELETE, path, &[], None).await
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, ClassifiedError> {
        let token = self
            .vault
            .ensure_valid_token(&self.provider)
            .await
            .map_err(|e| match e {
                crate::vault::VaultError::CredentialExpired(p) => ClassifiedError::new(
                    ErrorCategory::Authentication,
                    format!("credential for {p} requires re-authorization"),
                ),
                other => ClassifiedError::new(ErrorCategory::Unknown, other.to_string()),
            })?;

        match self
            .execute(method.clone(), path, query, body, &token)
            .await
        {
            Err(err) if err.status_code == Some(401) => {
                // Cached token may have been revoked out from under us:
                // invalidate, re-fetch, replay exactly once.
                debug!(provider = %self.provider, "401 from partner, re-fetching token");
                self.vault
                    .invalidate(&self.provider)
                    .map_err(|e| ClassifiedError::new(ErrorCategory::Unknown, e.to_string()))?;
                let token = self
                    .vault
                    .ensure_valid_token(&self.provider)
                    .await
                    .map_err(|e| {
                        ClassifiedError::new(ErrorCategory::Authentication, e.to_string())
                    })?;
                self.execute(method, path, query, body, &token).await
            }
            other => other,
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        token: &str,
    ) -> Result<Value, ClassifiedError> {
        let mut req = self
            .client
            .request(method.clone(), self.url(path))
            .timeout(self.request_timeout)
            .bearer_auth(token)
            .header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            let category = if e.is_timeout() || e.is_connect() {
                ErrorCategory::Network
            } else {
                ErrorCategory::Unknown
            };
            ClassifiedError::new(category, format!("{} {} failed: {e}", method, path))
        })?;

        let status = resp.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return resp.json::<Value>().await.map_err(|e| {
                ClassifiedError::new(
                    ErrorCategory::Unknown,
                    format!("{} {} returned unparseable body: {e}", method, path),
                )
            });
        }

        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = resp.text().await.unwrap_or_default();

        let mut err = ClassifiedError::from_message(format!(
            "{} {} returned {}: {}",
            method,
            path,
            status.as_u16(),
            text
        ))
        .with_status(status.as_u16());
        err.retry_after_secs = retry_after;
        Err(err)
    }
}
