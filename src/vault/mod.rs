//! Credential vault.
//!
//! Partner OAuth tokens encrypted at rest with ChaCha20-Poly1305. The key
//! material is an explicit constructor parameter (deterministic keys for
//! fixtures, two keys during rotation cutover). Refresh runs under the
//! provider-scoped advisory lock and re-reads the row after acquiring, so
//! two tasks noticing the same stale token produce one refresh.

mod cipher;
mod refresher;

pub use cipher::TokenCipher;
pub use refresher::{HttpTokenRefresher, RefreshError, RefreshedToken, TokenRefresher};

use crate::db::{Database, DbError};
use chrono::Utc;
use rusqlite::params;
use std::sync::Arc;
use tracing::{info, warn};

/// Refresh this long before expiry.
const DEFAULT_REFRESH_SKEW_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no credential stored for provider {0}")]
    NotFound(String),
    #[error("credential for {0} requires re-authorization")]
    CredentialExpired(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("refresh failed: {0}")]
    Refresh(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<VaultError> for crate::error::AppError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotFound(p) => crate::error::AppError::NotFound(format!("credential {p}")),
            VaultError::CredentialExpired(p) => crate::error::AppError::CredentialExpired(p),
            other => crate::error::AppError::Internal(other.to_string()),
        }
    }
}

/// A decrypted credential row.
#[derive(Debug, Clone)]
pub struct Credential {
    pub provider: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub scope: Option<String>,
    pub requires_reauth: bool,
}

pub struct CredentialVault {
    db: Arc<Database>,
    cipher: TokenCipher,
    refresher: Arc<dyn TokenRefresher>,
    refresh_skew_secs: i64,
}

impl CredentialVault {
    pub fn new(db: Arc<Database>, cipher: TokenCipher, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            db,
            cipher,
            refresher,
            refresh_skew_secs: DEFAULT_REFRESH_SKEW_SECS,
        }
    }

    pub fn with_refresh_skew(mut self, secs: i64) -> Self {
        self.refresh_skew_secs = secs;
        self
    }

    /// Bind (or rebind) a credential. Clears any `requires_reauth` flag —
    /// this is the operator's recovery path after a dead refresh token.
    pub fn store_credential(
        &self,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
        scope: Option<&str>,
    ) -> Result<(), VaultError> {
        let access_enc = self.cipher.seal(access_token)?;
        let refresh_enc = self.cipher.seal(refresh_token)?;
        self.db.exec(
            "INSERT INTO integration_credentials
                 (provider, access_token_enc, refresh_token_enc, expires_at, scope, requires_reauth, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
             ON CONFLICT(provider) DO UPDATE SET
                 access_token_enc = excluded.access_token_enc,
                 refresh_token_enc = excluded.refresh_token_enc,
                 expires_at = excluded.expires_at,
                 scope = excluded.scope,
                 requires_reauth = 0,
                 updated_at = excluded.updated_at",
            params![
                provider,
                access_enc,
                refresh_enc,
                expires_at,
                scope,
                Utc::now().timestamp()
            ],
        )?;
        info!(provider, "credential stored");
        Ok(())
    }

    fn read_credential(&self, provider: &str) -> Result<Credential, VaultError> {
        let row = self.db.query_one(
            "SELECT provider, access_token_enc, refresh_token_enc, expires_at, scope, requires_reauth
             FROM integration_credentials WHERE provider = ?1",
            params![provider],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)? != 0,
                ))
            },
        );

        let (provider, access_enc, refresh_enc, expires_at, scope, requires_reauth) = match row {
            Ok(r) => r,
            Err(DbError::NotFound) => return Err(VaultError::NotFound(provider.to_string())),
            Err(e) => return Err(e.into()),
        };

        Ok(Credential {
            access_token: self.cipher.open(&access_enc)?,
            refresh_token: self.cipher.open(&refresh_enc)?,
            provider,
            expires_at,
            scope,
            requires_reauth,
        })
    }

    /// Token freshness check without decrypting. `None` = no row.
    fn freshness(&self, provider: &str) -> Result<Option<(i64, bool)>, VaultError> {
        match self.db.query_one(
            "SELECT expires_at, requires_reauth FROM integration_credentials WHERE provider = ?1",
            params![provider],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0)),
        ) {
            Ok(pair) => Ok(Some(pair)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return a non-expired access token, refreshing proactively when the
    /// remaining lifetime drops below the skew.
    pub async fn ensure_valid_token(&self, provider: &str) -> Result<String, VaultError> {
        let now = Utc::now().timestamp();
        match self.freshness(provider)? {
            None => return Err(VaultError::NotFound(provider.to_string())),
            Some((_, true)) => return Err(VaultError::CredentialExpired(provider.to_string())),
            Some((expires_at, false)) if expires_at - now >= self.refresh_skew_secs => {
                return Ok(self.read_credential(provider)?.access_token);
            }
            Some(_) => {}
        }

        // Stale: refresh under the provider lock, re-reading after acquire
        // so a refresh that raced us is observed instead of repeated.
        let _guard = self.db.advisory_lock("credential_refresh", provider).await;

        let cred = self.read_credential(provider)?;
        if cred.requires_reauth {
            return Err(VaultError::CredentialExpired(provider.to_string()));
        }
        let now = Utc::now().timestamp();
        if cred.expires_at - now >= self.refresh_skew_secs {
            return Ok(cred.access_token);
        }

        match self.refresher.refresh(provider, &cred.refresh_token).await {
            Ok(refreshed) => {
                let access_enc = self.cipher.seal(&refreshed.access_token)?;
                let refresh_plain = refreshed
                    .refresh_token
                    .as_deref()
                    .unwrap_or(&cred.refresh_token);
                let refresh_enc = self.cipher.seal(refresh_plain)?;
                let expires_at = Utc::now().timestamp() + refreshed.expires_in_secs;

                // Tokens and expiry move together or not at all.
                self.db.transaction(|tx| {
                    tx.execute(
                        "UPDATE integration_credentials
                         SET access_token_enc = ?1, refresh_token_enc = ?2,
                             expires_at = ?3, updated_at = ?4
                         WHERE provider = ?5",
                        params![access_enc, refresh_enc, expires_at, Utc::now().timestamp(), provider],
                    )?;
                    Ok(())
                })?;

                info!(provider, expires_at, "token refreshed");
                metrics::counter!("vault_token_refreshes", 1);
                Ok(refreshed.access_token)
            }
            Err(RefreshError::AuthRejected(msg)) => {
                warn!(provider, "refresh token rejected: {msg}");
                self.db.exec(
                    "UPDATE integration_credentials SET requires_reauth = 1, updated_at = ?1
                     WHERE provider = ?2",
                    params![Utc::now().timestamp(), provider],
                )?;
                Err(VaultError::CredentialExpired(provider.to_string()))
            }
            Err(RefreshError::Transient(msg)) => Err(VaultError::Refresh(msg)),
        }
    }

    /// Force the cached token stale so the next call refreshes. Used by
    /// integration clients after a 401.
    pub fn invalidate(&self, provider: &str) -> Result<(), VaultError> {
        self.db.exec(
            "UPDATE integration_credentials SET expires_at = 0, updated_at = ?1 WHERE provider = ?2",
            params![Utc::now().timestamp(), provider],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct StubRefresher {
        calls: Mutex<u32>,
        outcome: fn(u32) -> Result<RefreshedToken, RefreshError>,
    }

    #[async_trait::async_trait]
    impl TokenRefresher for StubRefresher {
        async fn refresh(
            &self,
            _provider: &str,
            _refresh_token: &str,
        ) -> Result<RefreshedToken, RefreshError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            (self.outcome)(*calls)
        }
    }

    fn vault_with(
        outcome: fn(u32) -> Result<RefreshedToken, RefreshError>,
    ) -> (CredentialVault, Arc<StubRefresher>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let refresher = Arc::new(StubRefresher {
            calls: Mutex::new(0),
            outcome,
        });
        let cipher = TokenCipher::new([7u8; 32], None);
        (
            CredentialVault::new(db, cipher, refresher.clone()),
            refresher,
        )
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let (vault, refresher) = vault_with(|_| {
            Err(RefreshError::Transient("should not be called".into()))
        });
        vault
            .store_credential("ledgerbooks", "tok-a", "ref-a", Utc::now().timestamp() + 3600, None)
            .unwrap();

        let token = vault.ensure_valid_token("ledgerbooks").await.unwrap();
        assert_eq!(token, "tok-a");
        assert_eq!(*refresher.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_stale_token_triggers_refresh() {
        let (vault, refresher) = vault_with(|_| {
            Ok(RefreshedToken {
                access_token: "tok-new".to_string(),
                refresh_token: Some("ref-new".to_string()),
                expires_in_secs: 3600,
                scope: None,
            })
        });
        // Expires inside the skew window.
        vault
            .store_credential("ledgerbooks", "tok-old", "ref-old", Utc::now().timestamp() + 60, None)
            .unwrap();

        let token = vault.ensure_valid_token("ledgerbooks").await.unwrap();
        assert_eq!(token, "tok-new");
        assert_eq!(*refresher.calls.lock(), 1);

        // Second call sees the fresh row, no second refresh.
        let token = vault.ensure_valid_token("ledgerbooks").await.unwrap();
        assert_eq!(token, "tok-new");
        assert_eq!(*refresher.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_marks_requires_reauth() {
        let (vault, _) = vault_with(|_| Err(RefreshError::AuthRejected("invalid_grant".into())));
        vault
            .store_credential("cardops", "tok", "ref", Utc::now().timestamp() - 10, None)
            .unwrap();

        let err = vault.ensure_valid_token("cardops").await.unwrap_err();
        assert!(matches!(err, VaultError::CredentialExpired(_)));

        // Sticky until rebound.
        let err = vault.ensure_valid_token("cardops").await.unwrap_err();
        assert!(matches!(err, VaultError::CredentialExpired(_)));

        // Rebinding clears the flag.
        vault
            .store_credential("cardops", "tok2", "ref2", Utc::now().timestamp() + 3600, None)
            .unwrap();
        assert_eq!(vault.ensure_valid_token("cardops").await.unwrap(), "tok2");
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let (vault, _) = vault_with(|_| Err(RefreshError::Transient("n/a".into())));
        let err = vault.ensure_valid_token("nowhere").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (vault, refresher) = vault_with(|_| {
            Ok(RefreshedToken {
                access_token: "tok-after-401".to_string(),
                refresh_token: None,
                expires_in_secs: 3600,
                scope: None,
            })
        });
        vault
            .store_credential("crm", "tok-a", "ref-a", Utc::now().timestamp() + 3600, None)
            .unwrap();

        assert_eq!(vault.ensure_valid_token("crm").await.unwrap(), "tok-a");
        vault.invalidate("crm").unwrap();
        assert_eq!(
            vault.ensure_valid_token("crm").await.unwrap(),
            "tok-after-401"
        );
        assert_eq!(*refresher.calls.lock(), 1);
    }
}
