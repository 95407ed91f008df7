//! JWT validation against the identity provider's shared secret.

use crate::auth::models::{Claims, Role};
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Validate a bearer token and extract claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        debug!("validated token for user {}", decoded.claims.sub);

        Ok(decoded.claims)
    }

    /// Mint a token. The identity provider does this in production; kept
    /// here for fixtures and local development.
    pub fn issue_token(&self, user_id: &str, role: Role, hours: i64) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(hours))
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to encode token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let token = handler.issue_token("user-1", Role::Manager, 24).unwrap();

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, Role::Manager);
        assert!(claims.exp > Utc::now().timestamp() as usize);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let issuer = JwtHandler::new("secret1".to_string());
        let verifier = JwtHandler::new("secret2".to_string());

        let token = issuer.issue_token("user-1", Role::Admin, 1).unwrap();
        assert!(verifier.validate_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let token = handler.issue_token("user-1", Role::Admin, -1).unwrap();
        assert!(handler.validate_token(&token).is_err());
    }
}
