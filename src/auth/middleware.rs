//! Authentication middleware.
//!
//! Validates the bearer token and attaches `Claims` to request extensions.
//! Tokens arrive in the `Authorization` header or, for WebSocket upgrades,
//! as a `?token=` query parameter.

use crate::auth::jwt::JwtHandler;
use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Query-parameter token first (WebSocket handshake can't set headers).
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    let token_from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let token = token_from_query
        .or(token_from_header)
        .ok_or_else(|| AppError::Authentication("Missing authorization token".to_string()))?;

    let claims = jwt_handler
        .validate_token(&token)
        .map_err(|_| AppError::Authentication("Invalid or expired token".to_string()))?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::{Claims, Role};
    use axum::{body::Body, http::Request as HttpRequest};

    #[test]
    fn test_claims_extension_round_trip() {
        let mut req = HttpRequest::new(Body::empty());
        assert!(req.extensions().get::<Claims>().is_none());

        let claims = Claims {
            sub: "user-1".to_string(),
            role: Role::Manager,
            exp: 1234567890,
        };
        req.extensions_mut().insert(claims.clone());

        let extracted = req.extensions().get::<Claims>().unwrap();
        assert_eq!(extracted.sub, "user-1");
        assert_eq!(extracted.role, Role::Manager);
    }
}
