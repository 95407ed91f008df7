//! Identity types attached to authenticated requests.

use serde::{Deserialize, Serialize};

/// Roles recognized by the backend. Tokens carry the role as a claim; the
/// identity provider owns the user ↔ role mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Ambassador,
    Affiliate,
    /// Anything the provider sends that we do not recognize. Carries no
    /// permissions anywhere.
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Ambassador => "ambassador",
            Role::Affiliate => "affiliate",
            Role::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "admin" => Role::Admin,
            "manager" => Role::Manager,
            "ambassador" => Role::Ambassador,
            "affiliate" => Role::Affiliate,
            _ => Role::Unknown,
        }
    }

    /// Admin and manager share the back-office surface.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

/// JWT claims attached to request extensions after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id (opaque, minted by the identity provider).
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

impl Claims {
    /// Role gate used by handlers; declared per route.
    pub fn require(&self, allowed: &[Role]) -> Result<(), crate::error::AppError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(crate::error::AppError::Authorization(format!(
                "role {} may not access this resource",
                self.role.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for r in [Role::Admin, Role::Manager, Role::Ambassador, Role::Affiliate] {
            assert_eq!(Role::from_str(r.as_str()), r);
        }
        assert_eq!(Role::from_str("janitor"), Role::Unknown);
    }

    #[test]
    fn test_require_gate() {
        let claims = Claims {
            sub: "u1".to_string(),
            role: Role::Ambassador,
            exp: 0,
        };
        assert!(claims.require(&[Role::Ambassador]).is_ok());
        assert!(claims.require(&[Role::Admin, Role::Manager]).is_err());
    }

    #[test]
    fn test_unknown_role_deserializes() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"u1","role":"superuser","exp":0}"#).unwrap();
        assert_eq!(claims.role, Role::Unknown);
    }
}
