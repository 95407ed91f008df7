//! Authentication: bearer-token validation and role identity.
//!
//! The identity provider is an external collaborator; this module only
//! verifies its tokens and hands `{userId, role}` to the rest of the app.

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::auth_middleware;
pub use models::{Claims, Role};
