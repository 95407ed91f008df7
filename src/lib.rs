//! FieldOps backend library.
//!
//! Control plane for a field-marketing operation: event scheduling,
//! ambassador dispatch, sign-up intake with bet-slip extraction, partner
//! CRM/accounting sync, KPI alerting, bulk imports, and payroll.

pub mod api;
pub mod auth;
pub mod bus;
pub mod db;
pub mod error;
pub mod events;
pub mod financial;
pub mod import;
pub mod integrations;
pub mod kpi;
pub mod middleware;
pub mod models;
pub mod payroll;
pub mod retry;
pub mod signup;
pub mod state;
pub mod sync;
pub mod vault;

pub use error::AppError;
pub use state::AppState;
