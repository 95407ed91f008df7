//! Domain event envelope and well-known event types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types published by the core subsystems. Non-exhaustive; consumers
/// match on the string.
pub mod types {
    pub const SIGN_UP_SUBMITTED: &str = "sign_up.submitted";
    pub const SIGN_UP_VALIDATED: &str = "sign_up.validated";
    pub const SIGN_UP_REJECTED: &str = "sign_up.rejected";
    pub const SIGN_UP_DUPLICATE: &str = "sign_up.duplicate";
    pub const SIGN_UP_RATE_MISSING: &str = "sign_up.rate_missing";
    pub const SIGN_UP_EXTRACTION_CONFIRMED: &str = "sign_up.extraction_confirmed";
    pub const SIGN_UP_EXTRACTION_SKIPPED: &str = "sign_up.extraction_skipped";
    pub const EVENT_UPDATED: &str = "event.updated";
    pub const PAYROLL_PROCESSED: &str = "payroll.processed";
    pub const EXTERNAL_SYNC_COMPLETED: &str = "external_sync.completed";
    pub const DASHBOARD_SIGNUP_UPDATE: &str = "dashboard.signup_update";
    pub const DASHBOARD_METRICS_REFRESH: &str = "dashboard.metrics_refresh";
    pub const KPI_ALERT_CREATED: &str = "kpi.alert_created";
    pub const IMPORT_COMPLETED: &str = "import.completed";
}

/// An event as it travels the bus and the durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Milliseconds, monotonic per node.
    pub timestamp: i64,
}

impl DomainEvent {
    /// Payload's `ambassadorId`, when present.
    pub fn ambassador_id(&self) -> Option<&str> {
        self.payload.get("ambassadorId").and_then(|v| v.as_str())
    }

    /// Payload's `eventId`, when present.
    pub fn event_id(&self) -> Option<&str> {
        self.payload.get("eventId").and_then(|v| v.as_str())
    }
}
