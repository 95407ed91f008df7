//! Core domain types shared across the backend.
//!
//! Every entity mirrors a snake_case table in the persistence layer; the
//! case translation happens once at the db boundary, never in handlers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Validation lifecycle of a sign-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Validated,
    Rejected,
    Duplicate,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Validated => "validated",
            ValidationStatus::Rejected => "rejected",
            ValidationStatus::Duplicate => "duplicate",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ValidationStatus::Pending),
            "validated" => Some(ValidationStatus::Validated),
            "rejected" => Some(ValidationStatus::Rejected),
            "duplicate" => Some(ValidationStatus::Duplicate),
            _ => None,
        }
    }

    /// Terminal states admit no further validation transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ValidationStatus::Pending)
    }
}

/// Bet-slip extraction lifecycle of a sign-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    NotRequired,
    Pending,
    NeedsReview,
    Confirmed,
    Skipped,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::NotRequired => "not_required",
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::NeedsReview => "needs_review",
            ExtractionStatus::Confirmed => "confirmed",
            ExtractionStatus::Skipped => "skipped",
            ExtractionStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_required" => Some(ExtractionStatus::NotRequired),
            "pending" => Some(ExtractionStatus::Pending),
            "needs_review" => Some(ExtractionStatus::NeedsReview),
            "confirmed" => Some(ExtractionStatus::Confirmed),
            "skipped" => Some(ExtractionStatus::Skipped),
            "failed" => Some(ExtractionStatus::Failed),
            _ => None,
        }
    }
}

/// Structured fields read off an uploaded bet slip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bet_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_bet_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odds: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_confidence: Option<f64>,
}

impl ExtractedFields {
    /// All three wager fields present (confidence aside).
    pub fn is_complete(&self) -> bool {
        self.bet_amount.is_some() && self.team_bet_on.is_some() && self.odds.is_some()
    }
}

/// A customer converted at an event or a solo touchpoint.
///
/// Exactly one of `event_id` / `solo_chat_id` is set; the intake layer
/// rejects submissions that violate this before a row ever exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUp {
    pub id: String,
    pub event_id: Option<String>,
    pub solo_chat_id: Option<String>,
    pub ambassador_id: String,
    pub operator_id: i64,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customer_state: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub validation_status: ValidationStatus,
    pub extraction_status: ExtractionStatus,
    #[serde(flatten)]
    pub extracted: ExtractedFields,
    pub image_key: Option<String>,
    pub cpa_amount: Option<f64>,
    pub pay_period_id: Option<String>,
    pub idempotency_key: String,
}

/// Scheduled on-site activation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Planned,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Planned => "planned",
            EventStatus::Confirmed => "confirmed",
            EventStatus::Active => "active",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(EventStatus::Planned),
            "confirmed" => Some(EventStatus::Confirmed),
            "active" => Some(EventStatus::Active),
            "completed" => Some(EventStatus::Completed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }

    /// Legal transitions: planned → confirmed → active → completed, with
    /// cancelled reachable until the event has completed.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Planned, Confirmed)
                | (Confirmed, Active)
                | (Active, Completed)
                | (Planned, Cancelled)
                | (Confirmed, Cancelled)
                | (Active, Cancelled)
        )
    }
}

/// A scheduled on-site activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub title: String,
    pub venue: String,
    pub event_date: NaiveDate,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub timezone: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub event_type: Option<String>,
    pub notes: Option<String>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per event status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStatusHistory {
    pub id: String,
    pub event_id: String,
    pub from_status: EventStatus,
    pub to_status: EventStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Assignment of an ambassador to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Confirmed,
    Declined,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Confirmed => "confirmed",
            AssignmentStatus::Declined => "declined",
            AssignmentStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AssignmentStatus::Pending),
            "confirmed" => Some(AssignmentStatus::Confirmed),
            "declined" => Some(AssignmentStatus::Declined),
            "completed" => Some(AssignmentStatus::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Declined)
                | (Confirmed, Completed)
                | (Confirmed, Declined)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub event_id: String,
    pub ambassador_id: String,
    pub status: AssignmentStatus,
    pub hours_worked: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambassador {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub hourly_rate: Option<f64>,
    pub is_active: bool,
}

impl Ambassador {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: i64,
    pub name: String,
    pub short_name: Option<String>,
    /// Sign-ups from this operator skip manual review and validate on intake.
    pub auto_validate: bool,
}

/// Commission per (operator, state) effective over a date window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpaRate {
    pub id: String,
    pub operator_id: i64,
    pub state_code: String,
    pub cpa_amount: f64,
    pub effective_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
}

/// Staff skill levels priced in event budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillLevel {
    Trainee,
    Standard,
    Senior,
    Lead,
}

impl SkillLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillLevel::Trainee => "trainee",
            SkillLevel::Standard => "standard",
            SkillLevel::Senior => "senior",
            SkillLevel::Lead => "lead",
        }
    }
}

/// Fixed budget/actuals line items for an event. The same shape backs both
/// the projection row and the realized row. Omitted items deserialize to 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetLines {
    pub staff: f64,
    pub reimbursements: f64,
    pub rewards: f64,
    pub base: f64,
    pub bonus_kickback: f64,
    pub parking: f64,
    pub setup: f64,
    pub additional_1: f64,
    pub additional_2: f64,
    pub additional_3: f64,
    pub additional_4: f64,
}

impl BudgetLines {
    pub fn sum(&self) -> f64 {
        self.staff
            + self.reimbursements
            + self.rewards
            + self.base
            + self.bonus_kickback
            + self.parking
            + self.setup
            + self.additional_1
            + self.additional_2
            + self.additional_3
            + self.additional_4
    }
}

/// Budget (projection) or actuals (realized) row for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFinancials {
    pub event_id: String,
    /// "budget" or "actual"
    pub kind: String,
    #[serde(flatten)]
    pub lines: BudgetLines,
    pub total: f64,
    pub revenue: f64,
    pub profit: f64,
    pub margin_percent: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl EventFinancials {
    /// `total = Σ(line items)` within rounding tolerance; `profit = revenue − total`.
    pub fn is_consistent(&self) -> bool {
        (self.total - self.lines.sum()).abs() <= 0.01
            && (self.profit - (self.revenue - self.total)).abs() <= 0.01
    }

    /// Recompute the derived fields from the line items and revenue.
    pub fn recompute(&mut self) {
        self.total = (self.lines.sum() * 100.0).round() / 100.0;
        self.profit = ((self.revenue - self.total) * 100.0).round() / 100.0;
        self.margin_percent = if self.revenue.abs() > f64::EPSILON {
            Some((self.profit / self.revenue * 10_000.0).round() / 100.0)
        } else {
            None
        };
    }
}

/// Which slice of a sign-up is pushed outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Initial,
    Enriched,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Initial => "initial",
            SyncPhase::Enriched => "enriched",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(SyncPhase::Initial),
            "enriched" => Some(SyncPhase::Enriched),
            _ => None,
        }
    }
}

/// Permanent fan-out failure for one sign-up leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub id: String,
    pub sign_up_id: String,
    pub sync_phase: SyncPhase,
    pub error_type: String,
    pub error_message: String,
    pub last_attempt_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub resolved: bool,
}

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub jwt_secret: String,
    pub vault_key_hex: String,
    /// Optional secondary decrypt key accepted during key rotation.
    pub vault_key_secondary_hex: Option<String>,
    pub ledgerbooks_base_url: String,
    pub cardops_base_url: String,
    pub crm_base_url: String,
    pub extractor_base_url: Option<String>,
    pub replay_buffer_size: usize,
    pub ws_send_timeout_secs: u64,
    pub session_reap_secs: i64,
    pub kpi_eval_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./fieldops.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        // 32-byte hex key for the credential vault. Deterministic dev default;
        // production sets VAULT_KEY_HEX.
        let vault_key_hex = std::env::var("VAULT_KEY_HEX").unwrap_or_else(|_| "00".repeat(32));
        let vault_key_secondary_hex = std::env::var("VAULT_KEY_SECONDARY_HEX").ok();

        let ledgerbooks_base_url = std::env::var("LEDGERBOOKS_BASE_URL")
            .unwrap_or_else(|_| "https://api.ledgerbooks.com/v3".to_string());
        let cardops_base_url = std::env::var("CARDOPS_BASE_URL")
            .unwrap_or_else(|_| "https://api.cardops.com/developer/v1".to_string());
        let crm_base_url = std::env::var("CRM_BASE_URL")
            .unwrap_or_else(|_| "https://track.crmpartner.com/api/v1".to_string());
        let extractor_base_url = std::env::var("EXTRACTOR_BASE_URL").ok();

        let replay_buffer_size = std::env::var("REPLAY_BUFFER_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let ws_send_timeout_secs = std::env::var("WS_SEND_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let session_reap_secs = std::env::var("SESSION_REAP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let kpi_eval_interval_secs = std::env::var("KPI_EVAL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Ok(Self {
            database_path,
            port,
            jwt_secret,
            vault_key_hex,
            vault_key_secondary_hex,
            ledgerbooks_base_url,
            cardops_base_url,
            crm_base_url,
            extractor_base_url,
            replay_buffer_size,
            ws_send_timeout_secs,
            session_reap_secs,
            kpi_eval_interval_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_status_transitions() {
        use EventStatus::*;
        assert!(Planned.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Planned.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Cancelled));

        // Terminal states go nowhere
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Planned));
        assert!(!Completed.can_transition_to(Cancelled));

        // No skipping forward
        assert!(!Planned.can_transition_to(Active));
        assert!(!Planned.can_transition_to(Completed));
    }

    #[test]
    fn test_assignment_status_transitions() {
        use AssignmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Declined));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Declined.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trip() {
        for s in ["pending", "validated", "rejected", "duplicate"] {
            assert_eq!(ValidationStatus::from_str(s).unwrap().as_str(), s);
        }
        for s in [
            "not_required",
            "pending",
            "needs_review",
            "confirmed",
            "skipped",
            "failed",
        ] {
            assert_eq!(ExtractionStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(ValidationStatus::from_str("bogus").is_none());
    }

    #[test]
    fn test_financials_recompute() {
        let mut fin = EventFinancials {
            event_id: "ev1".to_string(),
            kind: "budget".to_string(),
            lines: BudgetLines {
                staff: 400.0,
                reimbursements: 55.25,
                rewards: 120.0,
                base: 250.0,
                bonus_kickback: 75.5,
                parking: 20.0,
                setup: 30.0,
                ..Default::default()
            },
            total: 0.0,
            revenue: 1500.0,
            profit: 0.0,
            margin_percent: None,
            updated_at: Utc::now(),
        };
        fin.recompute();
        assert!((fin.total - 950.75).abs() < 0.005);
        assert!((fin.profit - 549.25).abs() < 0.005);
        assert!(fin.is_consistent());
        assert!(fin.margin_percent.unwrap() > 36.0 && fin.margin_percent.unwrap() < 37.0);
    }

    #[test]
    fn test_extracted_fields_complete() {
        let mut fields = ExtractedFields::default();
        assert!(!fields.is_complete());
        fields.bet_amount = Some(50.0);
        fields.team_bet_on = Some("Home".to_string());
        fields.odds = Some("+110".to_string());
        assert!(fields.is_complete());
    }
}
