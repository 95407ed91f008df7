//! KPI threshold and alert engine.
//!
//! Thresholds are versioned: every update closes the current version row
//! and opens the next, so `get_threshold_at_time` can answer "what rule was
//! in force when this alert fired". Evaluation, the alert lifecycle, and
//! notification dispatch live in the sibling modules.

pub mod alerts;
pub mod evaluate;

pub use alerts::{AlertStatus, KpiAlert, LogNotificationGateway, NotificationGateway};
pub use evaluate::MetricSample;

use crate::db::{Database, DbError};
use crate::error::AppError;
use chrono::Utc;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    PctChangeAbove,
    PctChangeBelow,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Gt => "gt",
            Condition::Lt => "lt",
            Condition::Gte => "gte",
            Condition::Lte => "lte",
            Condition::Eq => "eq",
            Condition::Neq => "neq",
            Condition::PctChangeAbove => "pct_change_above",
            Condition::PctChangeBelow => "pct_change_below",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gt" => Some(Condition::Gt),
            "lt" => Some(Condition::Lt),
            "gte" => Some(Condition::Gte),
            "lte" => Some(Condition::Lte),
            "eq" => Some(Condition::Eq),
            "neq" => Some(Condition::Neq),
            "pct_change_above" => Some(Condition::PctChangeAbove),
            "pct_change_below" => Some(Condition::PctChangeBelow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Count => "count",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(Aggregation::Sum),
            "avg" => Some(Aggregation::Avg),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "count" => Some(Aggregation::Count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// The versioned content of a threshold — everything an operator can edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdContent {
    pub kpi_name: String,
    pub category: String,
    pub condition: Condition,
    pub threshold_value: f64,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub aggregation: Aggregation,
    pub aggregation_period_minutes: u32,
    pub severity: Severity,
    pub enabled: bool,
    pub cooldown_minutes: u32,
    pub channels: Vec<String>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiThreshold {
    pub id: String,
    #[serde(flatten)]
    pub content: ThresholdContent,
    pub current_version: u32,
    pub last_alert_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdVersion {
    pub version: u32,
    pub content: ThresholdContent,
    pub is_current: bool,
    pub effective_from: i64,
    pub effective_to: Option<i64>,
    pub change_reason: Option<String>,
}

pub struct KpiEngine {
    pub(crate) db: Arc<Database>,
    pub(crate) bus: Arc<crate::bus::EventBus>,
    pub(crate) gateway: Arc<dyn NotificationGateway>,
}

impl KpiEngine {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<crate::bus::EventBus>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self { db, bus, gateway }
    }

    // -- threshold CRUD -----------------------------------------------------

    pub fn create_threshold(&self, content: ThresholdContent) -> Result<KpiThreshold, AppError> {
        validate_content(&content)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let content_json = serde_json::to_string(&content)
            .map_err(|e| AppError::Internal(format!("threshold serialization: {e}")))?;

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO kpi_thresholds
                     (id, kpi_name, category, condition, threshold_value, warning_threshold,
                      critical_threshold, aggregation, aggregation_period_minutes, severity,
                      enabled, cooldown_minutes, channels, recipients, current_version,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15, ?15)",
                params![
                    id,
                    content.kpi_name,
                    content.category,
                    content.condition.as_str(),
                    content.threshold_value,
                    content.warning_threshold,
                    content.critical_threshold,
                    content.aggregation.as_str(),
                    content.aggregation_period_minutes,
                    content.severity.as_str(),
                    content.enabled as i64,
                    content.cooldown_minutes,
                    serde_json::to_string(&content.channels).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&content.recipients).unwrap_or_else(|_| "[]".into()),
                    now,
                ],
            )?;
            tx.execute(
                "INSERT INTO kpi_threshold_versions
                     (id, threshold_id, version, content_json, is_current, effective_from)
                 VALUES (?1, ?2, 1, ?3, 1, ?4)",
                params![Uuid::new_v4().to_string(), id, content_json, now],
            )?;
            Ok(())
        })?;

        info!(threshold_id = %id, kpi = %content.kpi_name, "threshold created");
        self.get_threshold(&id)
    }

    /// Atomically close the current version and open the next one.
    pub fn update_threshold(
        &self,
        id: &str,
        content: ThresholdContent,
        change_reason: Option<&str>,
    ) -> Result<KpiThreshold, AppError> {
        validate_content(&content)?;
        let existing = self.get_threshold(id)?;
        let next_version = existing.current_version + 1;
        let now = Utc::now().timestamp();
        let content_json = serde_json::to_string(&content)
            .map_err(|e| AppError::Internal(format!("threshold serialization: {e}")))?;

        self.db.transaction(|tx| {
            tx.execute(
                "UPDATE kpi_threshold_versions
                 SET is_current = 0, effective_to = ?1
                 WHERE threshold_id = ?2 AND is_current = 1",
                params![now, id],
            )?;
            tx.execute(
                "INSERT INTO kpi_threshold_versions
                     (id, threshold_id, version, content_json, is_current, effective_from, change_reason)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    id,
                    next_version,
                    content_json,
                    now,
                    change_reason
                ],
            )?;
            tx.execute(
                "UPDATE kpi_thresholds
                 SET kpi_name = ?1, category = ?2, condition = ?3, threshold_value = ?4,
                     warning_threshold = ?5, critical_threshold = ?6, aggregation = ?7,
                     aggregation_period_minutes = ?8, severity = ?9, enabled = ?10,
                     cooldown_minutes = ?11, channels = ?12, recipients = ?13,
                     current_version = ?14, updated_at = ?15
                 WHERE id = ?16",
                params![
                    content.kpi_name,
                    content.category,
                    content.condition.as_str(),
                    content.threshold_value,
                    content.warning_threshold,
                    content.critical_threshold,
                    content.aggregation.as_str(),
                    content.aggregation_period_minutes,
                    content.severity.as_str(),
                    content.enabled as i64,
                    content.cooldown_minutes,
                    serde_json::to_string(&content.channels).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&content.recipients).unwrap_or_else(|_| "[]".into()),
                    next_version,
                    now,
                    id
                ],
            )?;
            Ok(())
        })?;

        info!(threshold_id = %id, version = next_version, "threshold updated");
        self.get_threshold(id)
    }

    /// A rollback is a new version whose content copies the target; history
    /// is never mutated.
    pub fn rollback_threshold(
        &self,
        id: &str,
        target_version: u32,
        reason: Option<&str>,
    ) -> Result<KpiThreshold, AppError> {
        let target = self
            .get_version(id, target_version)?
            .ok_or_else(|| AppError::NotFound(format!("version {target_version} of threshold {id}")))?;
        let reason = match reason {
            Some(r) => format!("rollback to v{target_version}: {r}"),
            None => format!("rollback to v{target_version}"),
        };
        self.update_threshold(id, target.content, Some(&reason))
    }

    pub fn get_threshold(&self, id: &str) -> Result<KpiThreshold, AppError> {
        self.db
            .query_one(
                "SELECT id, kpi_name, category, condition, threshold_value, warning_threshold,
                        critical_threshold, aggregation, aggregation_period_minutes, severity,
                        enabled, cooldown_minutes, channels, recipients, current_version,
                        last_alert_at, created_at, updated_at
                 FROM kpi_thresholds WHERE id = ?1",
                params![id],
                row_to_threshold,
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("threshold {id}")),
                other => other.into(),
            })
    }

    pub fn list_thresholds(&self, enabled_only: bool) -> Result<Vec<KpiThreshold>, AppError> {
        let min_enabled = if enabled_only { 1 } else { 0 };
        self.db
            .query_many(
                "SELECT id, kpi_name, category, condition, threshold_value, warning_threshold,
                        critical_threshold, aggregation, aggregation_period_minutes, severity,
                        enabled, cooldown_minutes, channels, recipients, current_version,
                        last_alert_at, created_at, updated_at
                 FROM kpi_thresholds WHERE enabled >= ?1
                 ORDER BY created_at ASC",
                params![min_enabled],
                row_to_threshold,
            )
            .map_err(Into::into)
    }

    pub fn delete_threshold(&self, id: &str) -> Result<(), AppError> {
        let deleted = self.db.transaction(|tx| {
            tx.execute(
                "DELETE FROM kpi_threshold_versions WHERE threshold_id = ?1",
                params![id],
            )?;
            Ok(tx.execute("DELETE FROM kpi_thresholds WHERE id = ?1", params![id])?)
        })?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!("threshold {id}")));
        }
        Ok(())
    }

    /// The version in force at `t`: `effective_from ≤ t < effective_to`.
    pub fn get_threshold_at_time(
        &self,
        id: &str,
        t: i64,
    ) -> Result<Option<ThresholdVersion>, AppError> {
        match self.db.query_one(
            "SELECT version, content_json, is_current, effective_from, effective_to, change_reason
             FROM kpi_threshold_versions
             WHERE threshold_id = ?1 AND effective_from <= ?2
               AND (effective_to IS NULL OR effective_to > ?2)
             ORDER BY version DESC LIMIT 1",
            params![id, t],
            row_to_version,
        ) {
            Ok(v) => Ok(Some(v)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_version(&self, id: &str, version: u32) -> Result<Option<ThresholdVersion>, AppError> {
        match self.db.query_one(
            "SELECT version, content_json, is_current, effective_from, effective_to, change_reason
             FROM kpi_threshold_versions
             WHERE threshold_id = ?1 AND version = ?2",
            params![id, version],
            row_to_version,
        ) {
            Ok(v) => Ok(Some(v)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_versions(&self, id: &str) -> Result<Vec<ThresholdVersion>, AppError> {
        self.db
            .query_many(
                "SELECT version, content_json, is_current, effective_from, effective_to, change_reason
                 FROM kpi_threshold_versions
                 WHERE threshold_id = ?1 ORDER BY version ASC",
                params![id],
                row_to_version,
            )
            .map_err(Into::into)
    }
}

fn validate_content(content: &ThresholdContent) -> Result<(), AppError> {
    let mut fields = Vec::new();
    if content.kpi_name.trim().is_empty() {
        fields.push(("kpiName".to_string(), "must not be empty".to_string()));
    }
    if content.aggregation_period_minutes == 0 {
        fields.push((
            "aggregationPeriodMinutes".to_string(),
            "must be positive".to_string(),
        ));
    }
    if !fields.is_empty() {
        return Err(AppError::ValidationFields(fields));
    }
    Ok(())
}

fn row_to_threshold(row: &Row<'_>) -> rusqlite::Result<KpiThreshold> {
    let condition: String = row.get(3)?;
    let aggregation: String = row.get(7)?;
    let severity: String = row.get(9)?;
    let channels: String = row.get(12)?;
    let recipients: String = row.get(13)?;
    Ok(KpiThreshold {
        id: row.get(0)?,
        content: ThresholdContent {
            kpi_name: row.get(1)?,
            category: row.get(2)?,
            condition: Condition::from_str(&condition).unwrap_or(Condition::Gt),
            threshold_value: row.get(4)?,
            warning_threshold: row.get(5)?,
            critical_threshold: row.get(6)?,
            aggregation: Aggregation::from_str(&aggregation).unwrap_or(Aggregation::Avg),
            aggregation_period_minutes: row.get::<_, i64>(8)? as u32,
            severity: Severity::from_str(&severity).unwrap_or(Severity::Warning),
            enabled: row.get::<_, i64>(10)? != 0,
            cooldown_minutes: row.get::<_, i64>(11)? as u32,
            channels: serde_json::from_str(&channels).unwrap_or_default(),
            recipients: serde_json::from_str(&recipients).unwrap_or_default(),
        },
        current_version: row.get::<_, i64>(14)? as u32,
        last_alert_at: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<ThresholdVersion> {
    let content_json: String = row.get(1)?;
    Ok(ThresholdVersion {
        version: row.get::<_, i64>(0)? as u32,
        content: serde_json::from_str(&content_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        is_current: row.get::<_, i64>(2)? != 0,
        effective_from: row.get(3)?,
        effective_to: row.get(4)?,
        change_reason: row.get(5)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bus::{ClientRegistry, EventBus};

    pub fn engine() -> KpiEngine {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(db.clone(), Arc::new(ClientRegistry::new()), 100));
        KpiEngine::new(db, bus, Arc::new(LogNotificationGateway))
    }

    pub fn content(kpi_name: &str) -> ThresholdContent {
        ThresholdContent {
            kpi_name: kpi_name.to_string(),
            category: "signups".to_string(),
            condition: Condition::Gt,
            threshold_value: 100.0,
            warning_threshold: None,
            critical_threshold: None,
            aggregation: Aggregation::Avg,
            aggregation_period_minutes: 60,
            severity: Severity::Warning,
            enabled: true,
            cooldown_minutes: 60,
            channels: vec!["email".to_string()],
            recipients: vec!["ops@fieldops.example".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{content, engine};
    use super::*;

    #[test]
    fn test_create_then_read_back() {
        let engine = engine();
        let created = engine.create_threshold(content("signups_per_hour")).unwrap();
        assert_eq!(created.current_version, 1);

        let now = Utc::now().timestamp();
        let at_now = engine
            .get_threshold_at_time(&created.id, now)
            .unwrap()
            .unwrap();
        assert_eq!(at_now.version, 1);
        assert!(at_now.is_current);
        assert_eq!(at_now.content.kpi_name, "signups_per_hour");
        assert_eq!(at_now.content.threshold_value, 100.0);
    }

    #[test]
    fn test_update_creates_adjacent_versions() {
        let engine = engine();
        let created = engine.create_threshold(content("signups_per_hour")).unwrap();

        let mut changed = content("signups_per_hour");
        changed.threshold_value = 150.0;
        let updated = engine
            .update_threshold(&created.id, changed, Some("raise limit"))
            .unwrap();
        assert_eq!(updated.current_version, 2);
        assert_eq!(updated.content.threshold_value, 150.0);

        let versions = engine.list_versions(&created.id).unwrap();
        assert_eq!(versions.len(), 2);
        // Exactly one current.
        assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
        // Adjacent intervals: v1.effective_to == v2.effective_from.
        assert_eq!(versions[0].effective_to, Some(versions[1].effective_from));
        assert!(versions[1].effective_to.is_none());
    }

    #[test]
    fn test_rollback_is_a_new_version() {
        let engine = engine();
        let created = engine.create_threshold(content("kpi")).unwrap();

        let mut changed = content("kpi");
        changed.threshold_value = 999.0;
        engine.update_threshold(&created.id, changed, None).unwrap();

        let rolled = engine
            .rollback_threshold(&created.id, 1, Some("bad change"))
            .unwrap();
        assert_eq!(rolled.current_version, 3);
        assert_eq!(rolled.content.threshold_value, 100.0);

        let versions = engine.list_versions(&created.id).unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions[2]
            .change_reason
            .as_deref()
            .unwrap()
            .starts_with("rollback to v1"));
    }

    #[test]
    fn test_version_at_time_boundaries() {
        let engine = engine();
        let created = engine.create_threshold(content("kpi")).unwrap();
        let v1 = engine.get_version(&created.id, 1).unwrap().unwrap();

        // Before creation: nothing in force.
        assert!(engine
            .get_threshold_at_time(&created.id, v1.effective_from - 1)
            .unwrap()
            .is_none());
        // At the boundary instant the version is in force.
        let at = engine
            .get_threshold_at_time(&created.id, v1.effective_from)
            .unwrap()
            .unwrap();
        assert_eq!(at.version, 1);
    }

    #[test]
    fn test_rollback_missing_version() {
        let engine = engine();
        let created = engine.create_threshold(content("kpi")).unwrap();
        assert!(matches!(
            engine.rollback_threshold(&created.id, 9, None),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_validation() {
        let engine = engine();
        let mut bad = content("");
        bad.kpi_name = "  ".to_string();
        assert!(matches!(
            engine.create_threshold(bad),
            Err(AppError::ValidationFields(_))
        ));
    }
}
