//! Alert lifecycle and notification dispatch.
//!
//! `active → acknowledged → resolved`, plus `active → snoozed → active`.
//! The snooze loop flips expired snoozes back to active once a minute.

use super::{KpiEngine, Severity, ThresholdContent};
use crate::db::DbError;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Snoozed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Snoozed => "snoozed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AlertStatus::Active),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            "snoozed" => Some(AlertStatus::Snoozed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiAlert {
    pub id: String,
    pub threshold_id: String,
    pub kpi_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub current_value: f64,
    pub threshold_value: f64,
    pub deviation_percent: f64,
    pub message: String,
    pub context: Value,
    pub created_at: i64,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<i64>,
    pub snoozed_until: Option<i64>,
    pub notification_count: u32,
}

/// One attempted channel send, as recorded on the alert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub channel: String,
    pub recipient: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub sent_at: i64,
}

/// Delivery side of notifications. Email/chat/SMS gateways are external
/// collaborators; the engine only emits structured jobs through this seam.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        recipient: &str,
        alert: &KpiAlert,
    ) -> Result<(), String>;
}

/// Default gateway: logs the structured job. Deployments wire a real
/// dispatcher here.
pub struct LogNotificationGateway;

#[async_trait]
impl NotificationGateway for LogNotificationGateway {
    async fn send(
        &self,
        channel: &str,
        recipient: &str,
        alert: &KpiAlert,
    ) -> Result<(), String> {
        info!(
            channel,
            recipient,
            alert_id = %alert.id,
            severity = alert.severity.as_str(),
            "notification job emitted: {}",
            alert.message
        );
        Ok(())
    }
}

impl KpiEngine {
    pub(crate) async fn dispatch_notifications(
        &self,
        alert: &KpiAlert,
        content: &ThresholdContent,
    ) {
        for channel in &content.channels {
            for recipient in &content.recipients {
                let result = self.gateway.send(channel, recipient, alert).await;
                let (success, error_message) = match &result {
                    Ok(()) => (true, None),
                    Err(e) => {
                        warn!(channel, recipient, "notification send failed: {e}");
                        (false, Some(e.clone()))
                    }
                };
                if let Err(e) =
                    self.record_notification(&alert.id, channel, recipient, success, error_message.as_deref())
                {
                    warn!(alert_id = %alert.id, "failed recording notification: {e}");
                }
            }
        }
    }

    /// Append a send attempt to the alert's notification history.
    pub fn record_notification(
        &self,
        alert_id: &str,
        channel: &str,
        recipient: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        self.db.exec(
            "INSERT INTO alert_notifications (alert_id, channel, recipient, success, error_message, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alert_id,
                channel,
                recipient,
                success as i64,
                error_message,
                Utc::now().timestamp()
            ],
        )?;
        self.db.exec(
            "UPDATE kpi_alerts SET notification_count = notification_count + 1 WHERE id = ?1",
            params![alert_id],
        )?;
        Ok(())
    }

    pub fn notifications_for(&self, alert_id: &str) -> Result<Vec<NotificationRecord>, AppError> {
        self.db
            .query_many(
                "SELECT channel, recipient, success, error_message, sent_at
                 FROM alert_notifications WHERE alert_id = ?1 ORDER BY id ASC",
                params![alert_id],
                |row| {
                    Ok(NotificationRecord {
                        channel: row.get(0)?,
                        recipient: row.get(1)?,
                        success: row.get::<_, i64>(2)? != 0,
                        error_message: row.get(3)?,
                        sent_at: row.get(4)?,
                    })
                },
            )
            .map_err(Into::into)
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn get_alert(&self, id: &str) -> Result<KpiAlert, AppError> {
        self.db
            .query_one(
                &format!("SELECT {ALERT_COLUMNS} FROM kpi_alerts WHERE id = ?1"),
                params![id],
                row_to_alert,
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("alert {id}")),
                other => other.into(),
            })
    }

    pub fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        limit: u32,
    ) -> Result<Vec<KpiAlert>, AppError> {
        match status {
            Some(status) => self
                .db
                .query_many(
                    &format!(
                        "SELECT {ALERT_COLUMNS} FROM kpi_alerts
                         WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit],
                    row_to_alert,
                )
                .map_err(Into::into),
            None => self
                .db
                .query_many(
                    &format!(
                        "SELECT {ALERT_COLUMNS} FROM kpi_alerts
                         ORDER BY created_at DESC LIMIT ?1"
                    ),
                    params![limit],
                    row_to_alert,
                )
                .map_err(Into::into),
        }
    }

    pub fn acknowledge_alert(&self, id: &str, by: &str) -> Result<KpiAlert, AppError> {
        let alert = self.get_alert(id)?;
        if alert.status != AlertStatus::Active {
            return Err(AppError::Conflict(format!(
                "alert is {}, only active alerts can be acknowledged",
                alert.status.as_str()
            )));
        }
        self.db.exec(
            "UPDATE kpi_alerts
             SET status = 'acknowledged', acknowledged_by = ?1, acknowledged_at = ?2
             WHERE id = ?3",
            params![by, Utc::now().timestamp(), id],
        )?;
        self.get_alert(id)
    }

    pub fn resolve_alert(&self, id: &str, by: &str) -> Result<KpiAlert, AppError> {
        let alert = self.get_alert(id)?;
        if !matches!(alert.status, AlertStatus::Active | AlertStatus::Acknowledged) {
            return Err(AppError::Conflict(format!(
                "alert is {}, cannot be resolved",
                alert.status.as_str()
            )));
        }
        self.db.exec(
            "UPDATE kpi_alerts SET status = 'resolved', resolved_by = ?1, resolved_at = ?2
             WHERE id = ?3",
            params![by, Utc::now().timestamp(), id],
        )?;
        self.get_alert(id)
    }

    pub fn snooze_alert(&self, id: &str, minutes: u32) -> Result<KpiAlert, AppError> {
        if minutes == 0 {
            return Err(AppError::Validation("snooze minutes must be positive".into()));
        }
        let alert = self.get_alert(id)?;
        if alert.status != AlertStatus::Active {
            return Err(AppError::Conflict(format!(
                "alert is {}, only active alerts can be snoozed",
                alert.status.as_str()
            )));
        }
        let until = Utc::now().timestamp() + minutes as i64 * 60;
        self.db.exec(
            "UPDATE kpi_alerts SET status = 'snoozed', snoozed_until = ?1 WHERE id = ?2",
            params![until, id],
        )?;
        self.get_alert(id)
    }

    /// Flip expired snoozes back to active. Called by the minute loop.
    pub fn reactivate_expired_snoozes(&self) -> Result<usize, AppError> {
        let now = Utc::now().timestamp();
        let flipped = self.db.exec(
            "UPDATE kpi_alerts SET status = 'active', snoozed_until = NULL
             WHERE status = 'snoozed' AND snoozed_until < ?1",
            params![now],
        )?;
        if flipped > 0 {
            info!(flipped, "reactivated snoozed alerts");
        }
        Ok(flipped)
    }
}

const ALERT_COLUMNS: &str = "id, threshold_id, kpi_name, severity, status, current_value, \
     threshold_value, deviation_percent, message, context_json, created_at, acknowledged_by, \
     acknowledged_at, resolved_by, resolved_at, snoozed_until, notification_count";

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<KpiAlert> {
    let severity: String = row.get(3)?;
    let status: String = row.get(4)?;
    let context: String = row.get(9)?;
    Ok(KpiAlert {
        id: row.get(0)?,
        threshold_id: row.get(1)?,
        kpi_name: row.get(2)?,
        severity: Severity::from_str(&severity).unwrap_or(Severity::Warning),
        status: AlertStatus::from_str(&status).unwrap_or(AlertStatus::Active),
        current_value: row.get(5)?,
        threshold_value: row.get(6)?,
        deviation_percent: row.get(7)?,
        message: row.get(8)?,
        context: serde_json::from_str(&context).unwrap_or(Value::Null),
        created_at: row.get(10)?,
        acknowledged_by: row.get(11)?,
        acknowledged_at: row.get(12)?,
        resolved_by: row.get(13)?,
        resolved_at: row.get(14)?,
        snoozed_until: row.get(15)?,
        notification_count: row.get::<_, i64>(16)? as u32,
    })
}
