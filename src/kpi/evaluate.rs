//! Threshold evaluation.
//!
//! Driven by the periodic loop or an explicit `check_thresholds` call with
//! externally-computed metrics. A breach inside the cooldown window is
//! swallowed; outside it, an alert row is created and notifications
//! dispatched to the channels of the version current at fire time.

use super::{Aggregation, Condition, KpiEngine, Severity, ThresholdContent};
use crate::bus::types;
use crate::error::AppError;
use crate::kpi::alerts::KpiAlert;
use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

/// A metric point handed to the evaluator. `previous_value` feeds the
/// percent-change conditions.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub kpi_name: String,
    pub value: f64,
    pub previous_value: Option<f64>,
}

/// Aggregate a sliding window of raw samples.
pub fn aggregate_window(samples: &[f64], aggregation: Aggregation) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    match aggregation {
        Aggregation::Sum => samples.iter().sum(),
        Aggregation::Avg => samples.iter().sum::<f64>() / samples.len() as f64,
        Aggregation::Min => samples.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => samples.len() as f64,
    }
}

/// Is the threshold breached for this value?
pub fn is_breached(
    condition: Condition,
    value: f64,
    threshold: f64,
    previous: Option<f64>,
) -> bool {
    match condition {
        Condition::Gt => value > threshold,
        Condition::Lt => value < threshold,
        Condition::Gte => value >= threshold,
        Condition::Lte => value <= threshold,
        Condition::Eq => (value - threshold).abs() < f64::EPSILON,
        Condition::Neq => (value - threshold).abs() >= f64::EPSILON,
        Condition::PctChangeAbove | Condition::PctChangeBelow => {
            let Some(previous) = previous else {
                return false;
            };
            if previous.abs() < f64::EPSILON {
                return false;
            }
            let pct_change = (value - previous) / previous.abs() * 100.0;
            match condition {
                Condition::PctChangeAbove => pct_change > threshold,
                _ => pct_change < -threshold,
            }
        }
    }
}

/// Deviation of the observed value from the threshold, in percent. Zero
/// when the threshold itself is zero.
pub fn deviation_percent(value: f64, threshold: f64) -> f64 {
    if threshold.abs() < f64::EPSILON {
        return 0.0;
    }
    ((value - threshold) / threshold.abs() * 10_000.0).round() / 100.0
}

fn build_message(content: &ThresholdContent, value: f64, severity: Severity) -> String {
    format!(
        "{} {}: {} is {:.2} (threshold {} {:.2})",
        severity.as_str().to_uppercase(),
        content.category,
        content.kpi_name,
        value,
        content.condition.as_str(),
        content.threshold_value,
    )
}

impl KpiEngine {
    /// Evaluate every enabled threshold against the supplied metrics.
    /// Returns the alerts created this pass.
    pub async fn check_thresholds(
        &self,
        metrics: &[MetricSample],
    ) -> Result<Vec<KpiAlert>, AppError> {
        let now = Utc::now().timestamp();
        let thresholds = self.list_thresholds(true)?;
        let mut created = Vec::new();

        for threshold in thresholds {
            let Some(sample) = metrics
                .iter()
                .find(|m| m.kpi_name == threshold.content.kpi_name)
            else {
                continue;
            };

            // Cooldown gate.
            if let Some(last) = threshold.last_alert_at {
                let cooldown_secs = threshold.content.cooldown_minutes as i64 * 60;
                if now - last < cooldown_secs {
                    debug!(
                        kpi = %threshold.content.kpi_name,
                        "breach check suppressed by cooldown"
                    );
                    continue;
                }
            }

            if !is_breached(
                threshold.content.condition,
                sample.value,
                threshold.content.threshold_value,
                sample.previous_value,
            ) {
                continue;
            }

            // Escalate when the critical bound is also breached.
            let severity = match threshold.content.critical_threshold {
                Some(critical)
                    if is_breached(
                        threshold.content.condition,
                        sample.value,
                        critical,
                        sample.previous_value,
                    ) =>
                {
                    Severity::Critical
                }
                _ => threshold.content.severity,
            };

            let alert = KpiAlert {
                id: Uuid::new_v4().to_string(),
                threshold_id: threshold.id.clone(),
                kpi_name: threshold.content.kpi_name.clone(),
                severity,
                status: super::alerts::AlertStatus::Active,
                current_value: sample.value,
                threshold_value: threshold.content.threshold_value,
                deviation_percent: deviation_percent(
                    sample.value,
                    threshold.content.threshold_value,
                ),
                message: build_message(&threshold.content, sample.value, severity),
                context: json!({
                    "aggregation": threshold.content.aggregation.as_str(),
                    "aggregationPeriodMinutes": threshold.content.aggregation_period_minutes,
                    "previousValue": sample.previous_value,
                    "thresholdVersion": threshold.current_version,
                }),
                created_at: now,
                acknowledged_by: None,
                acknowledged_at: None,
                resolved_by: None,
                resolved_at: None,
                snoozed_until: None,
                notification_count: 0,
            };

            self.db.exec(
                "INSERT INTO kpi_alerts
                     (id, threshold_id, kpi_name, severity, status, current_value,
                      threshold_value, deviation_percent, message, context_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    alert.id,
                    alert.threshold_id,
                    alert.kpi_name,
                    alert.severity.as_str(),
                    alert.current_value,
                    alert.threshold_value,
                    alert.deviation_percent,
                    alert.message,
                    alert.context.to_string(),
                    alert.created_at,
                ],
            )?;
            self.db.exec(
                "UPDATE kpi_thresholds SET last_alert_at = ?1 WHERE id = ?2",
                params![now, threshold.id],
            )?;

            info!(kpi = %alert.kpi_name, severity = severity.as_str(), "KPI alert created");
            metrics::counter!("kpi_alerts_created", 1);

            self.bus.publish(
                types::KPI_ALERT_CREATED,
                json!({
                    "alertId": alert.id,
                    "kpiName": alert.kpi_name,
                    "severity": alert.severity.as_str(),
                    "currentValue": alert.current_value,
                }),
                None,
            );

            // Channels/recipients come from the row just read, i.e. the
            // version current at fire time.
            self.dispatch_notifications(&alert, &threshold.content).await;

            created.push(alert);
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{content, engine};
    use super::*;
    use crate::kpi::alerts::AlertStatus;

    #[test]
    fn test_comparators() {
        assert!(is_breached(Condition::Gt, 101.0, 100.0, None));
        assert!(!is_breached(Condition::Gt, 100.0, 100.0, None));
        assert!(is_breached(Condition::Gte, 100.0, 100.0, None));
        assert!(is_breached(Condition::Lt, 99.0, 100.0, None));
        assert!(is_breached(Condition::Lte, 100.0, 100.0, None));
        assert!(is_breached(Condition::Eq, 100.0, 100.0, None));
        assert!(is_breached(Condition::Neq, 99.0, 100.0, None));
    }

    #[test]
    fn test_pct_change_conditions() {
        // +30% vs a 20% ceiling breaches.
        assert!(is_breached(
            Condition::PctChangeAbove,
            130.0,
            20.0,
            Some(100.0)
        ));
        assert!(!is_breached(
            Condition::PctChangeAbove,
            110.0,
            20.0,
            Some(100.0)
        ));
        // -30% vs a 20% floor breaches.
        assert!(is_breached(
            Condition::PctChangeBelow,
            70.0,
            20.0,
            Some(100.0)
        ));
        assert!(!is_breached(
            Condition::PctChangeBelow,
            95.0,
            20.0,
            Some(100.0)
        ));
        // No previous value: never breaches.
        assert!(!is_breached(Condition::PctChangeAbove, 130.0, 20.0, None));
        // Zero previous: undefined change, never breaches.
        assert!(!is_breached(
            Condition::PctChangeAbove,
            130.0,
            20.0,
            Some(0.0)
        ));
    }

    #[test]
    fn test_aggregations() {
        let samples = [2.0, 4.0, 6.0];
        assert_eq!(aggregate_window(&samples, Aggregation::Sum), 12.0);
        assert_eq!(aggregate_window(&samples, Aggregation::Avg), 4.0);
        assert_eq!(aggregate_window(&samples, Aggregation::Min), 2.0);
        assert_eq!(aggregate_window(&samples, Aggregation::Max), 6.0);
        assert_eq!(aggregate_window(&samples, Aggregation::Count), 3.0);
        assert_eq!(aggregate_window(&[], Aggregation::Sum), 0.0);
    }

    #[test]
    fn test_deviation_percent() {
        assert_eq!(deviation_percent(120.0, 100.0), 20.0);
        assert_eq!(deviation_percent(80.0, 100.0), -20.0);
        assert_eq!(deviation_percent(50.0, 0.0), 0.0);
    }

    #[tokio::test]
    async fn test_breach_creates_one_alert() {
        let engine = engine();
        engine.create_threshold(content("signups_per_hour")).unwrap();

        let metrics = [MetricSample {
            kpi_name: "signups_per_hour".to_string(),
            value: 120.0,
            previous_value: None,
        }];
        let alerts = engine.check_thresholds(&metrics).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].deviation_percent, 20.0);
        assert_eq!(alerts[0].status, AlertStatus::Active);
        // One notification per channel × recipient, recorded on the alert.
        let stored = engine.get_alert(&alerts[0].id).unwrap();
        assert_eq!(stored.notification_count, 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_followup() {
        let engine = engine();
        engine.create_threshold(content("signups_per_hour")).unwrap();

        let metrics = [MetricSample {
            kpi_name: "signups_per_hour".to_string(),
            value: 120.0,
            previous_value: None,
        }];
        let first = engine.check_thresholds(&metrics).await.unwrap();
        assert_eq!(first.len(), 1);

        // Inside the 60-minute cooldown: a larger breach still suppressed.
        let metrics = [MetricSample {
            kpi_name: "signups_per_hour".to_string(),
            value: 130.0,
            previous_value: None,
        }];
        let second = engine.check_thresholds(&metrics).await.unwrap();
        assert!(second.is_empty());

        // Simulate the cooldown having elapsed.
        engine
            .db
            .exec(
                "UPDATE kpi_thresholds SET last_alert_at = last_alert_at - 3700",
                [],
            )
            .unwrap();
        let third = engine.check_thresholds(&metrics).await.unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_critical_escalation() {
        let engine = engine();
        let mut c = content("error_rate");
        c.critical_threshold = Some(150.0);
        engine.create_threshold(c).unwrap();

        // Breaches the base threshold but not the critical bound.
        let warn = engine
            .check_thresholds(&[MetricSample {
                kpi_name: "error_rate".to_string(),
                value: 120.0,
                previous_value: None,
            }])
            .await
            .unwrap();
        assert_eq!(warn[0].severity, Severity::Warning);

        // Clear the cooldown, then breach both bounds.
        engine
            .db
            .exec("UPDATE kpi_thresholds SET last_alert_at = NULL", [])
            .unwrap();
        let critical = engine
            .check_thresholds(&[MetricSample {
                kpi_name: "error_rate".to_string(),
                value: 200.0,
                previous_value: None,
            }])
            .await
            .unwrap();
        assert_eq!(critical[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_disabled_thresholds_skipped() {
        let engine = engine();
        let mut c = content("kpi");
        c.enabled = false;
        engine.create_threshold(c).unwrap();

        let alerts = engine
            .check_thresholds(&[MetricSample {
                kpi_name: "kpi".to_string(),
                value: 1e9,
                previous_value: None,
            }])
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }
}
