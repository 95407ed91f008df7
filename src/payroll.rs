//! Bi-weekly payroll.
//!
//! An ambassador's pay for a period is hours worked (completed
//! assignments) times their hourly rate, plus CPA commission on validated
//! sign-ups. Calculation for one ambassador is serialized through a
//! per-ambassador advisory lock so concurrent runs cannot double-count.

use crate::bus::{types, EventBus};
use crate::db::{Database, DbError};
use crate::error::AppError;
use chrono::{NaiveDate, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayPeriod {
    pub id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: String,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollEntry {
    pub id: String,
    pub pay_period_id: String,
    pub ambassador_id: String,
    pub hours_total: f64,
    pub hourly_pay: f64,
    pub commission_pay: f64,
    pub signup_count: u32,
    pub total_pay: f64,
}

pub struct PayrollService {
    db: Arc<Database>,
    bus: Arc<EventBus>,
}

impl PayrollService {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    /// Find or create the pay period covering `[start, end]`.
    pub fn ensure_period(&self, start: NaiveDate, end: NaiveDate) -> Result<PayPeriod, AppError> {
        if end <= start {
            return Err(AppError::Validation("period end must follow start".into()));
        }
        let start_s = start.format("%Y-%m-%d").to_string();
        let end_s = end.format("%Y-%m-%d").to_string();

        match self.get_period_by_range(&start_s, &end_s)? {
            Some(period) => Ok(period),
            None => {
                let id = Uuid::new_v4().to_string();
                match self.db.exec(
                    "INSERT INTO pay_periods (id, period_start, period_end, status)
                     VALUES (?1, ?2, ?3, 'open')",
                    params![id, start_s, end_s],
                ) {
                    Ok(_) => {}
                    // Raced another creator; read the winner.
                    Err(DbError::Conflict(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.get_period_by_range(&start_s, &end_s)?
                    .ok_or_else(|| AppError::Internal("pay period vanished".into()))
            }
        }
    }

    fn get_period_by_range(&self, start: &str, end: &str) -> Result<Option<PayPeriod>, AppError> {
        match self.db.query_one(
            "SELECT id, period_start, period_end, status, processed_at
             FROM pay_periods WHERE period_start = ?1 AND period_end = ?2",
            params![start, end],
            row_to_period,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_period(&self, id: &str) -> Result<PayPeriod, AppError> {
        self.db
            .query_one(
                "SELECT id, period_start, period_end, status, processed_at
                 FROM pay_periods WHERE id = ?1",
                params![id],
                row_to_period,
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("pay period {id}")),
                other => other.into(),
            })
    }

    /// Compute (or recompute) one ambassador's entry for a period. Runs
    /// under the per-ambassador advisory lock.
    pub async fn compute_for_ambassador(
        &self,
        period_id: &str,
        ambassador_id: &str,
    ) -> Result<PayrollEntry, AppError> {
        let period = self.get_period(period_id)?;
        let _guard = self.db.advisory_lock("payroll", ambassador_id).await;

        let start = period.period_start.format("%Y-%m-%d").to_string();
        let end = period.period_end.format("%Y-%m-%d").to_string();

        let hourly_rate: f64 = self
            .db
            .query_one(
                "SELECT COALESCE(hourly_rate, 0) FROM ambassadors WHERE id = ?1",
                params![ambassador_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("ambassador {ambassador_id}")),
                other => other.into(),
            })?;

        // Completed assignments at events inside the window.
        let hours_total: f64 = self.db.query_one(
            "SELECT COALESCE(SUM(a.hours_worked), 0)
             FROM assignments a JOIN events e ON e.id = a.event_id
             WHERE a.ambassador_id = ?1 AND a.status = 'completed'
               AND e.event_date >= ?2 AND e.event_date <= ?3",
            params![ambassador_id, start, end],
            |row| row.get(0),
        )?;

        // Validated sign-ups with an assigned CPA in the window.
        let (commission_pay, signup_count): (f64, i64) = self.db.query_one(
            "SELECT COALESCE(SUM(cpa_amount), 0), COUNT(*)
             FROM sign_ups
             WHERE ambassador_id = ?1 AND validation_status = 'validated'
               AND cpa_amount IS NOT NULL
               AND date(submitted_at) >= ?2 AND date(submitted_at) <= ?3",
            params![ambassador_id, start, end],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let hourly_pay = (hours_total * hourly_rate * 100.0).round() / 100.0;
        let commission_pay = (commission_pay * 100.0).round() / 100.0;
        let total_pay = ((hourly_pay + commission_pay) * 100.0).round() / 100.0;
        let entry_id = Uuid::new_v4().to_string();

        // Entry upsert and sign-up tagging move together.
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO payroll_entries
                     (id, pay_period_id, ambassador_id, hours_total, hourly_pay, commission_pay,
                      signup_count, total_pay, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(pay_period_id, ambassador_id) DO UPDATE SET
                     hours_total = excluded.hours_total,
                     hourly_pay = excluded.hourly_pay,
                     commission_pay = excluded.commission_pay,
                     signup_count = excluded.signup_count,
                     total_pay = excluded.total_pay,
                     computed_at = excluded.computed_at",
                params![
                    entry_id,
                    period_id,
                    ambassador_id,
                    hours_total,
                    hourly_pay,
                    commission_pay,
                    signup_count,
                    total_pay,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tx.execute(
                "UPDATE sign_ups SET pay_period_id = ?1
                 WHERE ambassador_id = ?2 AND validation_status = 'validated'
                   AND date(submitted_at) >= ?3 AND date(submitted_at) <= ?4",
                params![period_id, ambassador_id, start, end],
            )?;
            Ok(())
        })?;

        self.get_entry(period_id, ambassador_id)
    }

    pub fn get_entry(
        &self,
        period_id: &str,
        ambassador_id: &str,
    ) -> Result<PayrollEntry, AppError> {
        self.db
            .query_one(
                "SELECT id, pay_period_id, ambassador_id, hours_total, hourly_pay, commission_pay,
                        signup_count, total_pay
                 FROM payroll_entries WHERE pay_period_id = ?1 AND ambassador_id = ?2",
                params![period_id, ambassador_id],
                |row| {
                    Ok(PayrollEntry {
                        id: row.get(0)?,
                        pay_period_id: row.get(1)?,
                        ambassador_id: row.get(2)?,
                        hours_total: row.get(3)?,
                        hourly_pay: row.get(4)?,
                        commission_pay: row.get(5)?,
                        signup_count: row.get::<_, i64>(6)? as u32,
                        total_pay: row.get(7)?,
                    })
                },
            )
            .map_err(|e| match e {
                DbError::NotFound => {
                    AppError::NotFound(format!("payroll entry for {ambassador_id}"))
                }
                other => other.into(),
            })
    }

    /// Run payroll for every active ambassador and close the period.
    pub async fn process_period(&self, period_id: &str) -> Result<Vec<PayrollEntry>, AppError> {
        let period = self.get_period(period_id)?;
        if period.status == "processed" {
            return Err(AppError::Conflict("pay period already processed".into()));
        }

        let ambassador_ids: Vec<String> = self.db.query_many(
            "SELECT id FROM ambassadors WHERE is_active = 1 ORDER BY id",
            [],
            |row| row.get(0),
        )?;

        let mut entries = Vec::with_capacity(ambassador_ids.len());
        for ambassador_id in &ambassador_ids {
            entries.push(self.compute_for_ambassador(period_id, ambassador_id).await?);
        }

        self.db.exec(
            "UPDATE pay_periods SET status = 'processed', processed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), period_id],
        )?;

        let total: f64 = entries.iter().map(|e| e.total_pay).sum();
        info!(period_id, ambassadors = entries.len(), total, "payroll processed");
        self.bus.publish(
            types::PAYROLL_PROCESSED,
            json!({
                "payPeriodId": period_id,
                "ambassadorCount": entries.len(),
                "totalPay": (total * 100.0).round() / 100.0,
            }),
            None,
        );

        Ok(entries)
    }
}

fn row_to_period(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayPeriod> {
    let start: String = row.get(1)?;
    let end: String = row.get(2)?;
    Ok(PayPeriod {
        id: row.get(0)?,
        period_start: NaiveDate::parse_from_str(&start, "%Y-%m-%d").unwrap_or_default(),
        period_end: NaiveDate::parse_from_str(&end, "%Y-%m-%d").unwrap_or_default(),
        status: row.get(3)?,
        processed_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ClientRegistry;

    fn service() -> PayrollService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(db.clone(), Arc::new(ClientRegistry::new()), 100));
        db.exec(
            "INSERT INTO ambassadors (id, first_name, last_name, hourly_rate, is_active)
             VALUES ('amb-1', 'Ann', 'Lee', 25.0, 1)",
            [],
        )
        .unwrap();
        db.exec(
            "INSERT INTO events (id, title, venue, event_date, timezone, status, created_at, updated_at)
             VALUES ('ev-1', 'Game Day', 'Arena', '2025-03-05', 'America/New_York', 'completed',
                     '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        db.exec(
            "INSERT INTO assignments (id, event_id, ambassador_id, status, hours_worked, created_at)
             VALUES ('as-1', 'ev-1', 'amb-1', 'completed', 6.0, '2025-03-05T00:00:00Z')",
            [],
        )
        .unwrap();
        db.exec(
            "INSERT INTO sign_ups (id, event_id, ambassador_id, operator_id, customer_email,
                                   submitted_at, validation_status, extraction_status,
                                   cpa_amount, idempotency_key)
             VALUES ('su-1', 'ev-1', 'amb-1', 7, 'a@b.com', '2025-03-05T19:00:00Z', 'validated',
                     'not_required', 125.0, 'k1'),
                    ('su-2', 'ev-1', 'amb-1', 7, 'c@d.com', '2025-03-06T19:00:00Z', 'validated',
                     'not_required', 125.0, 'k2'),
                    ('su-3', 'ev-1', 'amb-1', 7, 'e@f.com', '2025-03-06T20:00:00Z', 'pending',
                     'not_required', NULL, 'k3')",
            [],
        )
        .unwrap();
        PayrollService::new(db, bus)
    }

    fn period(svc: &PayrollService) -> PayPeriod {
        svc.ensure_period(
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_compute_combines_hours_and_commission() {
        let svc = service();
        let period = period(&svc);

        let entry = svc
            .compute_for_ambassador(&period.id, "amb-1")
            .await
            .unwrap();
        assert_eq!(entry.hours_total, 6.0);
        assert_eq!(entry.hourly_pay, 150.0); // 6h × $25
        assert_eq!(entry.commission_pay, 250.0); // 2 validated × $125
        assert_eq!(entry.signup_count, 2);
        assert_eq!(entry.total_pay, 400.0);

        // Validated sign-ups got tagged with the period.
        let tagged: i64 = svc
            .db
            .query_one(
                "SELECT COUNT(*) FROM sign_ups WHERE pay_period_id = ?1",
                params![period.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tagged, 2);
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let svc = service();
        let period = period(&svc);

        svc.compute_for_ambassador(&period.id, "amb-1").await.unwrap();
        let second = svc.compute_for_ambassador(&period.id, "amb-1").await.unwrap();
        assert_eq!(second.total_pay, 400.0);

        let entries: i64 = svc
            .db
            .query_one("SELECT COUNT(*) FROM payroll_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(entries, 1, "recompute updates in place");
    }

    #[tokio::test]
    async fn test_process_period_publishes_and_closes() {
        let svc = service();
        let period = period(&svc);

        let entries = svc.process_period(&period.id).await.unwrap();
        assert_eq!(entries.len(), 1);

        let processed = svc.get_period(&period.id).unwrap();
        assert_eq!(processed.status, "processed");

        // Second run conflicts.
        assert!(matches!(
            svc.process_period(&period.id).await,
            Err(AppError::Conflict(_))
        ));

        let published: i64 = svc
            .db
            .query_one(
                "SELECT COUNT(*) FROM domain_event_log WHERE event_type = 'payroll.processed'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(published, 1);
    }

    #[test]
    fn test_ensure_period_is_idempotent() {
        let svc = service();
        let a = period(&svc);
        let b = period(&svc);
        assert_eq!(a.id, b.id);

        assert!(matches!(
            svc.ensure_period(
                NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
            ),
            Err(AppError::Validation(_))
        ));
    }
}
