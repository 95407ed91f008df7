//! Sign-up row persistence.

use crate::db::{Database, DbError};
use crate::models::{
    CpaRate, ExtractedFields, ExtractionStatus, SignUp, SyncFailure, SyncPhase, ValidationStatus,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Row};
use std::sync::Arc;

pub struct SignUpStore {
    db: Arc<Database>,
}

fn row_to_sign_up(row: &Row<'_>) -> rusqlite::Result<SignUp> {
    let submitted_at: String = row.get(8)?;
    let validation: String = row.get(9)?;
    let extraction: String = row.get(10)?;
    Ok(SignUp {
        id: row.get(0)?,
        event_id: row.get(1)?,
        solo_chat_id: row.get(2)?,
        ambassador_id: row.get(3)?,
        operator_id: row.get(4)?,
        customer_email: row.get(5)?,
        customer_name: row.get(6)?,
        customer_state: row.get(7)?,
        submitted_at: DateTime::parse_from_rfc3339(&submitted_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        validation_status: ValidationStatus::from_str(&validation)
            .unwrap_or(ValidationStatus::Pending),
        extraction_status: ExtractionStatus::from_str(&extraction)
            .unwrap_or(ExtractionStatus::NotRequired),
        extracted: ExtractedFields {
            bet_amount: row.get(11)?,
            team_bet_on: row.get(12)?,
            odds: row.get(13)?,
            extraction_confidence: row.get(14)?,
        },
        image_key: row.get(15)?,
        cpa_amount: row.get(16)?,
        pay_period_id: row.get(17)?,
        idempotency_key: row.get(18)?,
    })
}

const SIGN_UP_COLUMNS: &str = "id, event_id, solo_chat_id, ambassador_id, operator_id, \
     customer_email, customer_name, customer_state, submitted_at, validation_status, \
     extraction_status, bet_amount, team_bet_on, odds, extraction_confidence, image_key, \
     cpa_amount, pay_period_id, idempotency_key";

impl SignUpStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, sign_up: &SignUp) -> Result<(), DbError> {
        self.db.exec(
            "INSERT INTO sign_ups
                 (id, event_id, solo_chat_id, ambassador_id, operator_id, customer_email,
                  customer_name, customer_state, submitted_at, validation_status,
                  extraction_status, image_key, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                sign_up.id,
                sign_up.event_id,
                sign_up.solo_chat_id,
                sign_up.ambassador_id,
                sign_up.operator_id,
                sign_up.customer_email,
                sign_up.customer_name,
                sign_up.customer_state,
                sign_up.submitted_at.to_rfc3339(),
                sign_up.validation_status.as_str(),
                sign_up.extraction_status.as_str(),
                sign_up.image_key,
                sign_up.idempotency_key,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<SignUp, DbError> {
        self.db.query_one(
            &format!("SELECT {SIGN_UP_COLUMNS} FROM sign_ups WHERE id = ?1"),
            params![id],
            row_to_sign_up,
        )
    }

    pub fn find_by_idempotency(
        &self,
        operator_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<SignUp>, DbError> {
        match self.db.query_one(
            &format!(
                "SELECT {SIGN_UP_COLUMNS} FROM sign_ups
                 WHERE operator_id = ?1 AND idempotency_key = ?2"
            ),
            params![operator_id, idempotency_key],
            row_to_sign_up,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// An earlier live sign-up for the same customer/operator pair.
    pub fn find_live_duplicate(
        &self,
        email_lower: &str,
        operator_id: i64,
        exclude_id: &str,
    ) -> Result<Option<SignUp>, DbError> {
        match self.db.query_one(
            &format!(
                "SELECT {SIGN_UP_COLUMNS} FROM sign_ups
                 WHERE customer_email = ?1 AND operator_id = ?2 AND id != ?3
                   AND validation_status IN ('pending', 'validated')
                 ORDER BY submitted_at ASC LIMIT 1"
            ),
            params![email_lower, operator_id, exclude_id],
            row_to_sign_up,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_validation_status(
        &self,
        id: &str,
        status: ValidationStatus,
        cpa_amount: Option<f64>,
    ) -> Result<(), DbError> {
        self.db.exec(
            "UPDATE sign_ups SET validation_status = ?1, cpa_amount = ?2 WHERE id = ?3",
            params![status.as_str(), cpa_amount, id],
        )?;
        Ok(())
    }

    pub fn set_extraction(
        &self,
        id: &str,
        status: ExtractionStatus,
        fields: &ExtractedFields,
    ) -> Result<(), DbError> {
        self.db.exec(
            "UPDATE sign_ups
             SET extraction_status = ?1, bet_amount = ?2, team_bet_on = ?3,
                 odds = ?4, extraction_confidence = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                fields.bet_amount,
                fields.team_bet_on,
                fields.odds,
                fields.extraction_confidence,
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_extraction_status(
        &self,
        id: &str,
        status: ExtractionStatus,
    ) -> Result<(), DbError> {
        self.db.exec(
            "UPDATE sign_ups SET extraction_status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn review_queue(&self, limit: u32) -> Result<Vec<SignUp>, DbError> {
        self.db.query_many(
            &format!(
                "SELECT {SIGN_UP_COLUMNS} FROM sign_ups
                 WHERE extraction_status = 'needs_review'
                 ORDER BY submitted_at ASC LIMIT ?1"
            ),
            params![limit],
            row_to_sign_up,
        )
    }

    pub fn list(
        &self,
        from_date: Option<NaiveDate>,
        to_date: Option<NaiveDate>,
        operator_id: Option<i64>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<SignUp>, u64), DbError> {
        // Inclusive date window on the submission day.
        let from = from_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "0000-01-01".to_string());
        let to = to_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "9999-12-31".to_string());
        let operator_min = operator_id.unwrap_or(i64::MIN);
        let operator_max = operator_id.unwrap_or(i64::MAX);

        let rows = self.db.query_many(
            &format!(
                "SELECT {SIGN_UP_COLUMNS} FROM sign_ups
                 WHERE date(submitted_at) >= ?1 AND date(submitted_at) <= ?2
                   AND operator_id >= ?3 AND operator_id <= ?4
                 ORDER BY submitted_at DESC LIMIT ?5 OFFSET ?6"
            ),
            params![from, to, operator_min, operator_max, limit, offset],
            row_to_sign_up,
        )?;
        let total: i64 = self.db.query_one(
            "SELECT COUNT(*) FROM sign_ups
             WHERE date(submitted_at) >= ?1 AND date(submitted_at) <= ?2
               AND operator_id >= ?3 AND operator_id <= ?4",
            params![from, to, operator_min, operator_max],
            |row| row.get(0),
        )?;
        Ok((rows, total as u64))
    }

    /// CpaRate lookup rule: newest effective rate covering the date, active
    /// rows only.
    pub fn lookup_rate(
        &self,
        operator_id: i64,
        state_code: &str,
        on: NaiveDate,
    ) -> Result<Option<CpaRate>, DbError> {
        let on = on.format("%Y-%m-%d").to_string();
        match self.db.query_one(
            "SELECT id, operator_id, state_code, cpa_amount, effective_date, end_date, is_active
             FROM cpa_rates
             WHERE operator_id = ?1 AND state_code = ?2 AND is_active = 1
               AND effective_date <= ?3
               AND (end_date IS NULL OR end_date >= ?3)
             ORDER BY effective_date DESC LIMIT 1",
            params![operator_id, state_code, on],
            |row| {
                let effective: String = row.get(4)?;
                let end: Option<String> = row.get(5)?;
                Ok(CpaRate {
                    id: row.get(0)?,
                    operator_id: row.get(1)?,
                    state_code: row.get(2)?,
                    cpa_amount: row.get(3)?,
                    effective_date: NaiveDate::parse_from_str(&effective, "%Y-%m-%d")
                        .unwrap_or_default(),
                    end_date: end
                        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
                    is_active: row.get::<_, i64>(6)? != 0,
                })
            },
        ) {
            Ok(rate) => Ok(Some(rate)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn operator_auto_validates(&self, operator_id: i64) -> Result<bool, DbError> {
        match self.db.query_one(
            "SELECT auto_validate FROM operators WHERE id = ?1",
            params![operator_id],
            |row| Ok(row.get::<_, i64>(0)? != 0),
        ) {
            Ok(v) => Ok(v),
            Err(DbError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn append_audit(
        &self,
        sign_up_id: &str,
        action: &str,
        actor: &str,
        detail: Option<&str>,
    ) -> Result<(), DbError> {
        self.db.exec(
            "INSERT INTO sign_up_audit (sign_up_id, action, actor, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sign_up_id, action, actor, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn audit_trail(&self, sign_up_id: &str) -> Result<Vec<(String, String, Option<String>, String)>, DbError> {
        self.db.query_many(
            "SELECT action, actor, detail, at FROM sign_up_audit
             WHERE sign_up_id = ?1 ORDER BY id ASC",
            params![sign_up_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            },
        )
    }

    // -- sync failures ------------------------------------------------------

    pub fn record_sync_failure(
        &self,
        sign_up_id: &str,
        phase: SyncPhase,
        error_type: &str,
        error_message: &str,
    ) -> Result<(), DbError> {
        self.db.exec(
            "INSERT INTO sync_failures
                 (id, sign_up_id, sync_phase, error_type, error_message, last_attempt_at, attempt_count, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0)
             ON CONFLICT(sign_up_id, sync_phase) DO UPDATE SET
                 error_type = excluded.error_type,
                 error_message = excluded.error_message,
                 last_attempt_at = excluded.last_attempt_at,
                 attempt_count = attempt_count + 1,
                 resolved = 0",
            params![
                uuid::Uuid::new_v4().to_string(),
                sign_up_id,
                phase.as_str(),
                error_type,
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn resolve_sync_failure(&self, sign_up_id: &str, phase: SyncPhase) -> Result<(), DbError> {
        self.db.exec(
            "UPDATE sync_failures SET resolved = 1 WHERE sign_up_id = ?1 AND sync_phase = ?2",
            params![sign_up_id, phase.as_str()],
        )?;
        Ok(())
    }

    pub fn get_sync_failure(&self, failure_id: &str) -> Result<SyncFailure, DbError> {
        self.db.query_one(
            "SELECT id, sign_up_id, sync_phase, error_type, error_message, last_attempt_at,
                    attempt_count, resolved
             FROM sync_failures WHERE id = ?1",
            params![failure_id],
            row_to_sync_failure,
        )
    }

    pub fn list_sync_failures(&self, include_resolved: bool) -> Result<Vec<SyncFailure>, DbError> {
        let min_resolved = if include_resolved { 1 } else { 0 };
        self.db.query_many(
            "SELECT id, sign_up_id, sync_phase, error_type, error_message, last_attempt_at,
                    attempt_count, resolved
             FROM sync_failures WHERE resolved <= ?1
             ORDER BY last_attempt_at DESC",
            params![min_resolved],
            row_to_sync_failure,
        )
    }
}

fn row_to_sync_failure(row: &Row<'_>) -> rusqlite::Result<SyncFailure> {
    let phase: String = row.get(2)?;
    let last_attempt: String = row.get(5)?;
    Ok(SyncFailure {
        id: row.get(0)?,
        sign_up_id: row.get(1)?,
        sync_phase: SyncPhase::from_str(&phase).unwrap_or(SyncPhase::Initial),
        error_type: row.get(3)?,
        error_message: row.get(4)?,
        last_attempt_at: DateTime::parse_from_rfc3339(&last_attempt)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        attempt_count: row.get::<_, i64>(6)? as u32,
        resolved: row.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SignUpStore {
        SignUpStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn seed_rate(store: &SignUpStore, operator: i64, state: &str, amount: f64, effective: &str, end: Option<&str>, active: bool) {
        store
            .db
            .exec(
                "INSERT INTO cpa_rates (id, operator_id, state_code, cpa_amount, effective_date, end_date, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    operator,
                    state,
                    amount,
                    effective,
                    end,
                    active as i64
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_rate_lookup_selects_newest_covering() {
        let store = store();
        seed_rate(&store, 7, "NJ", 100.0, "2024-01-01", None, true);
        seed_rate(&store, 7, "NJ", 125.0, "2025-01-01", None, true);
        seed_rate(&store, 7, "NJ", 150.0, "2026-01-01", None, true);

        let on = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let rate = store.lookup_rate(7, "NJ", on).unwrap().unwrap();
        assert_eq!(rate.cpa_amount, 125.0);
    }

    #[test]
    fn test_rate_lookup_honors_end_date_and_active() {
        let store = store();
        seed_rate(&store, 7, "PA", 90.0, "2024-01-01", Some("2024-12-31"), true);
        seed_rate(&store, 7, "PA", 95.0, "2025-01-01", None, false);

        let on = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert!(store.lookup_rate(7, "PA", on).unwrap().is_none());

        let covered = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let rate = store.lookup_rate(7, "PA", covered).unwrap().unwrap();
        assert_eq!(rate.cpa_amount, 90.0);
    }

    #[test]
    fn test_sync_failure_upsert_increments_attempts() {
        let store = store();
        store
            .record_sync_failure("su-1", SyncPhase::Initial, "network", "ECONNRESET")
            .unwrap();
        store
            .record_sync_failure("su-1", SyncPhase::Initial, "server_error", "503")
            .unwrap();

        let failures = store.list_sync_failures(false).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt_count, 2);
        assert_eq!(failures[0].error_type, "server_error");

        store
            .resolve_sync_failure("su-1", SyncPhase::Initial)
            .unwrap();
        assert!(store.list_sync_failures(false).unwrap().is_empty());
    }
}
