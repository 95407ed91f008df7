//! Historical sign-up importer.
//!
//! Rows: `date, ambassador, customer_email, customer_name?, operator,
//! state?, cpa?`. Unresolved ambassadors or operators are hard errors here
//! (a sign-up without either is unusable for payroll); duplicates skip.

use super::csv::parse_csv;
use super::parse::{detect_header, parse_currency, parse_date};
use super::resolve::{resolve_ambassador, resolve_operator};
use super::{BulkImporter, ImportOptions, ImportPreview, ImportSummary, RowStatus};
use crate::error::AppError;
use crate::signup::SignUpStore;
use chrono::NaiveDate;
use rusqlite::params;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const HEADER_KEYWORDS: &[(&str, &[&str])] = &[
    ("date", &["date", "signup date", "sign-up date"]),
    ("ambassador", &["ambassador", "ambassador name", "rep"]),
    ("email", &["email", "customer email", "customer_email"]),
    ("name", &["name", "customer name", "customer_name"]),
    ("operator", &["operator", "book", "sportsbook"]),
    ("state", &["state", "st"]),
    ("cpa", &["cpa", "cpa amount", "commission"]),
];

/// Column order when no header row is present.
const DEFAULT_MAPPING: &[(&str, usize)] = &[
    ("date", 0),
    ("ambassador", 1),
    ("email", 2),
    ("name", 3),
    ("operator", 4),
    ("state", 5),
    ("cpa", 6),
];

struct ColumnMap(Vec<(String, usize)>);

impl ColumnMap {
    fn get<'a>(&self, row: &'a [String], key: &str) -> Option<&'a str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, idx)| row.get(*idx))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

struct ParsedRow {
    date: NaiveDate,
    ambassador_raw: String,
    email: String,
    name: Option<String>,
    operator_raw: String,
    state: Option<String>,
    cpa: Option<f64>,
}

fn parse_row(
    map: &ColumnMap,
    row: &[String],
    default_year: Option<i32>,
) -> Result<ParsedRow, String> {
    let date_raw = map.get(row, "date").ok_or("missing date")?;
    let date = parse_date(date_raw, default_year)
        .ok_or_else(|| format!("unparseable date `{date_raw}`"))?;

    let email = map
        .get(row, "email")
        .ok_or("missing customer email")?
        .to_lowercase();
    if !email.contains('@') {
        return Err(format!("`{email}` is not an email address"));
    }

    Ok(ParsedRow {
        date,
        ambassador_raw: map.get(row, "ambassador").unwrap_or_default().to_string(),
        email,
        name: map.get(row, "name").map(String::from),
        operator_raw: map.get(row, "operator").unwrap_or_default().to_string(),
        state: map
            .get(row, "state")
            .map(|s| s.to_uppercase())
            .filter(|s| s.len() == 2),
        cpa: map.get(row, "cpa").and_then(parse_currency),
    })
}

fn build_map(rows: &[Vec<String>]) -> (ColumnMap, usize, bool) {
    match detect_header(rows, HEADER_KEYWORDS) {
        Some((header_idx, mapping)) => (ColumnMap(mapping), header_idx + 1, true),
        None => (
            ColumnMap(
                DEFAULT_MAPPING
                    .iter()
                    .map(|(k, i)| (k.to_string(), *i))
                    .collect(),
            ),
            0,
            false,
        ),
    }
}

impl BulkImporter {
    pub fn import_signups(
        &self,
        content: &str,
        options: &ImportOptions,
    ) -> Result<ImportSummary, AppError> {
        let mut state = self.begin("signups", content, options)?;
        let store = SignUpStore::new(Arc::clone(&self.db));

        let rows = parse_csv(content);
        let (map, data_start, _) = build_map(&rows);

        for (idx, row) in rows.iter().enumerate().skip(data_start) {
            if self.is_cancelled(&state.id) {
                state.cancelled = true;
                break;
            }
            let row_number = idx as u32 + 1;
            state.total_rows += 1;
            let raw = row.join(",");

            let parsed = match parse_row(&map, row, options.default_year) {
                Ok(p) => p,
                Err(reason) => {
                    state.error_rows += 1;
                    state.push_error(format!("row {row_number}: {reason}"));
                    self.record_row(&state, row_number, RowStatus::Error, None, Some(&reason), &raw)?;
                    continue;
                }
            };

            // Sign-ups are unusable without both parties resolved.
            let ambassador = match resolve_ambassador(&self.db, &parsed.ambassador_raw)? {
                Some(a) => a,
                None => {
                    let reason = format!("unresolved ambassador `{}`", parsed.ambassador_raw);
                    state.error_rows += 1;
                    state.push_error(format!("row {row_number}: {reason}"));
                    self.record_row(&state, row_number, RowStatus::Error, None, Some(&reason), &raw)?;
                    continue;
                }
            };
            let operator_id = match resolve_operator(&self.db, &parsed.operator_raw)? {
                Some(id) => id,
                None => {
                    let reason = format!("unresolved operator `{}`", parsed.operator_raw);
                    state.error_rows += 1;
                    state.push_error(format!("row {row_number}: {reason}"));
                    self.record_row(&state, row_number, RowStatus::Error, None, Some(&reason), &raw)?;
                    continue;
                }
            };

            // Duplicate rule for historical rows: same customer, operator,
            // and day.
            if self.signup_exists(&parsed.email, operator_id, parsed.date)? {
                state.skipped_duplicates += 1;
                self.record_row(
                    &state,
                    row_number,
                    RowStatus::Duplicate,
                    None,
                    Some("existing sign-up for (email, operator, date)"),
                    &raw,
                )?;
                continue;
            }

            let rate = match &parsed.state {
                Some(st) => store.lookup_rate(operator_id, st, parsed.date)?,
                None => None,
            };
            let cpa_amount = parsed.cpa.or(rate.as_ref().map(|r| r.cpa_amount));

            let sign_up_id = Uuid::new_v4().to_string();
            let submitted_at = parsed
                .date
                .and_hms_opt(12, 0, 0)
                .map(|dt| dt.and_utc().to_rfc3339())
                .unwrap_or_default();
            let idempotency_key = format!("import-{}-row-{}", state.id, row_number);
            let touchpoint = format!("import:{}", state.id);
            let rate_id = rate.as_ref().map(|r| r.id.clone());
            let rate_amount = rate.as_ref().map(|r| r.cpa_amount);

            let apply = self.db.transaction(|tx| {
                tx.execute(
                    "INSERT INTO sign_ups
                         (id, solo_chat_id, ambassador_id, operator_id, customer_email,
                          customer_name, customer_state, submitted_at, validation_status,
                          extraction_status, cpa_amount, idempotency_key, import_batch_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'validated', 'not_required', ?9, ?10, ?11)",
                    params![
                        sign_up_id,
                        touchpoint,
                        ambassador.id,
                        operator_id,
                        parsed.email,
                        parsed.name,
                        parsed.state,
                        submitted_at,
                        cpa_amount,
                        idempotency_key,
                        state.id,
                    ],
                )?;
                if let (Some(rate_id), Some(amount)) = (&rate_id, rate_amount) {
                    tx.execute(
                        "INSERT INTO cpa_attributions (id, sign_up_id, cpa_rate_id, amount, attributed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            Uuid::new_v4().to_string(),
                            sign_up_id,
                            rate_id,
                            amount,
                            chrono::Utc::now().to_rfc3339()
                        ],
                    )?;
                }
                Ok(())
            });

            match apply {
                Ok(()) => {
                    state.processed_rows += 1;
                    self.record_row(&state, row_number, RowStatus::Success, Some("create"), None, &raw)?;
                    self.audit(
                        &state,
                        "sign_up",
                        &sign_up_id,
                        "create",
                        Some(&format!("email={} operator={}", parsed.email, operator_id)),
                    )?;
                }
                Err(e) => {
                    state.error_rows += 1;
                    state.push_error(format!("row {row_number}: {e}"));
                    self.record_row(
                        &state,
                        row_number,
                        RowStatus::Error,
                        None,
                        Some(&e.to_string()),
                        &raw,
                    )?;
                }
            }
        }

        self.finalize(state).map_err(Into::into)
    }

    /// Parse + resolve + dedupe, writing nothing.
    pub fn preview_signups(
        &self,
        content: &str,
        options: &ImportOptions,
    ) -> Result<ImportPreview, AppError> {
        let rows = parse_csv(content);
        let (map, data_start, header_detected) = build_map(&rows);

        let mut sample = Vec::new();
        let mut would_be_duplicates = 0u32;
        let mut unresolved = 0u32;
        let mut total = 0u32;

        for row in rows.iter().skip(data_start) {
            total += 1;
            let Ok(parsed) = parse_row(&map, row, options.default_year) else {
                unresolved += 1;
                continue;
            };

            let ambassador = resolve_ambassador(&self.db, &parsed.ambassador_raw)?;
            let operator = resolve_operator(&self.db, &parsed.operator_raw)?;
            if ambassador.is_none() || operator.is_none() {
                unresolved += 1;
            }
            if let Some(operator_id) = operator {
                if self.signup_exists(&parsed.email, operator_id, parsed.date)? {
                    would_be_duplicates += 1;
                }
            }

            if sample.len() < 10 {
                sample.push(json!({
                    "date": parsed.date.format("%Y-%m-%d").to_string(),
                    "ambassador": parsed.ambassador_raw,
                    "email": parsed.email,
                    "operator": parsed.operator_raw,
                    "state": parsed.state,
                    "cpa": parsed.cpa,
                    "ambassadorResolved": ambassador.is_some(),
                    "operatorResolved": operator.is_some(),
                }));
            }
        }

        Ok(ImportPreview {
            total_rows: total,
            sample_rows: sample,
            column_mapping: map.0,
            header_detected,
            would_be_duplicates,
            unresolved_entities: unresolved,
        })
    }

    fn signup_exists(
        &self,
        email: &str,
        operator_id: i64,
        date: NaiveDate,
    ) -> Result<bool, crate::db::DbError> {
        let count: i64 = self.db.query_one(
            "SELECT COUNT(*) FROM sign_ups
             WHERE customer_email = ?1 AND operator_id = ?2 AND date(submitted_at) = ?3",
            params![email, operator_id, date.format("%Y-%m-%d").to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
