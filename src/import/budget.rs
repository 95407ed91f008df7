//! Budget / actuals importer.
//!
//! Rows carry a type column (`Budget` or `Actual`), the event date and
//! name, the fixed line items, then total/revenue/profit/margin%. Events
//! that don't exist yet are created as completed historical stubs so the
//! financials always have a home; totals are recomputed from line items and
//! a divergence beyond the rounding tolerance is surfaced as a warning.

use super::csv::parse_csv;
use super::parse::{detect_header, parse_currency, parse_date, venues_match};
use super::{BulkImporter, ImportOptions, ImportPreview, ImportSummary, RowStatus};
use crate::error::AppError;
use crate::models::{BudgetLines, EventFinancials};
use chrono::{NaiveDate, Utc};
use rusqlite::params;
use serde_json::json;
use uuid::Uuid;

const LINE_ITEM_KEYS: &[&str] = &[
    "staff",
    "reimbursements",
    "rewards",
    "base",
    "bonus_kickback",
    "parking",
    "setup",
    "additional_1",
    "additional_2",
    "additional_3",
    "additional_4",
];

const HEADER_KEYWORDS: &[(&str, &[&str])] = &[
    ("row_type", &["type", "row type", "row_type"]),
    ("date", &["date", "event date"]),
    ("event_name", &["event", "event name", "event_name"]),
    ("event_type", &["event type", "event_type"]),
    ("staff", &["staff"]),
    ("reimbursements", &["reimbursements", "reimb"]),
    ("rewards", &["rewards"]),
    ("base", &["base"]),
    ("bonus_kickback", &["bonus/kickback", "bonus", "kickback"]),
    ("parking", &["parking"]),
    ("setup", &["setup", "set up"]),
    ("additional_1", &["additional 1", "add'l 1", "additional_1"]),
    ("additional_2", &["additional 2", "add'l 2", "additional_2"]),
    ("additional_3", &["additional 3", "add'l 3", "additional_3"]),
    ("additional_4", &["additional 4", "add'l 4", "additional_4"]),
    ("total", &["total", "total cost"]),
    ("revenue", &["revenue"]),
    ("profit", &["profit"]),
    ("margin", &["margin", "margin%", "margin %"]),
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

fn default_mapping() -> Vec<(String, usize)> {
    let mut mapping = vec![
        ("row_type".to_string(), 0),
        ("date".to_string(), 1),
        ("event_name".to_string(), 2),
        ("event_type".to_string(), 3),
    ];
    for (offset, key) in LINE_ITEM_KEYS.iter().enumerate() {
        mapping.push((key.to_string(), 4 + offset));
    }
    let tail_start = 4 + LINE_ITEM_KEYS.len();
    mapping.push(("total".to_string(), tail_start));
    mapping.push(("revenue".to_string(), tail_start + 1));
    mapping.push(("profit".to_string(), tail_start + 2));
    mapping.push(("margin".to_string(), tail_start + 3));
    mapping
}

fn build_map(rows: &[Vec<String>]) -> (ColumnMap, usize, bool) {
    match detect_header(rows, HEADER_KEYWORDS) {
        Some((header_idx, mapping)) => (ColumnMap(mapping), header_idx + 1, true),
        None => (ColumnMap(default_mapping()), 0, false),
    }
}

fn parse_lines(map: &ColumnMap, row: &[String]) -> BudgetLines {
    let get = |key: &str| map.get(row, key).and_then(parse_currency).unwrap_or(0.0);
    BudgetLines {
        staff: get("staff"),
        reimbursements: get("reimbursements"),
        rewards: get("rewards"),
        base: get("base"),
        bonus_kickback: get("bonus_kickback"),
        parking: get("parking"),
        setup: get("setup"),
        additional_1: get("additional_1"),
        additional_2: get("additional_2"),
        additional_3: get("additional_3"),
        additional_4: get("additional_4"),
    }
}

impl BulkImporter {
    pub fn import_budget(
        &self,
        content: &str,
        options: &ImportOptions,
    ) -> Result<ImportSummary, AppError> {
        let mut state = self.begin("budget_actuals", content, options)?;
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

            let kind = match map.get(row, "row_type").map(|t| t.to_lowercase()) {
                Some(t) if t == "budget" => "budget",
                Some(t) if t == "actual" || t == "actuals" => "actual",
                other => {
                    let reason = format!("unknown row type `{}`", other.unwrap_or_default());
                    state.error_rows += 1;
                    state.push_error(format!("row {row_number}: {reason}"));
                    self.record_row(&state, row_number, RowStatus::Error, None, Some(&reason), &raw)?;
                    continue;
                }
            };

            let date = map
                .get(row, "date")
                .and_then(|d| parse_date(d, options.default_year));
            let event_name = map.get(row, "event_name");
            let (Some(date), Some(event_name)) = (date, event_name) else {
                state.error_rows += 1;
                state.push_error(format!("row {row_number}: missing date or event name"));
                self.record_row(
                    &state,
                    row_number,
                    RowStatus::Error,
                    None,
                    Some("missing date or event name"),
                    &raw,
                )?;
                continue;
            };

            let event_id = match self.find_event_by_date_title(date, event_name)? {
                Some(id) => id,
                None => {
                    // Stub event so the financials row has a home.
                    let event_id = Uuid::new_v4().to_string();
                    let now = Utc::now().to_rfc3339();
                    self.db.exec(
                        "INSERT INTO events
                             (id, title, venue, event_date, timezone, event_type, status,
                              import_batch_id, created_at, updated_at)
                         VALUES (?1, ?2, ?2, ?3, 'America/New_York', ?4, 'completed', ?5, ?6, ?6)",
                        params![
                            event_id,
                            event_name,
                            date.format("%Y-%m-%d").to_string(),
                            map.get(row, "event_type"),
                            state.id,
                            now,
                        ],
                    )?;
                    self.audit(&state, "event", &event_id, "create", Some(event_name))?;
                    event_id
                }
            };

            let mut financials = EventFinancials {
                event_id: event_id.clone(),
                kind: kind.to_string(),
                lines: parse_lines(&map, row),
                total: 0.0,
                revenue: map.get(row, "revenue").and_then(parse_currency).unwrap_or(0.0),
                profit: 0.0,
                // Derived server-side; the sheet's margin column is advisory.
                margin_percent: None,
                updated_at: Utc::now(),
            };
            let reported_total = map.get(row, "total").and_then(parse_currency);
            financials.recompute();

            if let Some(reported) = reported_total {
                if (reported - financials.total).abs() > 0.01 {
                    state.push_warning(format!(
                        "row {row_number}: reported total {reported:.2} differs from line-item sum {:.2}",
                        financials.total
                    ));
                }
            }

            let apply = self.db.transaction(|tx| {
                tx.execute(
                    "INSERT INTO event_financials
                         (event_id, kind, staff, reimbursements, rewards, base, bonus_kickback,
                          parking, setup, additional_1, additional_2, additional_3, additional_4,
                          total, revenue, profit, margin_percent, import_batch_id, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                     ON CONFLICT(event_id, kind) DO UPDATE SET
                         staff = excluded.staff,
                         reimbursements = excluded.reimbursements,
                         rewards = excluded.rewards,
                         base = excluded.base,
                         bonus_kickback = excluded.bonus_kickback,
                         parking = excluded.parking,
                         setup = excluded.setup,
                         additional_1 = excluded.additional_1,
                         additional_2 = excluded.additional_2,
                         additional_3 = excluded.additional_3,
                         additional_4 = excluded.additional_4,
                         total = excluded.total,
                         revenue = excluded.revenue,
                         profit = excluded.profit,
                         margin_percent = excluded.margin_percent,
                         updated_at = excluded.updated_at",
                    params![
                        financials.event_id,
                        financials.kind,
                        financials.lines.staff,
                        financials.lines.reimbursements,
                        financials.lines.rewards,
                        financials.lines.base,
                        financials.lines.bonus_kickback,
                        financials.lines.parking,
                        financials.lines.setup,
                        financials.lines.additional_1,
                        financials.lines.additional_2,
                        financials.lines.additional_3,
                        financials.lines.additional_4,
                        financials.total,
                        financials.revenue,
                        financials.profit,
                        financials.margin_percent,
                        state.id,
                        financials.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            });

            match apply {
                Ok(()) => {
                    state.processed_rows += 1;
                    self.record_row(&state, row_number, RowStatus::Success, Some("upsert"), None, &raw)?;
                    self.audit(
                        &state,
                        "event_financials",
                        &format!("{event_id}:{kind}"),
                        "upsert",
                        Some(&format!("total={:.2}", financials.total)),
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

    pub fn preview_budget(
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
            let date = map
                .get(row, "date")
                .and_then(|d| parse_date(d, options.default_year));
            let event_name = map.get(row, "event_name");
            let (Some(date), Some(event_name)) = (date, event_name) else {
                unresolved += 1;
                continue;
            };
            if self.find_event_by_date_title(date, event_name)?.is_none() {
                unresolved += 1;
            } else {
                would_be_duplicates += 1;
            }

            if sample.len() < 10 {
                let lines = parse_lines(&map, row);
                sample.push(json!({
                    "rowType": map.get(row, "row_type"),
                    "date": date.format("%Y-%m-%d").to_string(),
                    "eventName": event_name,
                    "lineItemSum": (lines.sum() * 100.0).round() / 100.0,
                    "revenue": map.get(row, "revenue").and_then(parse_currency),
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

    fn find_event_by_date_title(
        &self,
        date: NaiveDate,
        title: &str,
    ) -> Result<Option<String>, crate::db::DbError> {
        let candidates: Vec<(String, String)> = self.db.query_many(
            "SELECT id, title FROM events WHERE event_date = ?1",
            params![date.format("%Y-%m-%d").to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(candidates
            .into_iter()
            .find(|(_, existing)| venues_match(existing, title))
            .map(|(id, _)| id))
    }
}
