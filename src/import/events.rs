//! Historical event importer.
//!
//! Rows: `event_date, venue, city, state, ambassadors, signups,
//! [event_type, start_time, end_time, notes]`. Duplicate venues on the same
//! date merge into the existing event: notes append unconditionally and the
//! row counts as an update even when no field changed, which keeps the
//! audit trail complete across repeated exports.

use super::csv::parse_csv;
use super::parse::{detect_header, parse_date, split_ambassadors, venues_match};
use super::resolve::resolve_ambassador;
use super::{BulkImporter, ImportOptions, ImportPreview, ImportSummary, RowStatus};
use crate::error::AppError;
use chrono::{NaiveDate, Utc};
use rusqlite::params;
use serde_json::json;
use uuid::Uuid;

const HEADER_KEYWORDS: &[(&str, &[&str])] = &[
    ("event_date", &["event date", "event_date", "date"]),
    ("venue", &["venue", "location"]),
    ("city", &["city"]),
    ("state", &["state", "st"]),
    ("ambassadors", &["ambassadors", "ambassador", "staff", "reps"]),
    ("signups", &["signups", "sign-ups", "sign ups", "total signups"]),
    ("event_type", &["event type", "event_type", "type"]),
    ("start_time", &["start time", "start_time", "start"]),
    ("end_time", &["end time", "end_time", "end"]),
    ("notes", &["notes", "comments"]),
];

const DEFAULT_MAPPING: &[(&str, usize)] = &[
    ("event_date", 0),
    ("venue", 1),
    ("city", 2),
    ("state", 3),
    ("ambassadors", 4),
    ("signups", 5),
    ("event_type", 6),
    ("start_time", 7),
    ("end_time", 8),
    ("notes", 9),
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
    pub fn import_events(
        &self,
        content: &str,
        options: &ImportOptions,
    ) -> Result<ImportSummary, AppError> {
        let mut state = self.begin("events", content, options)?;
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

            let Some(date) = map
                .get(row, "event_date")
                .and_then(|d| parse_date(d, options.default_year))
            else {
                state.error_rows += 1;
                state.push_error(format!("row {row_number}: missing or unparseable event date"));
                self.record_row(&state, row_number, RowStatus::Error, None, Some("bad date"), &raw)?;
                continue;
            };
            let Some(venue) = map.get(row, "venue") else {
                state.error_rows += 1;
                state.push_error(format!("row {row_number}: missing venue"));
                self.record_row(&state, row_number, RowStatus::Error, None, Some("missing venue"), &raw)?;
                continue;
            };

            let notes = map.get(row, "notes");
            let event_id = match self.find_event_by_date_venue(date, venue)? {
                Some(existing_id) => {
                    // Merge path: notes append unconditionally; the row is an
                    // update even when nothing else changed.
                    if let Some(notes) = notes {
                        self.db.exec(
                            "UPDATE events
                             SET notes = CASE WHEN notes IS NULL OR notes = '' THEN ?1
                                              ELSE notes || char(10) || ?1 END,
                                 updated_at = ?2
                             WHERE id = ?3",
                            params![notes, Utc::now().to_rfc3339(), existing_id],
                        )?;
                    } else {
                        self.db.exec(
                            "UPDATE events SET updated_at = ?1 WHERE id = ?2",
                            params![Utc::now().to_rfc3339(), existing_id],
                        )?;
                    }
                    state.processed_rows += 1;
                    self.record_row(
                        &state,
                        row_number,
                        RowStatus::Success,
                        Some("update"),
                        Some("merged into existing event"),
                        &raw,
                    )?;
                    self.audit(&state, "event", &existing_id, "update", Some(venue))?;
                    existing_id
                }
                None => {
                    let event_id = Uuid::new_v4().to_string();
                    let now = Utc::now().to_rfc3339();
                    self.db.exec(
                        "INSERT INTO events
                             (id, title, venue, event_date, start_time, end_time, timezone, city,
                              state, event_type, notes, status, import_batch_id, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'America/New_York', ?7, ?8, ?9, ?10,
                                 'completed', ?11, ?12, ?12)",
                        params![
                            event_id,
                            venue, // historical exports title events by venue
                            venue,
                            date.format("%Y-%m-%d").to_string(),
                            map.get(row, "start_time"),
                            map.get(row, "end_time"),
                            map.get(row, "city"),
                            map.get(row, "state").map(|s| s.to_uppercase()),
                            map.get(row, "event_type"),
                            notes,
                            state.id,
                            now,
                        ],
                    )?;
                    state.processed_rows += 1;
                    self.record_row(&state, row_number, RowStatus::Success, Some("create"), None, &raw)?;
                    self.audit(
                        &state,
                        "event",
                        &event_id,
                        "create",
                        Some(&format!(
                            "venue={} signups={}",
                            venue,
                            map.get(row, "signups").unwrap_or("0")
                        )),
                    )?;
                    event_id
                }
            };

            // Ambassadors: unresolved names warn and simply omit the
            // assignment; the event row stays.
            for name in split_ambassadors(map.get(row, "ambassadors").unwrap_or_default()) {
                match resolve_ambassador(&self.db, &name)? {
                    Some(ambassador) => {
                        let inserted = self.db.exec(
                            "INSERT OR IGNORE INTO assignments
                                 (id, event_id, ambassador_id, status, created_at)
                             VALUES (?1, ?2, ?3, 'completed', ?4)",
                            params![
                                Uuid::new_v4().to_string(),
                                event_id,
                                ambassador.id,
                                Utc::now().to_rfc3339()
                            ],
                        )?;
                        if inserted > 0 {
                            self.audit(&state, "assignment", &ambassador.id, "link", Some(&event_id))?;
                        }
                    }
                    None => {
                        state.push_warning(format!(
                            "row {row_number}: unresolved ambassador `{name}` (assignment omitted)"
                        ));
                    }
                }
            }
        }

        self.finalize(state).map_err(Into::into)
    }

    pub fn preview_events(
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
                .get(row, "event_date")
                .and_then(|d| parse_date(d, options.default_year));
            let venue = map.get(row, "venue");
            let (Some(date), Some(venue)) = (date, venue) else {
                unresolved += 1;
                continue;
            };

            if self.find_event_by_date_venue(date, venue)?.is_some() {
                would_be_duplicates += 1;
            }
            let ambassadors = split_ambassadors(map.get(row, "ambassadors").unwrap_or_default());
            for name in &ambassadors {
                if resolve_ambassador(&self.db, name)?.is_none() {
                    unresolved += 1;
                }
            }

            if sample.len() < 10 {
                sample.push(json!({
                    "eventDate": date.format("%Y-%m-%d").to_string(),
                    "venue": venue,
                    "city": map.get(row, "city"),
                    "state": map.get(row, "state"),
                    "ambassadors": ambassadors,
                    "signups": map.get(row, "signups"),
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

    /// Duplicate rule for events: same date, venue equal after
    /// normalization with prefix tolerance.
    fn find_event_by_date_venue(
        &self,
        date: NaiveDate,
        venue: &str,
    ) -> Result<Option<String>, crate::db::DbError> {
        let candidates: Vec<(String, String)> = self.db.query_many(
            "SELECT id, venue FROM events WHERE event_date = ?1",
            params![date.format("%Y-%m-%d").to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(candidates
            .into_iter()
            .find(|(_, existing)| venues_match(existing, venue))
            .map(|(id, _)| id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::importer;
    use super::*;

    const CSV: &str = "\
event_date,venue,city,state,ambassadors,signups,event_type,start_time,end_time,notes
03/02/24,Joe's Bar,Hoboken,NJ,Ann Lee; Bob Ray,14,bar night,18:00,22:00,good turnout
03/09/24,Garden Arena,Newark,NJ,Ann Lee,30,game day,,,
";

    #[test]
    fn test_import_events_creates_and_links() {
        let importer = importer();
        let summary = importer.import_events(CSV, &ImportOptions::default()).unwrap();

        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.processed_rows, 2);
        assert_eq!(summary.status, "completed");

        let events: i64 = importer
            .db
            .query_one("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(events, 2);

        let assignments: i64 = importer
            .db
            .query_one("SELECT COUNT(*) FROM assignments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(assignments, 3);
    }

    #[test]
    fn test_duplicate_venue_merges_and_appends_notes() {
        let importer = importer();
        importer.import_events(CSV, &ImportOptions::default()).unwrap();

        // Prefix-tolerant venue match on the same date.
        let again = "\
event_date,venue,city,state,ambassadors,signups,event_type,start_time,end_time,notes
03/02/24,Joe's Bar & Grill,Hoboken,NJ,,12,,,,second export
";
        let summary = importer.import_events(again, &ImportOptions::default()).unwrap();
        assert_eq!(summary.processed_rows, 1);

        let events: i64 = importer
            .db
            .query_one("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(events, 2, "no new event row");

        let notes: String = importer
            .db
            .query_one(
                "SELECT notes FROM events WHERE venue = 'Joe''s Bar'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(notes.contains("good turnout"));
        assert!(notes.contains("second export"));

        // The merge is an update in the row details even if nothing changed.
        let details = importer.row_details(&summary.id).unwrap();
        assert_eq!(details[0].2.as_deref(), Some("update"));
    }

    #[test]
    fn test_unresolved_ambassador_warns_but_keeps_event() {
        let importer = importer();
        let csv = "\
event_date,venue,city,state,ambassadors,signups
04/01/24,Moe's Tavern,Springfield,NJ,Ghost Person,5
";
        let summary = importer.import_events(csv, &ImportOptions::default()).unwrap();
        assert_eq!(summary.processed_rows, 1);
        assert_eq!(summary.error_rows, 0);
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("Ghost Person"));

        let assignments: i64 = importer
            .db
            .query_one("SELECT COUNT(*) FROM assignments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(assignments, 0);
    }

    #[test]
    fn test_preview_counts_duplicates() {
        let importer = importer();
        importer.import_events(CSV, &ImportOptions::default()).unwrap();

        let preview = importer.preview_events(CSV, &ImportOptions::default()).unwrap();
        assert_eq!(preview.total_rows, 2);
        assert_eq!(preview.would_be_duplicates, 2);
        assert!(preview.header_detected);
    }
}
