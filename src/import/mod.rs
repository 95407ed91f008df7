//! Bulk CSV importers.
//!
//! Three importers (historical events, sign-ups, budget/actuals) share one
//! skeleton: hash & log, parse, detect headers, normalize, resolve
//! entities, dedupe, apply per row inside a transaction, audit every
//! decision, finalize with aggregate counters. A bad row never aborts the
//! run; it becomes an `error` row detail the UI can display.

pub mod budget;
pub mod csv;
pub mod events;
pub mod parse;
pub mod resolve;
pub mod signups;

use crate::bus::EventBus;
use crate::db::{Database, DbError};
use crate::error::AppError;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Cap on persisted error/warning arrays; overflow is truncated with a
/// sentinel entry.
const MAX_CAPTURED_MESSAGES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Success,
    Skipped,
    Duplicate,
    Error,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Success => "success",
            RowStatus::Skipped => "skipped",
            RowStatus::Duplicate => "duplicate",
            RowStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub file_name: Option<String>,
    /// Year applied to `MM/DD` dates.
    pub default_year: Option<i32>,
    pub started_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub id: String,
    pub import_type: String,
    pub status: String,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub skipped_duplicates: u32,
    pub error_rows: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parse-only preview: what an import would do, without writing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreview {
    pub total_rows: u32,
    pub sample_rows: Vec<serde_json::Value>,
    pub column_mapping: Vec<(String, usize)>,
    pub header_detected: bool,
    pub would_be_duplicates: u32,
    pub unresolved_entities: u32,
}

/// Mutable state of one running import.
pub(crate) struct RunState {
    pub id: String,
    pub import_type: String,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub skipped_duplicates: u32,
    pub error_rows: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl RunState {
    pub fn push_error(&mut self, message: String) {
        push_capped(&mut self.errors, message);
    }

    pub fn push_warning(&mut self, message: String) {
        push_capped(&mut self.warnings, message);
    }
}

fn push_capped(list: &mut Vec<String>, message: String) {
    if list.len() < MAX_CAPTURED_MESSAGES {
        list.push(message);
    } else if list.len() == MAX_CAPTURED_MESSAGES {
        list.push("… further messages truncated".to_string());
    }
}

pub struct BulkImporter {
    pub(crate) db: Arc<Database>,
    pub(crate) bus: Arc<EventBus>,
    cancel_requests: Mutex<HashSet<String>>,
}

impl BulkImporter {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self {
            db,
            bus,
            cancel_requests: Mutex::new(HashSet::new()),
        }
    }

    /// Hash the raw bytes and open the `import_logs` row. Duplicate hashes
    /// are allowed (re-imports happen); the hash is stored for audit.
    pub(crate) fn begin(
        &self,
        import_type: &str,
        content: &str,
        options: &ImportOptions,
    ) -> Result<RunState, DbError> {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let file_hash = hex::encode(hasher.finalize());

        let id = Uuid::new_v4().to_string();
        self.db.exec(
            "INSERT INTO import_logs (id, import_type, file_name, file_hash, status, started_by, created_at)
             VALUES (?1, ?2, ?3, ?4, 'processing', ?5, ?6)",
            params![
                id,
                import_type,
                options.file_name,
                file_hash,
                options.started_by,
                Utc::now().timestamp()
            ],
        )?;

        info!(import_id = %id, import_type, file_hash = %&file_hash[..12], "import started");

        Ok(RunState {
            id,
            import_type: import_type.to_string(),
            total_rows: 0,
            processed_rows: 0,
            skipped_duplicates: 0,
            error_rows: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
        })
    }

    pub(crate) fn record_row(
        &self,
        state: &RunState,
        row_number: u32,
        status: RowStatus,
        action: Option<&str>,
        message: Option<&str>,
        raw_data: &str,
    ) -> Result<(), DbError> {
        self.db.exec(
            "INSERT INTO import_row_details (import_id, row_number, status, action, message, raw_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.id,
                row_number,
                status.as_str(),
                action,
                message,
                raw_data
            ],
        )?;
        Ok(())
    }

    /// Append-only audit entry for a state-changing decision.
    pub(crate) fn audit(
        &self,
        state: &RunState,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        detail: Option<&str>,
    ) -> Result<(), DbError> {
        self.db.exec(
            "INSERT INTO import_audit_entries (import_id, entity_type, entity_id, action, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.id,
                entity_type,
                entity_id,
                action,
                detail,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Persist final counters and the capped message arrays.
    pub(crate) fn finalize(&self, state: RunState) -> Result<ImportSummary, DbError> {
        let status = if state.cancelled {
            "cancelled"
        } else if state.error_rows == 0 {
            "completed"
        } else if state.processed_rows > 0 {
            "partial"
        } else {
            "failed"
        };

        self.db.exec(
            "UPDATE import_logs
             SET status = ?1, total_rows = ?2, processed_rows = ?3, skipped_duplicates = ?4,
                 error_rows = ?5, errors_json = ?6, warnings_json = ?7, finished_at = ?8
             WHERE id = ?9",
            params![
                status,
                state.total_rows,
                state.processed_rows,
                state.skipped_duplicates,
                state.error_rows,
                serde_json::to_string(&state.errors).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&state.warnings).unwrap_or_else(|_| "[]".into()),
                Utc::now().timestamp(),
                state.id
            ],
        )?;
        self.cancel_requests.lock().remove(&state.id);

        info!(
            import_id = %state.id,
            status,
            total = state.total_rows,
            processed = state.processed_rows,
            duplicates = state.skipped_duplicates,
            errors = state.error_rows,
            "import finished"
        );
        metrics::counter!("imports_finished", 1);

        self.bus.publish(
            crate::bus::types::IMPORT_COMPLETED,
            serde_json::json!({
                "importId": state.id,
                "importType": state.import_type,
                "status": status,
                "processedRows": state.processed_rows,
                "errorRows": state.error_rows,
            }),
            None,
        );

        Ok(ImportSummary {
            id: state.id,
            import_type: state.import_type,
            status: status.to_string(),
            total_rows: state.total_rows,
            processed_rows: state.processed_rows,
            skipped_duplicates: state.skipped_duplicates,
            error_rows: state.error_rows,
            errors: state.errors,
            warnings: state.warnings,
        })
    }

    // -- cancellation -------------------------------------------------------

    /// Flag a running import; the run observes it between rows, finishes the
    /// current row, and terminates with `status = cancelled`.
    pub fn cancel_import(&self, import_id: &str) {
        self.cancel_requests.lock().insert(import_id.to_string());
    }

    pub(crate) fn is_cancelled(&self, import_id: &str) -> bool {
        self.cancel_requests.lock().contains(import_id)
    }

    // -- rollback -----------------------------------------------------------

    /// Delete everything the import created and mark it rolled back.
    /// Idempotent: a second call deletes nothing and succeeds.
    pub fn rollback_import(&self, import_id: &str) -> Result<u32, AppError> {
        // Confirm the import exists first.
        let _: String = self
            .db
            .query_one(
                "SELECT id FROM import_logs WHERE id = ?1",
                params![import_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("import {import_id}")),
                other => other.into(),
            })?;

        let mut deleted = 0u32;
        for (table, not_null_guard) in [
            ("sign_ups", "import_batch_id"),
            ("events", "import_batch_id"),
            ("event_financials", "import_batch_id"),
        ] {
            deleted += self.db.exec(
                &format!("DELETE FROM {table} WHERE {not_null_guard} = ?1"),
                params![import_id],
            )? as u32;
        }

        self.db.exec(
            "UPDATE import_logs SET status = 'rolled_back' WHERE id = ?1",
            params![import_id],
        )?;

        info!(import_id, deleted, "import rolled back");
        Ok(deleted)
    }

    // -- reads --------------------------------------------------------------

    pub fn get_import(&self, import_id: &str) -> Result<ImportSummary, AppError> {
        self.db
            .query_one(
                "SELECT id, import_type, status, total_rows, processed_rows, skipped_duplicates,
                        error_rows, errors_json, warnings_json
                 FROM import_logs WHERE id = ?1",
                params![import_id],
                |row| {
                    let errors: String = row.get(7)?;
                    let warnings: String = row.get(8)?;
                    Ok(ImportSummary {
                        id: row.get(0)?,
                        import_type: row.get(1)?,
                        status: row.get(2)?,
                        total_rows: row.get::<_, i64>(3)? as u32,
                        processed_rows: row.get::<_, i64>(4)? as u32,
                        skipped_duplicates: row.get::<_, i64>(5)? as u32,
                        error_rows: row.get::<_, i64>(6)? as u32,
                        errors: serde_json::from_str(&errors).unwrap_or_default(),
                        warnings: serde_json::from_str(&warnings).unwrap_or_default(),
                    })
                },
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("import {import_id}")),
                other => other.into(),
            })
    }

    pub fn audit_trail(
        &self,
        import_id: &str,
    ) -> Result<Vec<(String, String, String, Option<String>, i64)>, AppError> {
        self.db
            .query_many(
                "SELECT entity_type, entity_id, action, detail, at
                 FROM import_audit_entries WHERE import_id = ?1 ORDER BY id ASC",
                params![import_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .map_err(Into::into)
    }

    pub fn row_details(
        &self,
        import_id: &str,
    ) -> Result<Vec<(u32, String, Option<String>, Option<String>)>, AppError> {
        self.db
            .query_many(
                "SELECT row_number, status, action, message
                 FROM import_row_details WHERE import_id = ?1 ORDER BY row_number ASC",
                params![import_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u32,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .map_err(Into::into)
    }
}
