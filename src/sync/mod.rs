//! Checkpointed batch synchronization.
//!
//! Each `(integration, sync_type)` pair owns at most one live run; a second
//! concurrent run observes the holder and exits cleanly. Progress persists
//! per record, so a crash mid-run resumes from `last_processed_id` instead
//! of starting over. Records apply strictly in the order the partner
//! returned them; `processed_records` is monotonic.

pub mod sources;

use crate::bus::{types, EventBus};
use crate::db::{Database, DbError};
use crate::retry::{with_retry, ClassifiedError, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Paused => "paused",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(CheckpointStatus::InProgress),
            "paused" => Some(CheckpointStatus::Paused),
            "completed" => Some(CheckpointStatus::Completed),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub id: String,
    pub integration: String,
    pub sync_type: String,
    pub total_records: Option<u64>,
    pub processed_records: u64,
    pub failed_records: u64,
    pub last_processed_id: Option<String>,
    pub status: CheckpointStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One record from a partner page.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub external_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug)]
pub struct SyncPage {
    pub records: Vec<SyncRecord>,
}

/// A pullable partner collection. `fetch_page` receives the id of the last
/// applied record (None on a fresh run) and returns the next batch after
/// it; an empty batch means the collection is exhausted.
#[async_trait]
pub trait SyncSource: Send + Sync {
    fn integration(&self) -> &str;
    fn sync_type(&self) -> &str;
    fn record_type(&self) -> &str;
    /// Total size when the partner can report it cheaply.
    async fn total_count(&self) -> Result<Option<u64>, ClassifiedError>;
    async fn fetch_page(&self, after: Option<&str>) -> Result<SyncPage, ClassifiedError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { processed: u64, failed: u64 },
    Paused { processed: u64 },
    AlreadyRunning,
    Failed { message: String },
}

pub struct SyncOrchestrator {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    retry: RetryConfig,
}

impl SyncOrchestrator {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self {
            db,
            bus,
            retry: RetryConfig::default(),
        }
    }

    /// Run one sync to completion (or pause/failure). Resumes the most
    /// recent resumable checkpoint for the pair when one exists.
    pub async fn run(&self, source: &dyn SyncSource) -> Result<SyncOutcome, DbError> {
        let integration = source.integration().to_string();
        let sync_type = source.sync_type().to_string();
        let lock_id = format!("{integration}:{sync_type}");

        // Single-holder rule: bail out quietly if a run already owns the pair.
        let Some(_guard) = self.db.try_advisory_lock("sync_run", &lock_id) else {
            info!(integration, sync_type, "sync already running elsewhere, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let mut checkpoint = match self.find_resumable(&integration, &sync_type)? {
            Some(cp) => {
                info!(
                    integration,
                    sync_type,
                    checkpoint = cp.id,
                    processed = cp.processed_records,
                    "resuming sync from checkpoint"
                );
                self.set_status(&cp.id, CheckpointStatus::InProgress, None)?;
                cp
            }
            None => self.create_checkpoint(&integration, &sync_type)?,
        };

        // Total count is informational; a partner that cannot report one
        // leaves it null.
        if checkpoint.total_records.is_none() {
            match source.total_count().await {
                Ok(Some(total)) => {
                    self.db.exec(
                        "UPDATE sync_checkpoints SET total_records = ?1, updated_at = ?2 WHERE id = ?3",
                        params![total as i64, Utc::now().timestamp(), checkpoint.id],
                    )?;
                    checkpoint.total_records = Some(total);
                }
                Ok(None) => {}
                Err(e) => warn!(integration, "total count probe failed: {e}"),
            }
        }

        loop {
            // A pause request lands between pages.
            if let Some(current) = self.get_checkpoint(&checkpoint.id)? {
                if current.status == CheckpointStatus::Paused {
                    info!(checkpoint = checkpoint.id, "sync paused");
                    return Ok(SyncOutcome::Paused {
                        processed: current.processed_records,
                    });
                }
            }

            let after = checkpoint.last_processed_id.clone();
            let page = with_retry(
                || source.fetch_page(after.as_deref()),
                &self.retry,
                "sync.fetch_page",
                None,
            )
            .await
            .into_result();

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(checkpoint = checkpoint.id, "sync failed fetching page: {e}");
                    self.set_status(
                        &checkpoint.id,
                        CheckpointStatus::Failed,
                        Some(&e.to_string()),
                    )?;
                    return Ok(SyncOutcome::Failed {
                        message: e.to_string(),
                    });
                }
            };

            if page.records.is_empty() {
                break;
            }

            for record in page.records {
                match self.apply_record(&checkpoint, source.record_type(), &record) {
                    Ok(()) => {
                        checkpoint.processed_records += 1;
                        checkpoint.last_processed_id = Some(record.external_id);
                    }
                    Err(e) => {
                        // Serialization already retried inside the db layer;
                        // whatever survives is a record-level defect.
                        warn!(
                            checkpoint = checkpoint.id,
                            external_id = record.external_id,
                            "record apply failed: {e}"
                        );
                        checkpoint.failed_records += 1;
                        checkpoint.last_processed_id = Some(record.external_id.clone());
                        self.db.exec(
                            "UPDATE sync_checkpoints
                             SET failed_records = ?1, last_processed_id = ?2, updated_at = ?3
                             WHERE id = ?4",
                            params![
                                checkpoint.failed_records as i64,
                                record.external_id,
                                Utc::now().timestamp(),
                                checkpoint.id
                            ],
                        )?;
                    }
                }
            }
        }

        self.set_status(&checkpoint.id, CheckpointStatus::Completed, None)?;
        metrics::counter!("sync_runs_completed", 1);
        info!(
            integration,
            sync_type,
            processed = checkpoint.processed_records,
            failed = checkpoint.failed_records,
            "sync completed"
        );

        self.bus.publish(
            types::EXTERNAL_SYNC_COMPLETED,
            json!({
                "integration": integration,
                "syncType": sync_type,
                "processedRecords": checkpoint.processed_records,
                "failedRecords": checkpoint.failed_records,
            }),
            None,
        );

        Ok(SyncOutcome::Completed {
            processed: checkpoint.processed_records,
            failed: checkpoint.failed_records,
        })
    }

    /// Upsert the mapped row and bump the checkpoint inside one transaction:
    /// either both happen or neither does.
    fn apply_record(
        &self,
        checkpoint: &SyncCheckpoint,
        record_type: &str,
        record: &SyncRecord,
    ) -> Result<(), DbError> {
        let now = Utc::now().timestamp();
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO synced_records (provider, external_id, record_type, payload_json, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(provider, external_id) DO UPDATE SET
                     record_type = excluded.record_type,
                     payload_json = excluded.payload_json,
                     synced_at = excluded.synced_at",
                params![
                    checkpoint.integration,
                    record.external_id,
                    record_type,
                    record.payload.to_string(),
                    now
                ],
            )?;
            tx.execute(
                "UPDATE sync_checkpoints
                 SET processed_records = processed_records + 1,
                     last_processed_id = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![record.external_id, now, checkpoint.id],
            )?;
            Ok(())
        })
    }

    /// Request a pause; the running sync honors it at the next page boundary.
    pub fn pause_sync(&self, checkpoint_id: &str) -> Result<(), DbError> {
        let n = self.db.exec(
            "UPDATE sync_checkpoints SET status = 'paused', updated_at = ?1
             WHERE id = ?2 AND status = 'in_progress'",
            params![Utc::now().timestamp(), checkpoint_id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Drop completed/failed checkpoints beyond the `keep_last` most recent.
    pub fn cleanup_old_checkpoints(
        &self,
        integration: &str,
        sync_type: &str,
        keep_last: u32,
    ) -> Result<usize, DbError> {
        self.db.exec(
            "DELETE FROM sync_checkpoints
             WHERE integration = ?1 AND sync_type = ?2
               AND status IN ('completed', 'failed')
               AND id NOT IN (
                   SELECT id FROM sync_checkpoints
                   WHERE integration = ?1 AND sync_type = ?2
                     AND status IN ('completed', 'failed')
                   ORDER BY created_at DESC
                   LIMIT ?3
               )",
            params![integration, sync_type, keep_last],
        )
    }

    pub fn get_checkpoint(&self, id: &str) -> Result<Option<SyncCheckpoint>, DbError> {
        match self.db.query_one(
            "SELECT id, integration, sync_type, total_records, processed_records, failed_records,
                    last_processed_id, status, error_message, created_at, updated_at
             FROM sync_checkpoints WHERE id = ?1",
            params![id],
            row_to_checkpoint,
        ) {
            Ok(cp) => Ok(Some(cp)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list_checkpoints(
        &self,
        integration: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SyncCheckpoint>, DbError> {
        match integration {
            Some(integration) => self.db.query_many(
                "SELECT id, integration, sync_type, total_records, processed_records, failed_records,
                        last_processed_id, status, error_message, created_at, updated_at
                 FROM sync_checkpoints WHERE integration = ?1
                 ORDER BY created_at DESC LIMIT ?2",
                params![integration, limit],
                row_to_checkpoint,
            ),
            None => self.db.query_many(
                "SELECT id, integration, sync_type, total_records, processed_records, failed_records,
                        last_processed_id, status, error_message, created_at, updated_at
                 FROM sync_checkpoints
                 ORDER BY created_at DESC LIMIT ?1",
                params![limit],
                row_to_checkpoint,
            ),
        }
    }

    fn find_resumable(
        &self,
        integration: &str,
        sync_type: &str,
    ) -> Result<Option<SyncCheckpoint>, DbError> {
        match self.db.query_one(
            "SELECT id, integration, sync_type, total_records, processed_records, failed_records,
                    last_processed_id, status, error_message, created_at, updated_at
             FROM sync_checkpoints
             WHERE integration = ?1 AND sync_type = ?2
               AND status IN ('in_progress', 'paused', 'failed')
             ORDER BY created_at DESC LIMIT 1",
            params![integration, sync_type],
            row_to_checkpoint,
        ) {
            Ok(cp) => Ok(Some(cp)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_checkpoint(
        &self,
        integration: &str,
        sync_type: &str,
    ) -> Result<SyncCheckpoint, DbError> {
        let now = Utc::now().timestamp();
        let checkpoint = SyncCheckpoint {
            id: Uuid::new_v4().to_string(),
            integration: integration.to_string(),
            sync_type: sync_type.to_string(),
            total_records: None,
            processed_records: 0,
            failed_records: 0,
            last_processed_id: None,
            status: CheckpointStatus::InProgress,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.db.exec(
            "INSERT INTO sync_checkpoints
                 (id, integration, sync_type, processed_records, failed_records, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 0, 'in_progress', ?4, ?5)",
            params![checkpoint.id, integration, sync_type, now, now],
        )?;
        Ok(checkpoint)
    }

    fn set_status(
        &self,
        id: &str,
        status: CheckpointStatus,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        self.db.exec(
            "UPDATE sync_checkpoints SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), error_message, Utc::now().timestamp(), id],
        )?;
        Ok(())
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCheckpoint> {
    let status: String = row.get(7)?;
    Ok(SyncCheckpoint {
        id: row.get(0)?,
        integration: row.get(1)?,
        sync_type: row.get(2)?,
        total_records: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        processed_records: row.get::<_, i64>(4)? as u64,
        failed_records: row.get::<_, i64>(5)? as u64,
        last_processed_id: row.get(6)?,
        status: CheckpointStatus::from_str(&status).unwrap_or(CheckpointStatus::Failed),
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ClientRegistry;
    use parking_lot::Mutex;

    /// A source serving `total` numbered records in pages of `page_size`,
    /// optionally failing the fetch after `fail_after_fetches`.
    struct NumberSource {
        total: u64,
        page_size: usize,
        fetches: Mutex<u32>,
        fail_on_fetch: Option<u32>,
        bad_record: Option<String>,
    }

    impl NumberSource {
        fn new(total: u64, page_size: usize) -> Self {
            Self {
                total,
                page_size,
                fetches: Mutex::new(0),
                fail_on_fetch: None,
                bad_record: None,
            }
        }
    }

    #[async_trait]
    impl SyncSource for NumberSource {
        fn integration(&self) -> &str {
            "ledgerbooks"
        }
        fn sync_type(&self) -> &str {
            "invoices"
        }
        fn record_type(&self) -> &str {
            "invoice"
        }

        async fn total_count(&self) -> Result<Option<u64>, ClassifiedError> {
            Ok(Some(self.total))
        }

        async fn fetch_page(&self, after: Option<&str>) -> Result<SyncPage, ClassifiedError> {
            {
                let mut fetches = self.fetches.lock();
                *fetches += 1;
                if Some(*fetches) == self.fail_on_fetch {
                    return Err(ClassifiedError::from_message("403 forbidden"));
                }
            }
            let start: u64 = match after {
                Some(id) => id.trim_start_matches("rec-").parse::<u64>().unwrap() + 1,
                None => 1,
            };
            let records: Vec<SyncRecord> = (start..=self.total)
                .take(self.page_size)
                .map(|n| SyncRecord {
                    external_id: format!("rec-{n}"),
                    payload: json!({ "n": n }),
                })
                .collect();
            Ok(SyncPage { records })
        }
    }

    fn orchestrator() -> (SyncOrchestrator, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(db.clone(), Arc::new(ClientRegistry::new()), 100));
        (SyncOrchestrator::new(db.clone(), bus), db)
    }

    #[tokio::test]
    async fn test_full_sync_completes() {
        let (orch, db) = orchestrator();
        let source = NumberSource::new(25, 10);

        let outcome = orch.run(&source).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                processed: 25,
                failed: 0
            }
        );

        let synced: i64 = db
            .query_one("SELECT COUNT(*) FROM synced_records", [], |r| r.get(0))
            .unwrap();
        assert_eq!(synced, 25);

        let cp = orch.list_checkpoints(Some("ledgerbooks"), 10).unwrap();
        assert_eq!(cp.len(), 1);
        assert_eq!(cp[0].status, CheckpointStatus::Completed);
        assert_eq!(cp[0].processed_records, 25);
        assert_eq!(cp[0].total_records, Some(25));
        assert_eq!(cp[0].last_processed_id.as_deref(), Some("rec-25"));
    }

    #[tokio::test]
    async fn test_resume_after_failure() {
        let (orch, _db) = orchestrator();

        // First run dies on the third fetch (after 20 records).
        let mut source = NumberSource::new(50, 10);
        source.fail_on_fetch = Some(3);
        let outcome = orch.run(&source).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed { .. }));

        let cp = orch
            .list_checkpoints(Some("ledgerbooks"), 10)
            .unwrap()
            .remove(0);
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert_eq!(cp.processed_records, 20);
        assert_eq!(cp.last_processed_id.as_deref(), Some("rec-20"));

        // Second run resumes the same checkpoint and finishes the rest.
        let source = NumberSource::new(50, 10);
        let outcome = orch.run(&source).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                processed: 50,
                failed: 0
            }
        );

        let cps = orch.list_checkpoints(Some("ledgerbooks"), 10).unwrap();
        assert_eq!(cps.len(), 1, "resume reuses the checkpoint row");
        assert_eq!(cps[0].processed_records, 50);
    }

    #[tokio::test]
    async fn test_concurrent_run_exits_cleanly() {
        let (orch, db) = orchestrator();
        let _guard = db.try_advisory_lock("sync_run", "ledgerbooks:invoices").unwrap();

        let source = NumberSource::new(5, 5);
        let outcome = orch.run(&source).await.unwrap();
        assert_eq!(outcome, SyncOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent() {
        let (orch, db) = orchestrator();
        // Five finished checkpoints with distinct created_at.
        for i in 0..5 {
            db.exec(
                "INSERT INTO sync_checkpoints
                     (id, integration, sync_type, processed_records, failed_records, status, created_at, updated_at)
                 VALUES (?1, 'ledgerbooks', 'invoices', 1, 0, 'completed', ?2, ?2)",
                params![format!("cp-{i}"), 1000 + i as i64],
            )
            .unwrap();
        }

        let deleted = orch
            .cleanup_old_checkpoints("ledgerbooks", "invoices", 2)
            .unwrap();
        assert_eq!(deleted, 3);

        let left = orch.list_checkpoints(Some("ledgerbooks"), 10).unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].id, "cp-4");
        assert_eq!(left[1].id, "cp-3");
    }

    #[tokio::test]
    async fn test_pause_requires_in_progress() {
        let (orch, db) = orchestrator();
        db.exec(
            "INSERT INTO sync_checkpoints
                 (id, integration, sync_type, processed_records, failed_records, status, created_at, updated_at)
             VALUES ('cp-1', 'cardops', 'transactions', 0, 0, 'in_progress', 1, 1)",
            [],
        )
        .unwrap();

        orch.pause_sync("cp-1").unwrap();
        let cp = orch.get_checkpoint("cp-1").unwrap().unwrap();
        assert_eq!(cp.status, CheckpointStatus::Paused);

        // Pausing a paused checkpoint is a no-op error.
        assert!(orch.pause_sync("cp-1").is_err());
    }
}
