//! Persistence layer.
//!
//! A thin typed wrapper over a WAL-mode SQLite connection. All access goes
//! through `Database`: plain statements via `exec`/`query_one`/`query_many`,
//! multi-statement units via `transaction`, and contention over logical
//! resources via `advisory_lock`. Busy/locked errors are retried here so
//! callers only ever see the four failure kinds.

mod schema;

pub use schema::SCHEMA_SQL;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Params, Row, Transaction};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure kinds the rest of the system pattern-matches on.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization failure")]
    Serialization,
    #[error("transient database error: {0}")]
    Transient(String),
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
            rusqlite::Error::SqliteFailure(err, msg) => match err.code {
                rusqlite::ErrorCode::ConstraintViolation => {
                    DbError::Conflict(msg.clone().unwrap_or_else(|| "constraint violation".into()))
                }
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    DbError::Serialization
                }
                _ => DbError::Transient(e.to_string()),
            },
            _ => DbError::Transient(e.to_string()),
        }
    }
}

/// Attempts for statements that hit `SQLITE_BUSY`.
const SERIALIZATION_RETRIES: u32 = 3;

/// Shared database handle.
///
/// The connection sits behind a `parking_lot::Mutex`; critical sections are
/// short (single statement or one transaction body), which keeps async
/// callers from starving each other.
pub struct Database {
    conn: Mutex<Connection>,
    advisory: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;
        conn.busy_timeout(Duration::from_millis(250))?;
        debug!("database ready at {}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
            advisory: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            advisory: Mutex::new(HashMap::new()),
        })
    }

    /// Execute a single statement, returning affected row count.
    pub fn exec<P: Params + Clone>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let mut last = DbError::Serialization;
        for attempt in 0..SERIALIZATION_RETRIES {
            match conn.execute(sql, params.clone()) {
                Ok(n) => return Ok(n),
                Err(e) => {
                    let mapped = DbError::from(e);
                    if matches!(mapped, DbError::Serialization)
                        && attempt + 1 < SERIALIZATION_RETRIES
                    {
                        std::thread::sleep(Duration::from_millis(20 * (attempt as u64 + 1)));
                        last = mapped;
                        continue;
                    }
                    return Err(mapped);
                }
            }
        }
        Err(last)
    }

    /// Query exactly one row; `NotFound` when the query returns none.
    pub fn query_one<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, DbError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Query zero or more rows.
    pub fn query_many<T, P, F>(&self, sql: &str, params: P, mut f: F) -> Result<Vec<T>, DbError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(DbError::from)?;
        let rows = stmt
            .query_map(params, |row| f(row))
            .map_err(DbError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(DbError::from)?);
        }
        Ok(out)
    }

    /// Run `f` inside a transaction. Commit on `Ok`, roll back on `Err`.
    /// Serialization failures retry the whole body up to the budget.
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T, DbError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, DbError>,
    {
        let mut conn = self.conn.lock();
        let mut last = DbError::Serialization;
        for attempt in 0..SERIALIZATION_RETRIES {
            let tx = conn.transaction().map_err(DbError::from)?;
            match f(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        let mapped = DbError::from(e);
                        if matches!(mapped, DbError::Serialization)
                            && attempt + 1 < SERIALIZATION_RETRIES
                        {
                            warn!("transaction commit hit busy, retrying");
                            last = mapped;
                            continue;
                        }
                        return Err(mapped);
                    }
                },
                Err(e) => {
                    // Rollback happens on drop.
                    if matches!(e, DbError::Serialization) && attempt + 1 < SERIALIZATION_RETRIES {
                        last = e;
                        std::thread::sleep(Duration::from_millis(20 * (attempt as u64 + 1)));
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(last)
    }

    /// Acquire the advisory lock for `(namespace, identifier)` and hold it
    /// for the duration of the returned guard. Locks are process-local: the
    /// engine is embedded and this process is the only writer.
    pub async fn advisory_lock(
        &self,
        namespace: &str,
        identifier: &str,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let key = advisory_key(namespace, identifier);
        let mutex = {
            let mut registry = self.advisory.lock();
            registry
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Non-blocking advisory lock attempt; `None` when another holder exists.
    pub fn try_advisory_lock(
        &self,
        namespace: &str,
        identifier: &str,
    ) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let key = advisory_key(namespace, identifier);
        let mutex = {
            let mut registry = self.advisory.lock();
            registry
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.try_lock_owned().ok()
    }
}

fn advisory_key(namespace: &str, identifier: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    namespace.hash(&mut hasher);
    identifier.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn test_schema_applies_clean() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .query_one(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(count > 15, "expected full schema, got {count} tables");
    }

    #[test]
    fn test_unique_violation_maps_to_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.exec(
            "INSERT INTO sign_ups (id, solo_chat_id, ambassador_id, operator_id, customer_email, submitted_at, idempotency_key)
             VALUES (?1, 'chat1', 'amb1', 7, 'a@b.com', '2025-01-01T00:00:00Z', 'abc')",
            params!["s1"],
        )
        .unwrap();

        let err = db
            .exec(
                "INSERT INTO sign_ups (id, solo_chat_id, ambassador_id, operator_id, customer_email, submitted_at, idempotency_key)
                 VALUES (?1, 'chat2', 'amb1', 7, 'c@d.com', '2025-01-01T00:00:00Z', 'abc')",
                params!["s2"],
            )
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn test_query_one_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .query_one("SELECT id FROM events WHERE id = 'missing'", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DbError> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO operators (id, name) VALUES (1, 'OpOne')",
                [],
            )?;
            Err(DbError::Transient("forced".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .query_one("SELECT COUNT(*) FROM operators", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "insert should have rolled back");
    }

    #[test]
    fn test_signup_check_constraint() {
        let db = Database::open_in_memory().unwrap();
        // Neither event_id nor solo_chat_id: rejected by the CHECK.
        let err = db
            .exec(
                "INSERT INTO sign_ups (id, ambassador_id, operator_id, customer_email, submitted_at, idempotency_key)
                 VALUES ('s1', 'amb1', 7, 'a@b.com', '2025-01-01T00:00:00Z', 'k1')",
                [],
            )
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_advisory_lock_serializes() {
        let db = Arc::new(Database::open_in_memory().unwrap());

        let guard = db.advisory_lock("credential_refresh", "ledgerbooks").await;
        assert!(db
            .try_advisory_lock("credential_refresh", "ledgerbooks")
            .is_none());
        // Different identifier is an independent lock.
        assert!(db
            .try_advisory_lock("credential_refresh", "cardops")
            .is_some());
        drop(guard);
        assert!(db
            .try_advisory_lock("credential_refresh", "ledgerbooks")
            .is_some());
    }
}
