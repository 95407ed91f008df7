//! Entity resolution for imported rows.
//!
//! Ambassadors arrive as free-text names (or emails); operators as numeric
//! ids or display names. Resolution is best-effort and deterministic:
//! email beats name, exact beats fuzzy.

use crate::db::{Database, DbError};
use crate::models::Ambassador;
use rusqlite::params;

fn row_to_ambassador(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ambassador> {
    Ok(Ambassador {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        hourly_rate: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

const AMBASSADOR_COLUMNS: &str =
    "id, first_name, last_name, email, phone, hourly_rate, is_active";

/// Resolve a free-text ambassador reference. Order: email match, exact
/// full-name match (case-insensitive), then a two-token first/last
/// fallback.
pub fn resolve_ambassador(db: &Database, raw: &str) -> Result<Option<Ambassador>, DbError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    // Email takes precedence over any name matching.
    if raw.contains('@') {
        let email = raw.to_lowercase();
        match db.query_one(
            &format!("SELECT {AMBASSADOR_COLUMNS} FROM ambassadors WHERE lower(email) = ?1"),
            params![email],
            row_to_ambassador,
        ) {
            Ok(a) => return Ok(Some(a)),
            Err(DbError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    // Case-insensitive full-name match.
    let lowered = raw.to_lowercase();
    match db.query_one(
        &format!(
            "SELECT {AMBASSADOR_COLUMNS} FROM ambassadors
             WHERE lower(first_name || ' ' || last_name) = ?1"
        ),
        params![lowered],
        row_to_ambassador,
    ) {
        Ok(a) => return Ok(Some(a)),
        Err(DbError::NotFound) => {}
        Err(e) => return Err(e),
    }

    // Two-token fallback: first token vs first_name, last token vs last_name.
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.len() >= 2 {
        let first = tokens[0].to_lowercase();
        let last = tokens[tokens.len() - 1].to_lowercase();
        match db.query_one(
            &format!(
                "SELECT {AMBASSADOR_COLUMNS} FROM ambassadors
                 WHERE lower(first_name) = ?1 AND lower(last_name) = ?2"
            ),
            params![first, last],
            row_to_ambassador,
        ) {
            Ok(a) => return Ok(Some(a)),
            Err(DbError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

/// Resolve an operator reference: a numeric id verbatim, otherwise a
/// `LIKE %name%` match on the display name with a short-name fallback.
pub fn resolve_operator(db: &Database, raw: &str) -> Result<Option<i64>, DbError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    if let Ok(id) = raw.parse::<i64>() {
        match db.query_one(
            "SELECT id FROM operators WHERE id = ?1",
            params![id],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => return Ok(Some(id)),
            Err(DbError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    let pattern = format!("%{}%", raw.to_lowercase());
    match db.query_one(
        "SELECT id FROM operators WHERE lower(name) LIKE ?1 ORDER BY id LIMIT 1",
        params![pattern],
        |row| row.get::<_, i64>(0),
    ) {
        Ok(id) => return Ok(Some(id)),
        Err(DbError::NotFound) => {}
        Err(e) => return Err(e),
    }

    match db.query_one(
        "SELECT id FROM operators WHERE lower(short_name) = ?1 LIMIT 1",
        params![raw.to_lowercase()],
        |row| row.get::<_, i64>(0),
    ) {
        Ok(id) => Ok(Some(id)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn db() -> Arc<Database> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.exec(
            "INSERT INTO ambassadors (id, first_name, last_name, email, is_active)
             VALUES ('amb-1', 'Ann', 'Lee', 'ann@fieldops.example', 1),
                    ('amb-2', 'Bob', 'Ray', NULL, 1)",
            [],
        )
        .unwrap();
        db.exec(
            "INSERT INTO operators (id, name, short_name, auto_validate)
             VALUES (7, 'BetRiver Sportsbook', 'br', 0),
                    (9, 'PlayQueen Casino', 'pq', 0)",
            [],
        )
        .unwrap();
        db
    }

    #[test]
    fn test_ambassador_by_email_wins() {
        let db = db();
        let found = resolve_ambassador(&db, "ANN@fieldops.example").unwrap().unwrap();
        assert_eq!(found.id, "amb-1");
    }

    #[test]
    fn test_ambassador_by_full_name() {
        let db = db();
        let found = resolve_ambassador(&db, "ann lee").unwrap().unwrap();
        assert_eq!(found.id, "amb-1");
    }

    #[test]
    fn test_ambassador_two_token_fallback() {
        let db = db();
        // Middle name defeats exact full-name match; the fallback catches it.
        let found = resolve_ambassador(&db, "Bob Q. Ray").unwrap().unwrap();
        assert_eq!(found.id, "amb-2");
    }

    #[test]
    fn test_ambassador_unresolved() {
        let db = db();
        assert!(resolve_ambassador(&db, "Nobody Here").unwrap().is_none());
        assert!(resolve_ambassador(&db, "ghost@nowhere.example").unwrap().is_none());
        assert!(resolve_ambassador(&db, "").unwrap().is_none());
    }

    #[test]
    fn test_operator_numeric() {
        let db = db();
        assert_eq!(resolve_operator(&db, "7").unwrap(), Some(7));
        assert_eq!(resolve_operator(&db, "42").unwrap(), None);
    }

    #[test]
    fn test_operator_name_like() {
        let db = db();
        assert_eq!(resolve_operator(&db, "betriver").unwrap(), Some(7));
        assert_eq!(resolve_operator(&db, "PlayQueen").unwrap(), Some(9));
    }

    #[test]
    fn test_operator_short_name_fallback() {
        let db = db();
        assert_eq!(resolve_operator(&db, "pq").unwrap(), Some(9));
        assert_eq!(resolve_operator(&db, "zz").unwrap(), None);
    }
}
