//! Event scheduling domain.
//!
//! Status transitions go through `transition_status` and nowhere else —
//! every legal move writes a history row with the actor. Duplication
//! copies the shell of an event (and optionally its budget) onto new
//! dates; assignments carry their own small state machine.

use crate::bus::{types, EventBus};
use crate::db::{Database, DbError};
use crate::error::AppError;
use crate::models::{
    Assignment, AssignmentStatus, Event, EventStatus, EventStatusHistory,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Row};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    pub title: String,
    pub venue: String,
    pub event_date: NaiveDate,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub timezone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub event_type: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatePreview {
    pub source_event_id: String,
    pub title: String,
    pub venue: String,
    pub target_dates: Vec<NaiveDate>,
    pub copies_budget: bool,
}

pub struct EventService {
    db: Arc<Database>,
    bus: Arc<EventBus>,
}

const EVENT_COLUMNS: &str = "id, title, venue, event_date, start_time, end_time, timezone, \
     city, state, event_type, notes, status, created_at, updated_at";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let date: String = row.get(3)?;
    let status: String = row.get(11)?;
    let created: String = row.get(12)?;
    let updated: String = row.get(13)?;
    Ok(Event {
        id: row.get(0)?,
        title: row.get(1)?,
        venue: row.get(2)?,
        event_date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").unwrap_or_default(),
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        timezone: row.get(6)?,
        city: row.get(7)?,
        state: row.get(8)?,
        event_type: row.get(9)?,
        notes: row.get(10)?,
        status: EventStatus::from_str(&status).unwrap_or(EventStatus::Planned),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl EventService {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub fn create(&self, input: EventInput, actor: &str) -> Result<Event, AppError> {
        validate_input(&input)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.db.exec(
            "INSERT INTO events
                 (id, title, venue, event_date, start_time, end_time, timezone, city, state,
                  event_type, notes, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'planned', ?12, ?12)",
            params![
                id,
                input.title,
                input.venue,
                input.event_date.format("%Y-%m-%d").to_string(),
                input.start_time,
                input.end_time,
                input.timezone.unwrap_or_else(|| "America/New_York".into()),
                input.city,
                input.state,
                input.event_type,
                input.notes,
                now,
            ],
        )?;
        info!(event_id = %id, actor, "event created");
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<Event, AppError> {
        self.db
            .query_one(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                row_to_event,
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("event {id}")),
                other => other.into(),
            })
    }

    pub fn list(
        &self,
        from_date: Option<NaiveDate>,
        to_date: Option<NaiveDate>,
        status: Option<EventStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Event>, u64), AppError> {
        let from = from_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "0000-01-01".into());
        let to = to_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "9999-12-31".into());
        let status_pattern = status.map(|s| s.as_str().to_string()).unwrap_or_else(|| "%".into());

        let rows = self.db.query_many(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE event_date >= ?1 AND event_date <= ?2 AND status LIKE ?3
                 ORDER BY event_date DESC LIMIT ?4 OFFSET ?5"
            ),
            params![from, to, status_pattern, limit, offset],
            row_to_event,
        )?;
        let total: i64 = self.db.query_one(
            "SELECT COUNT(*) FROM events
             WHERE event_date >= ?1 AND event_date <= ?2 AND status LIKE ?3",
            params![from, to, status_pattern],
            |row| row.get(0),
        )?;
        Ok((rows, total as u64))
    }

    pub fn update(&self, id: &str, input: EventInput, actor: &str) -> Result<Event, AppError> {
        validate_input(&input)?;
        let existing = self.get(id)?;
        self.db.exec(
            "UPDATE events
             SET title = ?1, venue = ?2, event_date = ?3, start_time = ?4, end_time = ?5,
                 timezone = ?6, city = ?7, state = ?8, event_type = ?9, notes = ?10,
                 updated_at = ?11
             WHERE id = ?12",
            params![
                input.title,
                input.venue,
                input.event_date.format("%Y-%m-%d").to_string(),
                input.start_time,
                input.end_time,
                input.timezone.unwrap_or(existing.timezone),
                input.city,
                input.state,
                input.event_type,
                input.notes,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        self.bus.publish(
            types::EVENT_UPDATED,
            json!({ "eventId": id, "actor": actor }),
            Some(actor),
        );
        self.get(id)
    }

    /// Hard delete is reserved for planned events nothing references;
    /// anything else cancels instead.
    pub fn delete(&self, id: &str, actor: &str) -> Result<(), AppError> {
        let event = self.get(id)?;
        if event.status != EventStatus::Planned {
            return Err(AppError::Conflict(format!(
                "only planned events can be deleted; this one is {} (cancel it instead)",
                event.status.as_str()
            )));
        }
        let sign_ups: i64 = self.db.query_one(
            "SELECT COUNT(*) FROM sign_ups WHERE event_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if sign_ups > 0 {
            return Err(AppError::Conflict(
                "event has sign-ups and cannot be deleted".to_string(),
            ));
        }
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM assignments WHERE event_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM event_status_history WHERE event_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM event_financials WHERE event_id = ?1", params![id])?;
            tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
            Ok(())
        })?;
        info!(event_id = %id, actor, "event deleted");
        Ok(())
    }

    /// The only way an event changes status. Writes the history row in the
    /// same transaction.
    pub fn transition_status(
        &self,
        id: &str,
        to: EventStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Event, AppError> {
        let event = self.get(id)?;
        if !event.status.can_transition_to(to) {
            return Err(AppError::Conflict(format!(
                "illegal transition {} → {}",
                event.status.as_str(),
                to.as_str()
            )));
        }

        let now = Utc::now().to_rfc3339();
        let history_id = Uuid::new_v4().to_string();
        let from = event.status;
        self.db.transaction(|tx| {
            tx.execute(
                "UPDATE events SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), now, id],
            )?;
            tx.execute(
                "INSERT INTO event_status_history (id, event_id, from_status, to_status, actor, reason, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![history_id, id, from.as_str(), to.as_str(), actor, reason, now],
            )?;
            Ok(())
        })?;

        self.bus.publish(
            types::EVENT_UPDATED,
            json!({
                "eventId": id,
                "fromStatus": from.as_str(),
                "toStatus": to.as_str(),
                "actor": actor,
            }),
            Some(actor),
        );
        self.get(id)
    }

    pub fn status_history(&self, id: &str) -> Result<Vec<EventStatusHistory>, AppError> {
        self.db
            .query_many(
                "SELECT id, event_id, from_status, to_status, actor, reason, at
                 FROM event_status_history WHERE event_id = ?1 ORDER BY at ASC",
                params![id],
                |row| {
                    let from: String = row.get(2)?;
                    let to: String = row.get(3)?;
                    let at: String = row.get(6)?;
                    Ok(EventStatusHistory {
                        id: row.get(0)?,
                        event_id: row.get(1)?,
                        from_status: EventStatus::from_str(&from).unwrap_or(EventStatus::Planned),
                        to_status: EventStatus::from_str(&to).unwrap_or(EventStatus::Planned),
                        actor: row.get(4)?,
                        reason: row.get(5)?,
                        at: parse_ts(&at),
                    })
                },
            )
            .map_err(Into::into)
    }

    // -- duplication --------------------------------------------------------

    pub fn duplicate_preview(
        &self,
        id: &str,
        target_dates: &[NaiveDate],
        copy_budget: bool,
    ) -> Result<DuplicatePreview, AppError> {
        let event = self.get(id)?;
        Ok(DuplicatePreview {
            source_event_id: event.id,
            title: event.title,
            venue: event.venue,
            target_dates: target_dates.to_vec(),
            copies_budget: copy_budget,
        })
    }

    /// Copy the event shell (and optionally its budget row) to one date.
    pub fn duplicate(
        &self,
        id: &str,
        target_date: NaiveDate,
        copy_budget: bool,
        actor: &str,
    ) -> Result<Event, AppError> {
        let source = self.get(id)?;
        let new_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let date = target_date.format("%Y-%m-%d").to_string();

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO events
                     (id, title, venue, event_date, start_time, end_time, timezone, city, state,
                      event_type, notes, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, 'planned', ?11, ?11)",
                params![
                    new_id,
                    source.title,
                    source.venue,
                    date,
                    source.start_time,
                    source.end_time,
                    source.timezone,
                    source.city,
                    source.state,
                    source.event_type,
                    now,
                ],
            )?;
            if copy_budget {
                tx.execute(
                    "INSERT INTO event_financials
                         (event_id, kind, staff, reimbursements, rewards, base, bonus_kickback,
                          parking, setup, additional_1, additional_2, additional_3, additional_4,
                          total, revenue, profit, margin_percent, updated_at)
                     SELECT ?1, kind, staff, reimbursements, rewards, base, bonus_kickback,
                            parking, setup, additional_1, additional_2, additional_3, additional_4,
                            total, revenue, profit, margin_percent, ?2
                     FROM event_financials WHERE event_id = ?3 AND kind = 'budget'",
                    params![new_id, now, id],
                )?;
            }
            Ok(())
        })?;

        info!(source = %id, new_event = %new_id, actor, "event duplicated");
        self.get(&new_id)
    }

    /// Duplicate onto many dates; per-date outcomes, partial success
    /// allowed.
    pub fn duplicate_bulk(
        &self,
        id: &str,
        target_dates: &[NaiveDate],
        copy_budget: bool,
        actor: &str,
    ) -> Vec<(NaiveDate, Result<Event, AppError>)> {
        target_dates
            .iter()
            .map(|date| (*date, self.duplicate(id, *date, copy_budget, actor)))
            .collect()
    }

    // -- assignments --------------------------------------------------------

    pub fn assign_ambassador(
        &self,
        event_id: &str,
        ambassador_id: &str,
    ) -> Result<Assignment, AppError> {
        self.get(event_id)?;
        let id = Uuid::new_v4().to_string();
        match self.db.exec(
            "INSERT INTO assignments (id, event_id, ambassador_id, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, event_id, ambassador_id, Utc::now().to_rfc3339()],
        ) {
            Ok(_) => self.get_assignment(&id),
            Err(DbError::Conflict(_)) => Err(AppError::Conflict(format!(
                "ambassador {ambassador_id} is already assigned to event {event_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_assignment(&self, id: &str) -> Result<Assignment, AppError> {
        self.db
            .query_one(
                "SELECT id, event_id, ambassador_id, status, hours_worked, created_at
                 FROM assignments WHERE id = ?1",
                params![id],
                row_to_assignment,
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("assignment {id}")),
                other => other.into(),
            })
    }

    pub fn list_assignments(&self, event_id: &str) -> Result<Vec<Assignment>, AppError> {
        self.db
            .query_many(
                "SELECT id, event_id, ambassador_id, status, hours_worked, created_at
                 FROM assignments WHERE event_id = ?1 ORDER BY created_at ASC",
                params![event_id],
                row_to_assignment,
            )
            .map_err(Into::into)
    }

    pub fn transition_assignment(
        &self,
        id: &str,
        to: AssignmentStatus,
        hours_worked: Option<f64>,
    ) -> Result<Assignment, AppError> {
        let assignment = self.get_assignment(id)?;
        if !assignment.status.can_transition_to(to) {
            return Err(AppError::Conflict(format!(
                "illegal assignment transition {} → {}",
                assignment.status.as_str(),
                to.as_str()
            )));
        }
        self.db.exec(
            "UPDATE assignments SET status = ?1, hours_worked = COALESCE(?2, hours_worked)
             WHERE id = ?3",
            params![to.as_str(), hours_worked, id],
        )?;
        self.get_assignment(id)
    }
}

fn row_to_assignment(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    let status: String = row.get(3)?;
    let created: String = row.get(5)?;
    Ok(Assignment {
        id: row.get(0)?,
        event_id: row.get(1)?,
        ambassador_id: row.get(2)?,
        status: AssignmentStatus::from_str(&status).unwrap_or(AssignmentStatus::Pending),
        hours_worked: row.get(4)?,
        created_at: parse_ts(&created),
    })
}

fn validate_input(input: &EventInput) -> Result<(), AppError> {
    let mut fields = Vec::new();
    if input.title.trim().is_empty() {
        fields.push(("title".to_string(), "must not be empty".to_string()));
    }
    if input.venue.trim().is_empty() {
        fields.push(("venue".to_string(), "must not be empty".to_string()));
    }
    if !fields.is_empty() {
        return Err(AppError::ValidationFields(fields));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ClientRegistry;

    fn service() -> EventService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(db.clone(), Arc::new(ClientRegistry::new()), 100));
        db.exec(
            "INSERT INTO ambassadors (id, first_name, last_name, is_active)
             VALUES ('amb-1', 'Ann', 'Lee', 1)",
            [],
        )
        .unwrap();
        EventService::new(db, bus)
    }

    fn input(date: &str) -> EventInput {
        EventInput {
            title: "Game Day Activation".to_string(),
            venue: "Garden Arena".to_string(),
            event_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            start_time: Some("17:00".to_string()),
            end_time: Some("22:00".to_string()),
            timezone: None,
            city: Some("Newark".to_string()),
            state: Some("NJ".to_string()),
            event_type: Some("game day".to_string()),
            notes: None,
        }
    }

    #[test]
    fn test_lifecycle_with_history() {
        let svc = service();
        let event = svc.create(input("2025-09-01"), "mgr-1").unwrap();
        assert_eq!(event.status, EventStatus::Planned);

        let event = svc
            .transition_status(&event.id, EventStatus::Confirmed, "mgr-1", None)
            .unwrap();
        let event = svc
            .transition_status(&event.id, EventStatus::Active, "mgr-1", None)
            .unwrap();
        let event = svc
            .transition_status(&event.id, EventStatus::Completed, "mgr-1", Some("wrapped"))
            .unwrap();
        assert_eq!(event.status, EventStatus::Completed);

        let history = svc.status_history(&event.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from_status, EventStatus::Planned);
        assert_eq!(history[2].to_status, EventStatus::Completed);
        assert_eq!(history[2].reason.as_deref(), Some("wrapped"));

        // Terminal: no further transitions.
        assert!(svc
            .transition_status(&event.id, EventStatus::Cancelled, "mgr-1", None)
            .is_err());
    }

    #[test]
    fn test_illegal_skip_rejected() {
        let svc = service();
        let event = svc.create(input("2025-09-01"), "mgr-1").unwrap();
        let err = svc
            .transition_status(&event.id, EventStatus::Completed, "mgr-1", None)
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_duplicate_copies_shell_and_budget() {
        let svc = service();
        let event = svc.create(input("2025-09-01"), "mgr-1").unwrap();
        svc.db
            .exec(
                "INSERT INTO event_financials (event_id, kind, staff, total, revenue, profit, updated_at)
                 VALUES (?1, 'budget', 400.0, 400.0, 900.0, 500.0, '2025-01-01T00:00:00Z')",
                params![event.id],
            )
            .unwrap();

        let copy = svc
            .duplicate(
                &event.id,
                NaiveDate::from_ymd_opt(2025, 9, 8).unwrap(),
                true,
                "mgr-1",
            )
            .unwrap();
        assert_eq!(copy.title, event.title);
        assert_eq!(copy.status, EventStatus::Planned);
        assert_ne!(copy.id, event.id);

        let staff: f64 = svc
            .db
            .query_one(
                "SELECT staff FROM event_financials WHERE event_id = ?1 AND kind = 'budget'",
                params![copy.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(staff, 400.0);
    }

    #[test]
    fn test_duplicate_bulk_partial_outcomes() {
        let svc = service();
        let event = svc.create(input("2025-09-01"), "mgr-1").unwrap();
        let dates = vec![
            NaiveDate::from_ymd_opt(2025, 9, 8).unwrap(),
            NaiveDate::from_ymd_opt(2025, 9, 15).unwrap(),
        ];
        let outcomes = svc.duplicate_bulk(&event.id, &dates, false, "mgr-1");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
    }

    #[test]
    fn test_assignment_uniqueness_and_transitions() {
        let svc = service();
        let event = svc.create(input("2025-09-01"), "mgr-1").unwrap();

        let assignment = svc.assign_ambassador(&event.id, "amb-1").unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Pending);

        // Unique (event, ambassador).
        assert!(matches!(
            svc.assign_ambassador(&event.id, "amb-1"),
            Err(AppError::Conflict(_))
        ));

        let confirmed = svc
            .transition_assignment(&assignment.id, AssignmentStatus::Confirmed, None)
            .unwrap();
        let completed = svc
            .transition_assignment(&confirmed.id, AssignmentStatus::Completed, Some(5.5))
            .unwrap();
        assert_eq!(completed.hours_worked, Some(5.5));

        assert!(svc
            .transition_assignment(&completed.id, AssignmentStatus::Pending, None)
            .is_err());
    }

    #[test]
    fn test_delete_rules() {
        let svc = service();
        let event = svc.create(input("2025-09-01"), "mgr-1").unwrap();
        svc.delete(&event.id, "mgr-1").unwrap();
        assert!(matches!(svc.get(&event.id), Err(AppError::NotFound(_))));

        let event = svc.create(input("2025-09-02"), "mgr-1").unwrap();
        svc.transition_status(&event.id, EventStatus::Confirmed, "mgr-1", None)
            .unwrap();
        assert!(matches!(
            svc.delete(&event.id, "mgr-1"),
            Err(AppError::Conflict(_))
        ));
    }
}
