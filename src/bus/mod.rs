//! Domain event bus.
//!
//! `publish` is fire-and-forget for callers: it stamps the event, appends it
//! to the durable log, pushes it into the bounded in-memory replay ring, and
//! fans it out to connected clients through the registry. Replay requests
//! read the durable log, not the ring; the ring exists so a late-joining
//! dashboard can hydrate without a database round trip.

pub mod events;
pub mod registry;
pub mod ws;

pub use events::{types, DomainEvent};
pub use registry::{session_permits, ClientRegistry, SubscriptionFilter};

use crate::db::Database;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub struct EventBus {
    db: Arc<Database>,
    pub registry: Arc<ClientRegistry>,
    replay_ring: Mutex<VecDeque<DomainEvent>>,
    ring_capacity: usize,
    /// Millisecond clock that never moves backwards, even if the wall
    /// clock does. Publish order within the process is the timestamp order.
    clock_ms: AtomicI64,
}

impl EventBus {
    pub fn new(db: Arc<Database>, registry: Arc<ClientRegistry>, ring_capacity: usize) -> Self {
        Self {
            db,
            registry,
            replay_ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            clock_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.clock_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }

    /// Publish a domain event. Never fails the caller; log-append problems
    /// are logged and the in-memory fan-out still happens.
    pub fn publish(&self, event_type: &str, payload: Value, user_id: Option<&str>) -> DomainEvent {
        let event = DomainEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            payload,
            user_id: user_id.map(|u| u.to_string()),
            timestamp: self.next_timestamp(),
        };

        if let Err(e) = self.db.exec(
            "INSERT INTO domain_event_log (id, event_type, payload_json, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.event_type,
                event.payload.to_string(),
                event.user_id,
                event.timestamp,
            ],
        ) {
            warn!(event_type, "failed to append domain event log: {e}");
        }

        {
            let mut ring = self.replay_ring.lock();
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let delivered = self.registry.deliver(&event);
        metrics::counter!("bus_events_published", 1);
        metrics::counter!("bus_events_delivered", delivered as u64);

        event
    }

    /// Newest ring contents, oldest first. Used by tests and the dashboard
    /// hydration path.
    pub fn ring_snapshot(&self) -> Vec<DomainEvent> {
        self.replay_ring.lock().iter().cloned().collect()
    }

    /// Replay logged events for one session, ascending, re-filtered through
    /// the authorization matrix.
    pub fn replay(
        &self,
        session_id: &str,
        from_timestamp: i64,
        event_types: Option<&[String]>,
        limit: usize,
    ) -> Vec<DomainEvent> {
        let Some((role, user_id, filter, _connected_at)) = self.registry.session_view(session_id)
        else {
            return Vec::new();
        };

        let rows = self.db.query_many(
            "SELECT id, event_type, payload_json, user_id, created_at
             FROM domain_event_log
             WHERE created_at >= ?1
             ORDER BY created_at ASC",
            params![from_timestamp],
            |row| {
                let payload: String = row.get(2)?;
                Ok(DomainEvent {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    user_id: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            },
        );

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("replay query failed: {e}");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter(|ev| match event_types {
                Some(kinds) if !kinds.is_empty() => kinds.iter().any(|k| *k == ev.event_type),
                _ => true,
            })
            .filter(|ev| session_permits(role, &user_id, &filter, ev))
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use serde_json::json;

    fn bus() -> EventBus {
        let db = Arc::new(Database::open_in_memory().unwrap());
        EventBus::new(db, Arc::new(ClientRegistry::new()), 3)
    }

    #[test]
    fn test_publish_assigns_monotonic_timestamps() {
        let bus = bus();
        let a = bus.publish(types::SIGN_UP_SUBMITTED, json!({}), None);
        let b = bus.publish(types::SIGN_UP_SUBMITTED, json!({}), None);
        let c = bus.publish(types::SIGN_UP_SUBMITTED, json!({}), None);
        assert!(a.timestamp < b.timestamp);
        assert!(b.timestamp < c.timestamp);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_ring_evicts_fifo() {
        let bus = bus();
        for i in 0..5 {
            bus.publish(types::SIGN_UP_SUBMITTED, json!({ "n": i }), None);
        }
        let ring = bus.ring_snapshot();
        assert_eq!(ring.len(), 3);
        // Oldest two evicted.
        assert_eq!(ring[0].payload["n"], 2);
        assert_eq!(ring[2].payload["n"], 4);
    }

    #[tokio::test]
    async fn test_replay_filters_by_role() {
        let bus = bus();
        let _rx = bus.registry.register("sess-amb", "amb-1", Role::Ambassador);
        let _rx2 = bus.registry.register("sess-adm", "adm-1", Role::Admin);

        bus.publish(
            types::SIGN_UP_SUBMITTED,
            json!({"ambassadorId": "amb-1"}),
            None,
        );
        bus.publish(
            types::SIGN_UP_SUBMITTED,
            json!({"ambassadorId": "amb-2"}),
            None,
        );

        let admin_view = bus.replay("sess-adm", 0, None, 100);
        assert_eq!(admin_view.len(), 2);

        let amb_view = bus.replay("sess-amb", 0, None, 100);
        assert_eq!(amb_view.len(), 1);
        assert_eq!(amb_view[0].payload["ambassadorId"], "amb-1");
    }

    #[tokio::test]
    async fn test_replay_respects_from_timestamp_and_types() {
        let bus = bus();
        let _rx = bus.registry.register("sess", "adm-1", Role::Admin);

        let first = bus.publish(types::SIGN_UP_SUBMITTED, json!({}), None);
        bus.publish(types::EVENT_UPDATED, json!({}), None);
        let third = bus.publish(types::SIGN_UP_SUBMITTED, json!({}), None);

        // From after the first event.
        let view = bus.replay("sess", first.timestamp + 1, None, 100);
        assert_eq!(view.len(), 2);

        let only_signups = bus.replay(
            "sess",
            0,
            Some(&[types::SIGN_UP_SUBMITTED.to_string()]),
            100,
        );
        assert_eq!(only_signups.len(), 2);
        assert_eq!(only_signups[1].id, third.id);
    }

    #[tokio::test]
    async fn test_unknown_session_replays_nothing() {
        let bus = bus();
        bus.publish(types::SIGN_UP_SUBMITTED, json!({}), None);
        assert!(bus.replay("no-such-session", 0, None, 10).is_empty());
    }
}
