//! Real-time client registry.
//!
//! Tracks connected WebSocket sessions, their subscription filters, and the
//! last ping time. Delivery goes through a bounded per-session channel; a
//! slow consumer loses its session, never the publisher's throughput. The
//! registry mutex guards O(1) per subscription update and O(N_clients) per
//! publish, which is acceptable because N is bounded by the connection
//! limit.

use crate::auth::Role;
use crate::bus::events::{types, DomainEvent};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-session outbound queue depth. A client this far behind is closed.
const SESSION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    pub event_types: Option<Vec<String>>,
    pub event_ids: Option<Vec<String>>,
}

impl SubscriptionFilter {
    fn matches_type(&self, event_type: &str) -> bool {
        match &self.event_types {
            Some(kinds) => kinds.iter().any(|k| k == event_type),
            None => true,
        }
    }
}

struct ClientSession {
    user_id: String,
    role: Role,
    filter: SubscriptionFilter,
    connected_at: i64,
    last_ping: i64,
    tx: mpsc::Sender<DomainEvent>,
}

/// Decides whether a session may see an event.
///
/// - admin/manager: anything passing the subscription filter
/// - ambassador: own sign-ups, or events it explicitly subscribed to
/// - affiliate: sync-completion and payroll notices only
/// - anything else: nothing
pub fn session_permits(
    role: Role,
    user_id: &str,
    filter: &SubscriptionFilter,
    event: &DomainEvent,
) -> bool {
    if !filter.matches_type(&event.event_type) {
        return false;
    }
    match role {
        Role::Admin | Role::Manager => true,
        Role::Ambassador => {
            let own = event.ambassador_id().is_some_and(|a| a == user_id);
            let subscribed = match (&filter.event_ids, event.event_id()) {
                (Some(ids), Some(event_id)) => ids.iter().any(|id| id == event_id),
                _ => false,
            };
            own || subscribed
        }
        Role::Affiliate => matches!(
            event.event_type.as_str(),
            types::EXTERNAL_SYNC_COMPLETED | types::PAYROLL_PROCESSED
        ),
        Role::Unknown => false,
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    sessions: Mutex<HashMap<String, ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and hand back its event receiver.
    pub fn register(
        &self,
        session_id: &str,
        user_id: &str,
        role: Role,
    ) -> mpsc::Receiver<DomainEvent> {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let now = Utc::now().timestamp();
        let session = ClientSession {
            user_id: user_id.to_string(),
            role,
            filter: SubscriptionFilter::default(),
            connected_at: now,
            last_ping: now,
            tx,
        };
        self.sessions.lock().insert(session_id.to_string(), session);
        info!(session_id, user_id, role = role.as_str(), "client connected");
        rx
    }

    pub fn remove(&self, session_id: &str) {
        if self.sessions.lock().remove(session_id).is_some() {
            debug!(session_id, "client removed");
        }
    }

    pub fn update_filter(&self, session_id: &str, filter: SubscriptionFilter) {
        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            session.filter = filter;
        }
    }

    pub fn record_ping(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            session.last_ping = Utc::now().timestamp();
        }
    }

    /// Session's role, user id, filter, and connect time, for replay checks.
    pub fn session_view(&self, session_id: &str) -> Option<(Role, String, SubscriptionFilter, i64)> {
        self.sessions.lock().get(session_id).map(|s| {
            (
                s.role,
                s.user_id.clone(),
                s.filter.clone(),
                s.connected_at,
            )
        })
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Deliver an event to every session the matrix permits. Sessions whose
    /// channel is full or closed are dropped on the spot.
    pub fn deliver(&self, event: &DomainEvent) -> usize {
        let mut dead: Vec<String> = Vec::new();
        let mut delivered = 0usize;
        {
            let sessions = self.sessions.lock();
            for (id, session) in sessions.iter() {
                if !session_permits(session.role, &session.user_id, &session.filter, event) {
                    continue;
                }
                match session.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session_id = %id, "client channel full, disconnecting");
                        dead.push(id.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id.clone()),
                }
            }
        }
        for id in dead {
            self.remove(&id);
        }
        delivered
    }

    /// Drop sessions whose last ping is older than `max_age_secs`. Returns
    /// how many were reaped.
    pub fn reap_stale(&self, max_age_secs: i64) -> usize {
        let cutoff = Utc::now().timestamp() - max_age_secs;
        let stale: Vec<String> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.last_ping < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let count = stale.len();
        for id in &stale {
            info!(session_id = %id, "reaping stale client session");
            self.remove(id);
        }
        count
    }
}
