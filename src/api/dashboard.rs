//! Dashboard read models and sync administration.

use super::ok;
use crate::auth::{Claims, Role};
use crate::error::AppError;
use crate::state::AppState;
use crate::sync::sources;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::NaiveDate;
use rusqlite::params;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dashboard/signups-summary", get(signups_summary))
        .route("/dashboard/events-summary", get(events_summary))
        .route("/dashboard/sync-status", get(sync_status))
        .route("/admin/sync/run", post(run_sync))
        .route("/admin/sync/checkpoints", get(list_checkpoints))
        .route("/admin/sync/checkpoints/:id/pause", post(pause_sync))
        .route("/admin/sync/cleanup", post(cleanup_checkpoints))
        .route("/admin/credentials", post(store_credential))
}

const STAFF: &[Role] = &[Role::Admin, Role::Manager];
const ADMIN: &[Role] = &[Role::Admin];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowQuery {
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
}

async fn signups_summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let from = query
        .from_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "0000-01-01".into());
    let to = query
        .to_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "9999-12-31".into());

    let by_status: Vec<(String, i64)> = state.db.query_many(
        "SELECT validation_status, COUNT(*) FROM sign_ups
         WHERE date(submitted_at) >= ?1 AND date(submitted_at) <= ?2
         GROUP BY validation_status",
        params![from, to],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (total, total_cpa): (i64, f64) = state.db.query_one(
        "SELECT COUNT(*), COALESCE(SUM(cpa_amount), 0) FROM sign_ups
         WHERE date(submitted_at) >= ?1 AND date(submitted_at) <= ?2",
        params![from, to],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let review_queue: i64 = state.db.query_one(
        "SELECT COUNT(*) FROM sign_ups WHERE extraction_status = 'needs_review'",
        [],
        |row| row.get(0),
    )?;

    Ok(ok(json!({
        "total": total,
        "totalCpa": total_cpa,
        "byStatus": by_status.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        "extractionReviewQueue": review_queue,
    })))
}

async fn events_summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let from = query
        .from_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "0000-01-01".into());
    let to = query
        .to_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "9999-12-31".into());

    let by_status: Vec<(String, i64)> = state.db.query_many(
        "SELECT status, COUNT(*) FROM events
         WHERE event_date >= ?1 AND event_date <= ?2
         GROUP BY status",
        params![from, to],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let signups_per_event: Vec<(String, String, i64)> = state.db.query_many(
        "SELECT e.id, e.title, COUNT(s.id)
         FROM events e LEFT JOIN sign_ups s ON s.event_id = e.id
         WHERE e.event_date >= ?1 AND e.event_date <= ?2
         GROUP BY e.id ORDER BY COUNT(s.id) DESC LIMIT 10",
        params![from, to],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(ok(json!({
        "byStatus": by_status.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        "topEventsBySignups": signups_per_event
            .into_iter()
            .map(|(id, title, count)| json!({ "eventId": id, "title": title, "signups": count }))
            .collect::<Vec<_>>(),
    })))
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let checkpoints = state.sync.list_checkpoints(None, 20)?;
    let unresolved_failures: i64 = state.db.query_one(
        "SELECT COUNT(*) FROM sync_failures WHERE resolved = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(ok(json!({
        "checkpoints": checkpoints,
        "unresolvedFanoutFailures": unresolved_failures,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunSyncBody {
    /// "ledgerbooks" or "cardops"
    integration: String,
    /// e.g. "invoices", "customers", "transactions"
    sync_type: String,
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
}

/// Kick off a checkpointed sync in the background. Returns immediately;
/// progress is visible through the checkpoints endpoint.
async fn run_sync(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<RunSyncBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;

    let orchestrator = state.sync.clone();
    match (body.integration.as_str(), body.sync_type.as_str()) {
        ("ledgerbooks", "invoices") => {
            let source = sources::LedgerBooksInvoicesSource::new(state.ledgerbooks.clone());
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(&source).await {
                    warn!("ledgerbooks invoice sync failed: {e}");
                }
            });
        }
        ("ledgerbooks", "customers") => {
            let source = sources::LedgerBooksCustomersSource::new(state.ledgerbooks.clone());
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(&source).await {
                    warn!("ledgerbooks customer sync failed: {e}");
                }
            });
        }
        ("cardops", "transactions") => {
            let from = body
                .from_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok_or_else(|| AppError::Validation("fromDate is required".into()))?;
            let to = body
                .to_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok_or_else(|| AppError::Validation("toDate is required".into()))?;
            let source = sources::CardOpsTransactionsSource::new(state.cardops.clone(), from, to);
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(&source).await {
                    warn!("cardops transaction sync failed: {e}");
                }
            });
        }
        (integration, sync_type) => {
            return Err(AppError::Validation(format!(
                "unsupported sync {integration}/{sync_type}"
            )));
        }
    }

    Ok(ok(json!({ "started": true })))
}

async fn list_checkpoints(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    Ok(ok(state.sync.list_checkpoints(None, 100)?))
}

async fn pause_sync(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    state.sync.pause_sync(&id).map_err(|e| match e {
        crate::db::DbError::NotFound => {
            AppError::NotFound(format!("in-progress checkpoint {id}"))
        }
        other => other.into(),
    })?;
    Ok(ok(json!({ "paused": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupBody {
    integration: String,
    sync_type: String,
    #[serde(default = "default_keep_last")]
    keep_last: u32,
}

fn default_keep_last() -> u32 {
    5
}

async fn cleanup_checkpoints(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CleanupBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    let deleted = state
        .sync
        .cleanup_old_checkpoints(&body.integration, &body.sync_type, body.keep_last)?;
    Ok(ok(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialBody {
    provider: String,
    access_token: String,
    refresh_token: String,
    expires_at: i64,
    scope: Option<String>,
}

/// Operator rebind path after a dead refresh token.
async fn store_credential(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CredentialBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    state.vault.store_credential(
        &body.provider,
        &body.access_token,
        &body.refresh_token,
        body.expires_at,
        body.scope.as_deref(),
    )?;
    Ok(ok(json!({ "provider": body.provider, "stored": true })))
}
