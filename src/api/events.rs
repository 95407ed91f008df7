//! Event scheduling endpoints.

use super::{ok, ok_with_meta, page_window, Meta};
use crate::auth::{Claims, Role};
use crate::error::AppError;
use crate::events::EventInput;
use crate::financial::FinancialsInput;
use crate::models::{AssignmentStatus, EventStatus};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, patch, post};
use axum::{Extension, Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events", get(list_events).post(create_event))
        .route(
            "/events/:id",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/events/:id/status", patch(transition_status))
        .route("/events/:id/history", get(status_history))
        .route("/events/:id/duplicate", post(duplicate_event))
        .route("/events/:id/duplicate/bulk", post(duplicate_bulk))
        .route("/events/:id/duplicate/preview", get(duplicate_preview))
        .route("/events/:id/budget", get(get_budget).put(put_budget))
        .route("/events/:id/actuals", get(get_actuals).put(put_actuals))
        .route(
            "/events/:id/assignments",
            get(list_assignments).post(create_assignment),
        )
        .route("/assignments/:id", patch(update_assignment))
}

const READ_ROLES: &[Role] = &[Role::Admin, Role::Manager, Role::Ambassador];
const WRITE_ROLES: &[Role] = &[Role::Admin, Role::Manager];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListQuery {
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
    page: Option<u32>,
    limit: Option<u32>,
    offset: Option<u32>,
    status: Option<String>,
}

async fn list_events(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<EventListQuery>,
) -> Result<Response, AppError> {
    claims.require(READ_ROLES)?;
    let status = match &query.status {
        Some(raw) => Some(
            EventStatus::from_str(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown status `{raw}`")))?,
        ),
        None => None,
    };
    let (limit, offset) = page_window(query.page, query.offset, query.limit);
    let (events, total) =
        state
            .events
            .list(query.from_date, query.to_date, status, limit, offset)?;
    Ok(ok_with_meta(
        events,
        Meta {
            total: Some(total),
            page: query.page,
            limit: Some(limit),
        },
    ))
}

async fn create_event(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(input): Json<EventInput>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    let event = state.events.create(input, &claims.sub)?;
    Ok(ok(event))
}

async fn get_event(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(READ_ROLES)?;
    Ok(ok(state.events.get(&id)?))
}

async fn update_event(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(input): Json<EventInput>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    Ok(ok(state.events.update(&id, input, &claims.sub)?))
}

async fn delete_event(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    state.events.delete(&id, &claims.sub)?;
    Ok(ok(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitionBody {
    status: String,
    reason: Option<String>,
}

async fn transition_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    let to = EventStatus::from_str(&body.status)
        .ok_or_else(|| AppError::Validation(format!("unknown status `{}`", body.status)))?;
    Ok(ok(state.events.transition_status(
        &id,
        to,
        &claims.sub,
        body.reason.as_deref(),
    )?))
}

async fn status_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(READ_ROLES)?;
    state.events.get(&id)?;
    Ok(ok(state.events.status_history(&id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateBody {
    target_date: NaiveDate,
    #[serde(default)]
    copy_budget: bool,
}

async fn duplicate_event(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<DuplicateBody>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    Ok(ok(state.events.duplicate(
        &id,
        body.target_date,
        body.copy_budget,
        &claims.sub,
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateBulkBody {
    target_dates: Vec<NaiveDate>,
    #[serde(default)]
    copy_budget: bool,
}

async fn duplicate_bulk(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<DuplicateBulkBody>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    if body.target_dates.is_empty() {
        return Err(AppError::Validation("targetDates must not be empty".into()));
    }
    let outcomes = state
        .events
        .duplicate_bulk(&id, &body.target_dates, body.copy_budget, &claims.sub);
    // Per-date outcomes; partial success is observable.
    let rows: Vec<_> = outcomes
        .into_iter()
        .map(|(date, result)| match result {
            Ok(event) => json!({ "targetDate": date, "success": true, "event": event }),
            Err(e) => json!({ "targetDate": date, "success": false, "error": e.to_string() }),
        })
        .collect();
    Ok(ok(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DuplicatePreviewQuery {
    target_dates: Option<String>,
    #[serde(default)]
    copy_budget: bool,
}

async fn duplicate_preview(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Query(query): Query<DuplicatePreviewQuery>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    let dates: Vec<NaiveDate> = query
        .target_dates
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| AppError::Validation(format!("bad date `{s}`")))
        })
        .collect::<Result<_, _>>()?;
    Ok(ok(state
        .events
        .duplicate_preview(&id, &dates, query.copy_budget)?))
}

// -- budget / actuals -------------------------------------------------------

async fn get_budget(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(READ_ROLES)?;
    state.events.get(&id)?;
    Ok(ok(state.financial.get_financials(&id, "budget")?))
}

async fn put_budget(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(input): Json<FinancialsInput>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    Ok(ok(state.financial.upsert_financials(&id, "budget", input)?))
}

async fn get_actuals(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(READ_ROLES)?;
    state.events.get(&id)?;
    Ok(ok(state.financial.get_financials(&id, "actual")?))
}

async fn put_actuals(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(input): Json<FinancialsInput>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    Ok(ok(state.financial.upsert_financials(&id, "actual", input)?))
}

// -- assignments ------------------------------------------------------------

async fn list_assignments(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(READ_ROLES)?;
    state.events.get(&id)?;
    Ok(ok(state.events.list_assignments(&id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentBody {
    ambassador_id: String,
}

async fn create_assignment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<AssignmentBody>,
) -> Result<Response, AppError> {
    claims.require(WRITE_ROLES)?;
    Ok(ok(state.events.assign_ambassador(&id, &body.ambassador_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentUpdateBody {
    status: String,
    hours_worked: Option<f64>,
}

async fn update_assignment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<AssignmentUpdateBody>,
) -> Result<Response, AppError> {
    // Ambassadors may confirm/decline their own assignments.
    claims.require(READ_ROLES)?;
    let to = AssignmentStatus::from_str(&body.status)
        .ok_or_else(|| AppError::Validation(format!("unknown status `{}`", body.status)))?;
    if claims.role == Role::Ambassador {
        let assignment = state.events.get_assignment(&id)?;
        if assignment.ambassador_id != claims.sub {
            return Err(AppError::Authorization(
                "ambassadors may only update their own assignments".into(),
            ));
        }
    }
    Ok(ok(state
        .events
        .transition_assignment(&id, to, body.hours_worked)?))
}
