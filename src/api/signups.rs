//! Sign-up endpoints: intake, validation, extraction review, fan-out
//! retries, audit.

use super::{ok, ok_with_meta, page_window, Meta};
use crate::auth::{Claims, Role};
use crate::error::AppError;
use crate::models::SyncPhase;
use crate::signup::{ExtractionCorrections, SignUpSubmission};
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
        .route("/signups", get(list_signups).post(create_direct))
        .route("/signups/event", post(submit_event_signup))
        .route("/signups/solo", post(submit_solo_signup))
        .route("/signups/check-duplicate", post(check_duplicate))
        .route("/signups/extraction/review-queue", get(review_queue))
        .route(
            "/signups/extraction/:id/extraction/confirm",
            post(confirm_extraction),
        )
        .route(
            "/signups/extraction/:id/extraction/skip",
            post(skip_extraction),
        )
        .route("/signups/customerio/sync-failures", get(sync_failures))
        .route("/signups/customerio/:id/retry", post(retry_sync))
        .route("/signups/:id", get(get_signup))
        .route("/signups/:id/validate", patch(validate_signup))
        .route("/signups/:id/audit", get(audit_trail))
}

const STAFF: &[Role] = &[Role::Admin, Role::Manager];
const SUBMITTERS: &[Role] = &[Role::Admin, Role::Manager, Role::Ambassador];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpListQuery {
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
    page: Option<u32>,
    limit: Option<u32>,
    offset: Option<u32>,
    operator_id: Option<i64>,
}

async fn list_signups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SignUpListQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let (limit, offset) = page_window(query.page, query.offset, query.limit);
    let (rows, total) = state.pipeline.store().list(
        query.from_date,
        query.to_date,
        query.operator_id,
        limit,
        offset,
    )?;
    Ok(ok_with_meta(
        rows,
        Meta {
            total: Some(total),
            page: query.page,
            limit: Some(limit),
        },
    ))
}

async fn get_signup(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(SUBMITTERS)?;
    let sign_up = state.pipeline.store().get(&id).map_err(|e| match e {
        crate::db::DbError::NotFound => AppError::NotFound(format!("sign-up {id}")),
        other => other.into(),
    })?;
    if claims.role == Role::Ambassador && sign_up.ambassador_id != claims.sub {
        return Err(AppError::Authorization(
            "ambassadors may only read their own sign-ups".into(),
        ));
    }
    Ok(ok(sign_up))
}

async fn submit_event_signup(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(submission): Json<SignUpSubmission>,
) -> Result<Response, AppError> {
    claims.require(SUBMITTERS)?;
    let outcome = state.pipeline.submit_event_signup(submission)?;
    Ok(ok(
        json!({ "signUp": outcome.sign_up, "created": outcome.created }),
    ))
}

async fn submit_solo_signup(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(submission): Json<SignUpSubmission>,
) -> Result<Response, AppError> {
    claims.require(SUBMITTERS)?;
    let outcome = state.pipeline.submit_solo_signup(submission)?;
    Ok(ok(
        json!({ "signUp": outcome.sign_up, "created": outcome.created }),
    ))
}

/// Trusted internal creation: validates immediately, no review pass.
async fn create_direct(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(submission): Json<SignUpSubmission>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let outcome = state.pipeline.create_direct(submission)?;
    Ok(ok(
        json!({ "signUp": outcome.sign_up, "created": outcome.created }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckDuplicateBody {
    customer_email: String,
    operator_id: i64,
}

async fn check_duplicate(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CheckDuplicateBody>,
) -> Result<Response, AppError> {
    claims.require(SUBMITTERS)?;
    let duplicate = state
        .pipeline
        .check_duplicate(&body.customer_email, body.operator_id)?;
    Ok(ok(json!({ "duplicate": duplicate })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateBody {
    approve: bool,
}

async fn validate_signup(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<ValidateBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.pipeline.validate(&id, body.approve, &claims.sub)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewQueueQuery {
    limit: Option<u32>,
}

async fn review_queue(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ReviewQueueQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let limit = query.limit.unwrap_or(100).min(500);
    Ok(ok(state.pipeline.store().review_queue(limit)?))
}

async fn confirm_extraction(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    corrections: Option<Json<ExtractionCorrections>>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let corrections = corrections.map(|Json(c)| c);
    Ok(ok(state
        .pipeline
        .confirm_extraction(&id, corrections, &claims.sub)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkipBody {
    reason: Option<String>,
}

async fn skip_extraction(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    body: Option<Json<SkipBody>>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(ok(state
        .pipeline
        .skip_extraction(&id, reason.as_deref(), &claims.sub)?))
}

async fn sync_failures(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.pipeline.store().list_sync_failures(false)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryBody {
    sync_phase: Option<String>,
}

async fn retry_sync(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    body: Option<Json<RetryBody>>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let phase = match body.and_then(|Json(b)| b.sync_phase) {
        Some(raw) => Some(
            SyncPhase::from_str(&raw)
                .ok_or_else(|| AppError::Validation(format!("unknown sync phase `{raw}`")))?,
        ),
        None => None,
    };
    let queued = state.pipeline.retry_sync(&id, phase)?;
    Ok(ok(json!({ "queued": queued })))
}

async fn audit_trail(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    // 404 before an empty trail for a nonexistent sign-up.
    state.pipeline.store().get(&id).map_err(|e| match e {
        crate::db::DbError::NotFound => AppError::NotFound(format!("sign-up {id}")),
        other => other.into(),
    })?;
    let trail: Vec<_> = state
        .pipeline
        .store()
        .audit_trail(&id)?
        .into_iter()
        .map(|(action, actor, detail, at)| {
            json!({ "action": action, "actor": actor, "detail": detail, "at": at })
        })
        .collect();
    Ok(ok(trail))
}
