//! KPI threshold and alert endpoints.

use super::ok;
use crate::auth::{Claims, Role};
use crate::error::AppError;
use crate::kpi::{AlertStatus, MetricSample, ThresholdContent};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/kpi/thresholds", get(list_thresholds).post(create_threshold))
        .route(
            "/kpi/thresholds/:id",
            get(get_threshold).put(update_threshold).delete(delete_threshold),
        )
        .route("/kpi/thresholds/:id/versions", get(list_versions))
        .route("/kpi/thresholds/:id/at", get(threshold_at_time))
        .route("/kpi/thresholds/:id/rollback", post(rollback_threshold))
        .route("/kpi/check", post(check_thresholds))
        .route("/kpi/alerts", get(list_alerts))
        .route("/kpi/alerts/:id", get(get_alert))
        .route("/kpi/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/kpi/alerts/:id/resolve", post(resolve_alert))
        .route("/kpi/alerts/:id/snooze", post(snooze_alert))
        .route("/kpi/alerts/:id/notifications", get(alert_notifications))
}

const STAFF: &[Role] = &[Role::Admin, Role::Manager];

async fn list_thresholds(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.list_thresholds(false)?))
}

async fn create_threshold(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(content): Json<ThresholdContent>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.create_threshold(content)?))
}

async fn get_threshold(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.get_threshold(&id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    #[serde(flatten)]
    content: ThresholdContent,
    change_reason: Option<String>,
}

async fn update_threshold(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.update_threshold(
        &id,
        body.content,
        body.change_reason.as_deref(),
    )?))
}

async fn delete_threshold(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(&[Role::Admin])?;
    state.kpi.delete_threshold(&id)?;
    Ok(ok(json!({ "deleted": id })))
}

async fn list_versions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    state.kpi.get_threshold(&id)?;
    Ok(ok(state.kpi.list_versions(&id)?))
}

#[derive(Debug, Deserialize)]
struct AtQuery {
    t: i64,
}

async fn threshold_at_time(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Query(query): Query<AtQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    state.kpi.get_threshold(&id)?;
    Ok(ok(state.kpi.get_threshold_at_time(&id, query.t)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackBody {
    target_version: u32,
    reason: Option<String>,
}

async fn rollback_threshold(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.rollback_threshold(
        &id,
        body.target_version,
        body.reason.as_deref(),
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricBody {
    kpi_name: String,
    value: f64,
    previous_value: Option<f64>,
}

/// Manual evaluation trigger with caller-supplied metrics.
async fn check_thresholds(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(metrics): Json<Vec<MetricBody>>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let samples: Vec<MetricSample> = metrics
        .into_iter()
        .map(|m| MetricSample {
            kpi_name: m.kpi_name,
            value: m.value,
            previous_value: m.previous_value,
        })
        .collect();
    Ok(ok(state.kpi.check_thresholds(&samples).await?))
}

#[derive(Debug, Deserialize)]
struct AlertListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<AlertListQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let status = match &query.status {
        Some(raw) => Some(
            AlertStatus::from_str(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown status `{raw}`")))?,
        ),
        None => None,
    };
    Ok(ok(state
        .kpi
        .list_alerts(status, query.limit.unwrap_or(100).min(500))?))
}

async fn get_alert(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.get_alert(&id)?))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.acknowledge_alert(&id, &claims.sub)?))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.resolve_alert(&id, &claims.sub)?))
}

#[derive(Debug, Deserialize)]
struct SnoozeBody {
    minutes: u32,
}

async fn snooze_alert(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<SnoozeBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.kpi.snooze_alert(&id, body.minutes)?))
}

async fn alert_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    state.kpi.get_alert(&id)?;
    Ok(ok(state.kpi.notifications_for(&id)?))
}
