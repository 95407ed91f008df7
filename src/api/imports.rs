//! Admin import endpoints.
//!
//! `parse` previews without writing; `execute` runs the importer; the `:id`
//! action endpoint handles cancel and rollback; `audit-trail` exposes the
//! append-only decision log.

use super::ok;
use crate::auth::{Claims, Role};
use crate::error::AppError;
use crate::import::{ImportOptions, ImportPreview, ImportSummary};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/imports/parse", post(parse_import))
        .route("/admin/imports/validate", post(validate_import))
        .route("/admin/imports/reconcile", post(reconcile_import))
        .route("/admin/imports/execute", post(execute_import))
        .route("/admin/imports/:id", post(import_action).get(get_import))
        .route("/admin/imports/:id/audit-trail", get(audit_trail))
        .route("/admin/imports/:id/rows", get(row_details))
}

const ADMIN: &[Role] = &[Role::Admin];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody {
    /// "signups", "events", or "budget_actuals"
    import_type: String,
    content: String,
    file_name: Option<String>,
    default_year: Option<i32>,
}

impl ImportBody {
    fn options(&self, started_by: &str) -> ImportOptions {
        ImportOptions {
            file_name: self.file_name.clone(),
            default_year: self.default_year,
            started_by: Some(started_by.to_string()),
        }
    }
}

fn run_preview(state: &AppState, body: &ImportBody, options: &ImportOptions) -> Result<ImportPreview, AppError> {
    match body.import_type.as_str() {
        "signups" => state.importer.preview_signups(&body.content, options),
        "events" => state.importer.preview_events(&body.content, options),
        "budget_actuals" => state.importer.preview_budget(&body.content, options),
        other => Err(AppError::Validation(format!("unknown import type `{other}`"))),
    }
}

fn run_import(state: &AppState, body: &ImportBody, options: &ImportOptions) -> Result<ImportSummary, AppError> {
    match body.import_type.as_str() {
        "signups" => state.importer.import_signups(&body.content, options),
        "events" => state.importer.import_events(&body.content, options),
        "budget_actuals" => state.importer.import_budget(&body.content, options),
        other => Err(AppError::Validation(format!("unknown import type `{other}`"))),
    }
}

/// Parse + header detection preview.
async fn parse_import(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ImportBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    let options = body.options(&claims.sub);
    Ok(ok(run_preview(&state, &body, &options)?))
}

/// Same preview, answered as a go / no-go verdict.
async fn validate_import(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ImportBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    let options = body.options(&claims.sub);
    let preview = run_preview(&state, &body, &options)?;
    let ready = preview.total_rows > 0 && preview.unresolved_entities == 0;
    Ok(ok(json!({ "preview": preview, "ready": ready })))
}

/// Entity-resolution and duplicate report ahead of execution.
async fn reconcile_import(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ImportBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    let options = body.options(&claims.sub);
    let preview = run_preview(&state, &body, &options)?;
    Ok(ok(json!({
        "wouldBeDuplicates": preview.would_be_duplicates,
        "unresolvedEntities": preview.unresolved_entities,
        "totalRows": preview.total_rows,
    })))
}

async fn execute_import(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ImportBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    let options = body.options(&claims.sub);
    Ok(ok(run_import(&state, &body, &options)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionBody {
    /// "cancel" or "rollback"
    action: String,
}

async fn import_action(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<ActionBody>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    match body.action.as_str() {
        "cancel" => {
            state.importer.get_import(&id)?;
            state.importer.cancel_import(&id);
            Ok(ok(json!({ "cancelled": id })))
        }
        "rollback" => {
            let deleted = state.importer.rollback_import(&id)?;
            Ok(ok(json!({ "rolledBack": id, "deletedRows": deleted })))
        }
        other => Err(AppError::Validation(format!("unknown action `{other}`"))),
    }
}

async fn get_import(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    Ok(ok(state.importer.get_import(&id)?))
}

async fn audit_trail(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    state.importer.get_import(&id)?;
    let entries: Vec<_> = state
        .importer
        .audit_trail(&id)?
        .into_iter()
        .map(|(entity_type, entity_id, action, detail, at)| {
            json!({
                "entityType": entity_type,
                "entityId": entity_id,
                "action": action,
                "detail": detail,
                "at": at,
            })
        })
        .collect();
    Ok(ok(entries))
}

async fn row_details(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(ADMIN)?;
    state.importer.get_import(&id)?;
    let rows: Vec<_> = state
        .importer
        .row_details(&id)?
        .into_iter()
        .map(|(row_number, status, action, message)| {
            json!({
                "rowNumber": row_number,
                "status": status,
                "action": action,
                "message": message,
            })
        })
        .collect();
    Ok(ok(rows))
}
