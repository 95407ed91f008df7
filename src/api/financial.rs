//! Financial endpoints: budgets, expenses, revenue, P&L, payroll.

use super::ok;
use crate::auth::{Claims, Role};
use crate::error::AppError;
use crate::financial::FinancialsInput;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/financial/budget-actuals-report", get(budget_actuals_report))
        .route("/financial/budgets", post(upsert_budget))
        .route("/financial/expenses", get(list_expenses).post(create_expense))
        .route("/financial/expenses/reconcile", post(reconcile_expenses))
        .route("/financial/revenue", post(record_revenue))
        .route("/financial/revenue/summary", get(revenue_summary))
        .route("/financial/pnl", get(pnl_report))
        .route("/payroll/periods", post(ensure_period))
        .route("/payroll/periods/:id/process", post(process_period))
}

const STAFF: &[Role] = &[Role::Admin, Role::Manager];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DateWindowQuery {
    from_date: NaiveDate,
    to_date: NaiveDate,
}

async fn budget_actuals_report(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<DateWindowQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state
        .financial
        .budget_actuals_report(query.from_date, query.to_date)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BudgetBody {
    event_id: String,
    /// "budget" or "actual"
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(flatten)]
    input: FinancialsInput,
}

fn default_kind() -> String {
    "budget".to_string()
}

async fn upsert_budget(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<BudgetBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state
        .financial
        .upsert_financials(&body.event_id, &body.kind, body.input)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpenseListQuery {
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
}

async fn list_expenses(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ExpenseListQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state
        .financial
        .list_expenses(query.from_date, query.to_date)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpenseBody {
    event_id: Option<String>,
    description: String,
    amount: f64,
    incurred_on: NaiveDate,
}

async fn create_expense(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ExpenseBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state.financial.create_expense(
        body.event_id.as_deref(),
        &body.description,
        body.amount,
        body.incurred_on,
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileBody {
    from_date: NaiveDate,
    to_date: NaiveDate,
}

/// Pull the window's card transactions from CardOps and fold them into the
/// local expense table.
async fn reconcile_expenses(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ReconcileBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let from = body.from_date.format("%Y-%m-%d").to_string();
    let to = body.to_date.format("%Y-%m-%d").to_string();
    let transactions = state
        .cardops
        .fetch_all_transactions(&from, &to)
        .await
        .map_err(AppError::from)?;
    Ok(ok(state.financial.reconcile_expenses(&transactions)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevenueBody {
    event_id: Option<String>,
    operator_id: Option<i64>,
    amount: f64,
    earned_on: NaiveDate,
    description: Option<String>,
}

async fn record_revenue(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<RevenueBody>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    let id = state.financial.record_revenue(
        body.event_id.as_deref(),
        body.operator_id,
        body.amount,
        body.earned_on,
        body.description.as_deref(),
    )?;
    Ok(ok(json!({ "id": id })))
}

async fn revenue_summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<DateWindowQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state
        .financial
        .revenue_summary(query.from_date, query.to_date)?))
}

async fn pnl_report(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<DateWindowQuery>,
) -> Result<Response, AppError> {
    claims.require(STAFF)?;
    Ok(ok(state
        .financial
        .pnl_report(query.from_date, query.to_date)?))
}

// -- payroll ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodBody {
    period_start: NaiveDate,
    period_end: NaiveDate,
}

async fn ensure_period(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<PeriodBody>,
) -> Result<Response, AppError> {
    claims.require(&[Role::Admin])?;
    Ok(ok(state
        .payroll
        .ensure_period(body.period_start, body.period_end)?))
}

async fn process_period(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    claims.require(&[Role::Admin])?;
    Ok(ok(state.payroll.process_period(&id).await?))
}
