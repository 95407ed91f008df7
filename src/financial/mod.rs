//! Event financials: budgets, actuals, expenses, revenue, P&L.
//!
//! Budget and actuals are sibling rows per event; derived fields are always
//! recomputed server-side so the `total = Σ(lines)` and
//! `profit = revenue − total` invariants hold no matter what the caller
//! sent. Expense reconciliation matches CardOps transactions into the
//! local expense table by external id.

use crate::db::{Database, DbError};
use crate::error::AppError;
use crate::integrations::mappers::CardTransaction;
use crate::models::{BudgetLines, EventFinancials};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialsInput {
    #[serde(flatten)]
    pub lines: BudgetLines,
    pub revenue: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetActualsRow {
    pub event_id: String,
    pub event_title: String,
    pub event_date: NaiveDate,
    pub budget: Option<EventFinancials>,
    pub actual: Option<EventFinancials>,
    /// actual.total − budget.total when both sides exist.
    pub cost_variance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub event_id: Option<String>,
    pub description: String,
    pub amount: f64,
    pub incurred_on: NaiveDate,
    pub source: String,
    pub external_id: Option<String>,
    pub reconciled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub matched: u32,
    pub imported: u32,
    pub already_reconciled: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSummary {
    pub total: f64,
    pub by_operator: Vec<(i64, f64)>,
    pub entry_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlReportRow {
    pub event_id: String,
    pub event_title: String,
    pub revenue: f64,
    pub costs: f64,
    pub profit: f64,
    pub margin_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlReport {
    pub rows: Vec<PnlReportRow>,
    pub total_revenue: f64,
    pub total_costs: f64,
    pub total_profit: f64,
}

pub struct FinancialService {
    db: Arc<Database>,
}

impl FinancialService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // -- budgets / actuals --------------------------------------------------

    pub fn upsert_financials(
        &self,
        event_id: &str,
        kind: &str,
        input: FinancialsInput,
    ) -> Result<EventFinancials, AppError> {
        if kind != "budget" && kind != "actual" {
            return Err(AppError::Validation(format!("unknown kind `{kind}`")));
        }
        // Event must exist.
        let _: String = self
            .db
            .query_one(
                "SELECT id FROM events WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                DbError::NotFound => AppError::NotFound(format!("event {event_id}")),
                other => other.into(),
            })?;

        let mut financials = EventFinancials {
            event_id: event_id.to_string(),
            kind: kind.to_string(),
            lines: input.lines,
            total: 0.0,
            revenue: input.revenue,
            profit: 0.0,
            margin_percent: None,
            updated_at: Utc::now(),
        };
        financials.recompute();

        self.db.exec(
            "INSERT INTO event_financials
                 (event_id, kind, staff, reimbursements, rewards, base, bonus_kickback, parking,
                  setup, additional_1, additional_2, additional_3, additional_4, total, revenue,
                  profit, margin_percent, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(event_id, kind) DO UPDATE SET
                 staff = excluded.staff, reimbursements = excluded.reimbursements,
                 rewards = excluded.rewards, base = excluded.base,
                 bonus_kickback = excluded.bonus_kickback, parking = excluded.parking,
                 setup = excluded.setup, additional_1 = excluded.additional_1,
                 additional_2 = excluded.additional_2, additional_3 = excluded.additional_3,
                 additional_4 = excluded.additional_4, total = excluded.total,
                 revenue = excluded.revenue, profit = excluded.profit,
                 margin_percent = excluded.margin_percent, updated_at = excluded.updated_at",
            params![
                financials.event_id,
                financials.kind,
                financials.lines.staff,
                financials.lines.reimbursements,
                financials.lines.rewards,
                financials.lines.base,
                financials.lines.bonus_kickback,
                financials.lines.parking,
                financials.lines.setup,
                financials.lines.additional_1,
                financials.lines.additional_2,
                financials.lines.additional_3,
                financials.lines.additional_4,
                financials.total,
                financials.revenue,
                financials.profit,
                financials.margin_percent,
                financials.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(financials)
    }

    pub fn get_financials(
        &self,
        event_id: &str,
        kind: &str,
    ) -> Result<Option<EventFinancials>, AppError> {
        match self.db.query_one(
            "SELECT event_id, kind, staff, reimbursements, rewards, base, bonus_kickback,
                    parking, setup, additional_1, additional_2, additional_3, additional_4,
                    total, revenue, profit, margin_percent, updated_at
             FROM event_financials WHERE event_id = ?1 AND kind = ?2",
            params![event_id, kind],
            row_to_financials,
        ) {
            Ok(f) => Ok(Some(f)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Budget vs actuals side by side for every event in the window.
    pub fn budget_actuals_report(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BudgetActualsRow>, AppError> {
        let events: Vec<(String, String, String)> = self.db.query_many(
            "SELECT id, title, event_date FROM events
             WHERE event_date >= ?1 AND event_date <= ?2
             ORDER BY event_date ASC",
            params![
                from.format("%Y-%m-%d").to_string(),
                to.format("%Y-%m-%d").to_string()
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut rows = Vec::with_capacity(events.len());
        for (event_id, title, date) in events {
            let budget = self.get_financials(&event_id, "budget")?;
            let actual = self.get_financials(&event_id, "actual")?;
            let cost_variance = match (&budget, &actual) {
                (Some(b), Some(a)) => Some(((a.total - b.total) * 100.0).round() / 100.0),
                _ => None,
            };
            rows.push(BudgetActualsRow {
                event_id,
                event_title: title,
                event_date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").unwrap_or_default(),
                budget,
                actual,
                cost_variance,
            });
        }
        Ok(rows)
    }

    // -- expenses -----------------------------------------------------------

    pub fn create_expense(
        &self,
        event_id: Option<&str>,
        description: &str,
        amount: f64,
        incurred_on: NaiveDate,
    ) -> Result<Expense, AppError> {
        if description.trim().is_empty() {
            return Err(AppError::Validation("description must not be empty".into()));
        }
        let id = Uuid::new_v4().to_string();
        self.db.exec(
            "INSERT INTO expenses (id, event_id, description, amount, incurred_on, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'manual', ?6)",
            params![
                id,
                event_id,
                description,
                (amount * 100.0).round() / 100.0,
                incurred_on.format("%Y-%m-%d").to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(self.get_expense(&id)?)
    }

    fn get_expense(&self, id: &str) -> Result<Expense, DbError> {
        self.db.query_one(
            "SELECT id, event_id, description, amount, incurred_on, source, external_id, reconciled
             FROM expenses WHERE id = ?1",
            params![id],
            row_to_expense,
        )
    }

    pub fn list_expenses(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<Expense>, AppError> {
        let from = from
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "0000-01-01".into());
        let to = to
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "9999-12-31".into());
        self.db
            .query_many(
                "SELECT id, event_id, description, amount, incurred_on, source, external_id, reconciled
                 FROM expenses WHERE incurred_on >= ?1 AND incurred_on <= ?2
                 ORDER BY incurred_on DESC",
                params![from, to],
                row_to_expense,
            )
            .map_err(Into::into)
    }

    /// Fold partner card transactions into the expense table. Matches on
    /// `(source, external_id)`; new transactions import as reconciled rows.
    pub fn reconcile_expenses(
        &self,
        transactions: &[CardTransaction],
    ) -> Result<ReconcileOutcome, AppError> {
        let mut outcome = ReconcileOutcome {
            matched: 0,
            imported: 0,
            already_reconciled: 0,
        };

        for txn in transactions {
            let existing: Option<(String, bool)> = match self.db.query_one(
                "SELECT id, reconciled FROM expenses WHERE source = 'cardops' AND external_id = ?1",
                params![txn.external_id],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            ) {
                Ok(pair) => Some(pair),
                Err(DbError::NotFound) => None,
                Err(e) => return Err(e.into()),
            };

            match existing {
                Some((_, true)) => outcome.already_reconciled += 1,
                Some((id, false)) => {
                    self.db.exec(
                        "UPDATE expenses SET reconciled = 1, amount = ?1 WHERE id = ?2",
                        params![txn.amount, id],
                    )?;
                    outcome.matched += 1;
                }
                None => {
                    let incurred_on = txn
                        .occurred_at
                        .get(..10)
                        .unwrap_or("1970-01-01")
                        .to_string();
                    self.db.exec(
                        "INSERT INTO expenses
                             (id, description, amount, incurred_on, source, external_id, reconciled, created_at)
                         VALUES (?1, ?2, ?3, ?4, 'cardops', ?5, 1, ?6)",
                        params![
                            Uuid::new_v4().to_string(),
                            format!("{} ({})", txn.merchant, txn.department.as_deref().unwrap_or("Unassigned")),
                            txn.amount,
                            incurred_on,
                            txn.external_id,
                            Utc::now().to_rfc3339()
                        ],
                    )?;
                    outcome.imported += 1;
                }
            }
        }

        info!(
            matched = outcome.matched,
            imported = outcome.imported,
            "expense reconciliation pass done"
        );
        Ok(outcome)
    }

    // -- revenue ------------------------------------------------------------

    pub fn record_revenue(
        &self,
        event_id: Option<&str>,
        operator_id: Option<i64>,
        amount: f64,
        earned_on: NaiveDate,
        description: Option<&str>,
    ) -> Result<String, AppError> {
        if amount <= 0.0 {
            return Err(AppError::Validation("amount must be positive".into()));
        }
        let id = Uuid::new_v4().to_string();
        self.db.exec(
            "INSERT INTO revenue_entries (id, event_id, operator_id, amount, earned_on, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                event_id,
                operator_id,
                (amount * 100.0).round() / 100.0,
                earned_on.format("%Y-%m-%d").to_string(),
                description,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(id)
    }

    pub fn revenue_summary(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<RevenueSummary, AppError> {
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();

        let (total, count): (f64, i64) = self.db.query_one(
            "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM revenue_entries
             WHERE earned_on >= ?1 AND earned_on <= ?2",
            params![from, to],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let by_operator: Vec<(i64, f64)> = self.db.query_many(
            "SELECT operator_id, SUM(amount) FROM revenue_entries
             WHERE earned_on >= ?1 AND earned_on <= ?2 AND operator_id IS NOT NULL
             GROUP BY operator_id ORDER BY SUM(amount) DESC",
            params![from, to],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(RevenueSummary {
            total,
            by_operator,
            entry_count: count as u64,
        })
    }

    // -- P&L ----------------------------------------------------------------

    /// Event-level P&L over the window, built from actuals where present,
    /// falling back to budget.
    pub fn pnl_report(&self, from: NaiveDate, to: NaiveDate) -> Result<PnlReport, AppError> {
        let rows = self.budget_actuals_report(from, to)?;
        let mut report = PnlReport {
            rows: Vec::new(),
            total_revenue: 0.0,
            total_costs: 0.0,
            total_profit: 0.0,
        };
        for row in rows {
            let Some(fin) = row.actual.or(row.budget) else {
                continue;
            };
            report.total_revenue += fin.revenue;
            report.total_costs += fin.total;
            report.total_profit += fin.profit;
            report.rows.push(PnlReportRow {
                event_id: row.event_id,
                event_title: row.event_title,
                revenue: fin.revenue,
                costs: fin.total,
                profit: fin.profit,
                margin_percent: fin.margin_percent,
            });
        }
        report.total_revenue = (report.total_revenue * 100.0).round() / 100.0;
        report.total_costs = (report.total_costs * 100.0).round() / 100.0;
        report.total_profit = (report.total_profit * 100.0).round() / 100.0;
        Ok(report)
    }
}

fn row_to_financials(row: &Row<'_>) -> rusqlite::Result<EventFinancials> {
    let updated: String = row.get(17)?;
    Ok(EventFinancials {
        event_id: row.get(0)?,
        kind: row.get(1)?,
        lines: BudgetLines {
            staff: row.get(2)?,
            reimbursements: row.get(3)?,
            rewards: row.get(4)?,
            base: row.get(5)?,
            bonus_kickback: row.get(6)?,
            parking: row.get(7)?,
            setup: row.get(8)?,
            additional_1: row.get(9)?,
            additional_2: row.get(10)?,
            additional_3: row.get(11)?,
            additional_4: row.get(12)?,
        },
        total: row.get(13)?,
        revenue: row.get(14)?,
        profit: row.get(15)?,
        margin_percent: row.get(16)?,
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_expense(row: &Row<'_>) -> rusqlite::Result<Expense> {
    let incurred: String = row.get(4)?;
    Ok(Expense {
        id: row.get(0)?,
        event_id: row.get(1)?,
        description: row.get(2)?,
        amount: row.get(3)?,
        incurred_on: NaiveDate::parse_from_str(&incurred, "%Y-%m-%d").unwrap_or_default(),
        source: row.get(5)?,
        external_id: row.get(6)?,
        reconciled: row.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_event() -> (FinancialService, String) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.exec(
            "INSERT INTO events (id, title, venue, event_date, timezone, status, created_at, updated_at)
             VALUES ('ev-1', 'Game Day', 'Garden Arena', '2025-03-02', 'America/New_York',
                     'completed', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        (FinancialService::new(db), "ev-1".to_string())
    }

    fn lines() -> BudgetLines {
        BudgetLines {
            staff: 400.0,
            reimbursements: 55.25,
            rewards: 120.0,
            base: 250.0,
            bonus_kickback: 75.5,
            parking: 20.0,
            setup: 30.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_recomputes_invariants() {
        let (svc, event_id) = service_with_event();
        let fin = svc
            .upsert_financials(
                &event_id,
                "budget",
                FinancialsInput {
                    lines: lines(),
                    revenue: 1500.0,
                },
            )
            .unwrap();
        assert!(fin.is_consistent());
        assert!((fin.total - 950.75).abs() < 0.01);
        assert!((fin.profit - 549.25).abs() < 0.01);

        // Upsert replaces in place.
        let fin = svc
            .upsert_financials(
                &event_id,
                "budget",
                FinancialsInput {
                    lines: BudgetLines {
                        staff: 100.0,
                        ..Default::default()
                    },
                    revenue: 500.0,
                },
            )
            .unwrap();
        assert!((fin.total - 100.0).abs() < 0.01);

        assert!(matches!(
            svc.upsert_financials(&event_id, "forecast", FinancialsInput {
                lines: lines(),
                revenue: 0.0
            }),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            svc.upsert_financials("missing", "budget", FinancialsInput {
                lines: lines(),
                revenue: 0.0
            }),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_budget_actuals_report_variance() {
        let (svc, event_id) = service_with_event();
        svc.upsert_financials(
            &event_id,
            "budget",
            FinancialsInput {
                lines: lines(),
                revenue: 1500.0,
            },
        )
        .unwrap();
        let mut actual_lines = lines();
        actual_lines.staff = 420.0;
        svc.upsert_financials(
            &event_id,
            "actual",
            FinancialsInput {
                lines: actual_lines,
                revenue: 1430.0,
            },
        )
        .unwrap();

        let report = svc
            .budget_actuals_report(
                NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            )
            .unwrap();
        assert_eq!(report.len(), 1);
        assert!((report[0].cost_variance.unwrap() - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_expense_reconciliation() {
        let (svc, _) = service_with_event();
        // A manual expense that matches a card transaction by external id.
        svc.db
            .exec(
                "INSERT INTO expenses (id, description, amount, incurred_on, source, external_id, reconciled, created_at)
                 VALUES ('exp-1', 'parking', 40.0, '2025-03-02', 'cardops', 'txn-1', 0, '2025-03-02T00:00:00Z')",
                [],
            )
            .unwrap();

        let txns = vec![
            CardTransaction {
                external_id: "txn-1".to_string(),
                card_id: "card-1".to_string(),
                user_id: None,
                merchant: "Stadium Parking".to_string(),
                amount: 42.5,
                occurred_at: "2025-03-02T19:00:00Z".to_string(),
                department: Some("Field Ops".to_string()),
                receipt_ids: vec![],
            },
            CardTransaction {
                external_id: "txn-2".to_string(),
                card_id: "card-1".to_string(),
                user_id: None,
                merchant: "Print Shop".to_string(),
                amount: 99.0,
                occurred_at: "2025-03-03T10:00:00Z".to_string(),
                department: None,
                receipt_ids: vec![],
            },
        ];

        let outcome = svc.reconcile_expenses(&txns).unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.already_reconciled, 0);

        // Second pass is a no-op.
        let outcome = svc.reconcile_expenses(&txns).unwrap();
        assert_eq!(outcome.matched, 0);
        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.already_reconciled, 2);

        let expenses = svc.list_expenses(None, None).unwrap();
        assert_eq!(expenses.len(), 2);
        assert!(expenses.iter().all(|e| e.reconciled));
        // Matched expense took the partner amount.
        let matched = expenses.iter().find(|e| e.id == "exp-1").unwrap();
        assert_eq!(matched.amount, 42.5);
    }

    #[test]
    fn test_revenue_summary() {
        let (svc, event_id) = service_with_event();
        svc.record_revenue(
            Some(&event_id),
            Some(7),
            1000.0,
            NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
            None,
        )
        .unwrap();
        svc.record_revenue(
            None,
            Some(9),
            500.0,
            NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(),
            Some("solo month"),
        )
        .unwrap();

        let summary = svc
            .revenue_summary(
                NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            )
            .unwrap();
        assert_eq!(summary.total, 1500.0);
        assert_eq!(summary.entry_count, 2);
        assert_eq!(summary.by_operator[0], (7, 1000.0));

        assert!(matches!(
            svc.record_revenue(None, None, -5.0, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), None),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_pnl_prefers_actuals() {
        let (svc, event_id) = service_with_event();
        svc.upsert_financials(
            &event_id,
            "budget",
            FinancialsInput {
                lines: lines(),
                revenue: 1500.0,
            },
        )
        .unwrap();
        let mut actual_lines = lines();
        actual_lines.staff = 500.0;
        svc.upsert_financials(
            &event_id,
            "actual",
            FinancialsInput {
                lines: actual_lines,
                revenue: 1400.0,
            },
        )
        .unwrap();

        let report = svc
            .pnl_report(
                NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            )
            .unwrap();
        assert_eq!(report.rows.len(), 1);
        assert!((report.rows[0].revenue - 1400.0).abs() < 0.01);
        assert!((report.total_profit - report.rows[0].profit).abs() < 0.01);
    }
}
