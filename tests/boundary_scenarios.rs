//! End-to-end scenarios across the intake pipeline, sync orchestrator, and
//! KPI engine, driven through the public library surface against a scratch
//! database.

use chrono::{NaiveDate, Utc};
use fieldops_backend::bus::{ClientRegistry, EventBus};
use fieldops_backend::db::Database;
use fieldops_backend::import::{BulkImporter, ImportOptions};
use fieldops_backend::kpi::{
    Aggregation, Condition, KpiEngine, LogNotificationGateway, MetricSample, Severity,
    ThresholdContent,
};
use fieldops_backend::models::{ExtractionStatus, SyncPhase, ValidationStatus};
use fieldops_backend::retry::ClassifiedError;
use fieldops_backend::signup::{ExtractionResult, SignUpPipeline, SignUpStore, SignUpSubmission};
use fieldops_backend::sync::{
    CheckpointStatus, SyncOrchestrator, SyncOutcome, SyncPage, SyncRecord, SyncSource,
};
use parking_lot::Mutex;
use rusqlite::params;
use std::sync::Arc;
use tokio::sync::mpsc;

struct World {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    pipeline: SignUpPipeline,
    _extraction_rx: mpsc::UnboundedReceiver<fieldops_backend::signup::ExtractionJob>,
    fanout_rx: mpsc::UnboundedReceiver<fieldops_backend::signup::FanoutJob>,
}

fn world() -> World {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new(db.clone(), Arc::new(ClientRegistry::new()), 1000));
    let store = Arc::new(SignUpStore::new(db.clone()));
    let (extraction_tx, extraction_rx) = mpsc::unbounded_channel();
    let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();

    db.exec(
        "INSERT INTO operators (id, name, short_name, auto_validate)
         VALUES (7, 'BetRiver Sportsbook', 'br', 0)",
        [],
    )
    .unwrap();
    db.exec(
        "INSERT INTO cpa_rates (id, operator_id, state_code, cpa_amount, effective_date, end_date, is_active)
         VALUES ('rate-nj', 7, 'NJ', 125.0, '2025-01-01', NULL, 1)",
        [],
    )
    .unwrap();
    db.exec(
        "INSERT INTO ambassadors (id, first_name, last_name, email, hourly_rate, is_active)
         VALUES ('amb-1', 'Ann', 'Lee', 'ann@fieldops.example', 25.0, 1)",
        [],
    )
    .unwrap();

    World {
        pipeline: SignUpPipeline::new(store, bus.clone(), extraction_tx, fanout_tx),
        db,
        bus,
        _extraction_rx: extraction_rx,
        fanout_rx,
    }
}

fn submission(key: &str, email: &str) -> SignUpSubmission {
    SignUpSubmission {
        event_id: Some("ev-1".to_string()),
        solo_chat_id: None,
        ambassador_id: "amb-1".to_string(),
        operator_id: 7,
        customer_email: email.to_string(),
        customer_name: None,
        customer_state: Some("NJ".to_string()),
        idempotency_key: key.to_string(),
        image_key: None,
    }
}

// Scenario 1: a replayed idempotency key returns the same row and publishes
// exactly one submitted event.
#[test]
fn scenario_idempotent_resubmission() {
    let w = world();

    let first = w
        .pipeline
        .submit_event_signup(submission("abc", "A@B.com"))
        .unwrap();
    let second = w
        .pipeline
        .submit_event_signup(submission("abc", "A@B.com"))
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.sign_up.id, second.sign_up.id);

    let rows: i64 = w
        .db
        .query_one("SELECT COUNT(*) FROM sign_ups", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 1);

    let submitted_events: i64 = w
        .db
        .query_one(
            "SELECT COUNT(*) FROM domain_event_log WHERE event_type = 'sign_up.submitted'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(submitted_events, 1);
}

// Scenarios 2 and 3: extraction confidence decides between auto-confirm
// and the review queue.
#[test]
fn scenario_extraction_confidence_gate() {
    let w = world();

    let mut high = submission("k-high", "high@example.com");
    high.image_key = Some("slips/high.jpg".to_string());
    let high = w.pipeline.submit_event_signup(high).unwrap().sign_up;

    w.pipeline
        .apply_extraction(
            &high.id,
            Ok(ExtractionResult {
                bet_amount: Some(50.0),
                team_bet_on: Some("Home".to_string()),
                odds: Some("+110".to_string()),
                confidence: 0.95,
            }),
        )
        .unwrap();

    let confirmed = w.pipeline.store().get(&high.id).unwrap();
    assert_eq!(confirmed.extraction_status, ExtractionStatus::Confirmed);
    assert_eq!(confirmed.extracted.bet_amount, Some(50.0));
    assert_eq!(confirmed.extracted.team_bet_on.as_deref(), Some("Home"));
    assert_eq!(confirmed.extracted.odds.as_deref(), Some("+110"));

    let mut low = submission("k-low", "low@example.com");
    low.image_key = Some("slips/low.jpg".to_string());
    let low = w.pipeline.submit_event_signup(low).unwrap().sign_up;

    w.pipeline
        .apply_extraction(
            &low.id,
            Ok(ExtractionResult {
                bet_amount: Some(50.0),
                team_bet_on: Some("Home".to_string()),
                odds: Some("+110".to_string()),
                confidence: 0.6,
            }),
        )
        .unwrap();

    let needs_review = w.pipeline.store().get(&low.id).unwrap();
    assert_eq!(needs_review.extraction_status, ExtractionStatus::NeedsReview);

    let queue = w.pipeline.store().review_queue(10).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, low.id);
}

// Scenario 4: validating a mid-2025 NJ sign-up for operator 7 assigns the
// 125.00 rate.
#[test]
fn scenario_rate_lookup_on_validation() {
    let w = world();

    let outcome = w
        .pipeline
        .submit_event_signup(submission("k-rate", "rate@example.com"))
        .unwrap();
    let validated = w
        .pipeline
        .validate(&outcome.sign_up.id, true, "manager-1")
        .unwrap();

    assert_eq!(validated.validation_status, ValidationStatus::Validated);
    assert_eq!(validated.cpa_amount, Some(125.0));
}

// Scenario 6: a sync of 500 records that dies after 220 resumes from the
// 220th id and finishes with processed_records = 500.
struct FlakySource {
    total: u64,
    page_size: usize,
    die_after: Mutex<Option<u64>>,
}

#[async_trait::async_trait]
impl SyncSource for FlakySource {
    fn integration(&self) -> &str {
        "ledgerbooks"
    }
    fn sync_type(&self) -> &str {
        "invoices"
    }
    fn record_type(&self) -> &str {
        "invoice"
    }

    async fn total_count(&self) -> Result<Option<u64>, ClassifiedError> {
        Ok(Some(self.total))
    }

    async fn fetch_page(&self, after: Option<&str>) -> Result<SyncPage, ClassifiedError> {
        let start: u64 = match after {
            Some(id) => id.trim_start_matches("rec-").parse::<u64>().unwrap() + 1,
            None => 1,
        };
        if let Some(die_after) = *self.die_after.lock() {
            if start > die_after {
                return Err(ClassifiedError::from_message("403 forbidden"));
            }
        }
        let records: Vec<SyncRecord> = (start..=self.total)
            .take(self.page_size)
            .map(|n| SyncRecord {
                external_id: format!("rec-{n}"),
                payload: serde_json::json!({ "n": n }),
            })
            .collect();
        Ok(SyncPage { records })
    }
}

#[tokio::test]
async fn scenario_sync_crash_and_resume() {
    let w = world();
    let orchestrator = SyncOrchestrator::new(w.db.clone(), w.bus.clone());

    // First run: dies once 220 records are in.
    let source = FlakySource {
        total: 500,
        page_size: 20,
        die_after: Mutex::new(Some(220)),
    };
    let outcome = orchestrator.run(&source).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Failed { .. }));

    let checkpoint = orchestrator
        .list_checkpoints(Some("ledgerbooks"), 1)
        .unwrap()
        .remove(0);
    assert_eq!(checkpoint.status, CheckpointStatus::Failed);
    assert_eq!(checkpoint.processed_records, 220);
    assert_eq!(checkpoint.last_processed_id.as_deref(), Some("rec-220"));

    // Restart: same pair resumes the checkpoint and completes.
    *source.die_after.lock() = None;
    let outcome = orchestrator.run(&source).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            processed: 500,
            failed: 0
        }
    );

    let synced: i64 = w
        .db
        .query_one("SELECT COUNT(*) FROM synced_records", [], |r| r.get(0))
        .unwrap();
    assert_eq!(synced, 500);

    // processed + failed never exceeded the total.
    let checkpoint = orchestrator
        .list_checkpoints(Some("ledgerbooks"), 1)
        .unwrap()
        .remove(0);
    assert!(checkpoint.processed_records + checkpoint.failed_records <= 500);
}

// Scenario 7: cooldown swallows the second breach; the third, past the
// window, alerts again.
#[tokio::test]
async fn scenario_threshold_cooldown() {
    let w = world();
    let engine = KpiEngine::new(w.db.clone(), w.bus.clone(), Arc::new(LogNotificationGateway));

    engine
        .create_threshold(ThresholdContent {
            kpi_name: "signups_per_hour".to_string(),
            category: "signups".to_string(),
            condition: Condition::Gt,
            threshold_value: 100.0,
            warning_threshold: None,
            critical_threshold: None,
            aggregation: Aggregation::Avg,
            aggregation_period_minutes: 60,
            severity: Severity::Warning,
            enabled: true,
            cooldown_minutes: 60,
            channels: vec!["email".to_string()],
            recipients: vec!["ops@fieldops.example".to_string()],
        })
        .unwrap();

    let sample = |value: f64| {
        vec![MetricSample {
            kpi_name: "signups_per_hour".to_string(),
            value,
            previous_value: None,
        }]
    };

    // t₀: breach alerts.
    let alerts = engine.check_thresholds(&sample(120.0)).await.unwrap();
    assert_eq!(alerts.len(), 1);

    // t₀ + 30min: still inside the cooldown.
    w.db.exec(
        "UPDATE kpi_thresholds SET last_alert_at = ?1",
        params![Utc::now().timestamp() - 30 * 60],
    )
    .unwrap();
    let alerts = engine.check_thresholds(&sample(130.0)).await.unwrap();
    assert!(alerts.is_empty());

    // t₀ + 61min: cooldown elapsed.
    w.db.exec(
        "UPDATE kpi_thresholds SET last_alert_at = ?1",
        params![Utc::now().timestamp() - 61 * 60],
    )
    .unwrap();
    let alerts = engine.check_thresholds(&sample(130.0)).await.unwrap();
    assert_eq!(alerts.len(), 1);
}

// Round-trip law: importing a budget CSV then reading the report back
// reproduces every non-null numeric field to within a cent.
#[test]
fn scenario_budget_import_report_round_trip() {
    let w = world();
    let importer = BulkImporter::new(w.db.clone(), w.bus.clone());
    let financial = fieldops_backend::financial::FinancialService::new(w.db.clone());

    let csv = "\
type,date,event,event type,staff,reimbursements,rewards,base,bonus,parking,setup,additional 1,additional 2,additional 3,additional 4,total,revenue,profit,margin
Budget,03/02/25,Joe's Bar,bar night,$400.00,$55.25,$120.00,$250.00,$75.50,$20.00,$30.00,,,,,$950.75,\"$1,500.00\",$549.25,36.62%
Actual,03/02/25,Joe's Bar,bar night,$420.00,$60.00,$110.00,$250.00,$80.00,$20.00,$30.00,,,,,$970.00,\"$1,430.00\",$460.00,32.17%
";
    let summary = importer
        .import_budget(csv, &ImportOptions::default())
        .unwrap();
    assert_eq!(summary.processed_rows, 2);

    let report = financial
        .budget_actuals_report(
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
        )
        .unwrap();
    assert_eq!(report.len(), 1);

    let budget = report[0].budget.as_ref().unwrap();
    assert!((budget.lines.staff - 400.00).abs() < 0.01);
    assert!((budget.lines.reimbursements - 55.25).abs() < 0.01);
    assert!((budget.total - 950.75).abs() < 0.01);
    assert!((budget.revenue - 1500.00).abs() < 0.01);
    assert!((budget.profit - 549.25).abs() < 0.01);

    let actual = report[0].actual.as_ref().unwrap();
    assert!((actual.total - 970.00).abs() < 0.01);
    assert!((actual.revenue - 1430.00).abs() < 0.01);
    assert!((actual.profit - 460.00).abs() < 0.01);

    // Cost variance = actual − budget.
    assert!((report[0].cost_variance.unwrap() - 19.25).abs() < 0.01);
}

// Fan-out legs: enriched leg queues only after validation, and a permanent
// failure is visible and retryable by phase.
#[tokio::test]
async fn scenario_fanout_failure_and_retry() {
    let mut w = world();

    let outcome = w
        .pipeline
        .submit_event_signup(submission("k-fan", "fan@example.com"))
        .unwrap();
    let job = w.fanout_rx.try_recv().unwrap();
    assert_eq!(job.phase, SyncPhase::Initial);
    assert!(w.fanout_rx.try_recv().is_err(), "no enriched leg yet");

    w.pipeline
        .validate(&outcome.sign_up.id, true, "manager-1")
        .unwrap();
    let job = w.fanout_rx.try_recv().unwrap();
    assert_eq!(job.phase, SyncPhase::Enriched);

    // Permanent failure lands in sync_failures; the sign-up stays intact.
    w.pipeline
        .store()
        .record_sync_failure(&outcome.sign_up.id, SyncPhase::Enriched, "server_error", "503")
        .unwrap();
    let sign_up = w.pipeline.store().get(&outcome.sign_up.id).unwrap();
    assert_eq!(sign_up.validation_status, ValidationStatus::Validated);

    let queued = w
        .pipeline
        .retry_sync(&outcome.sign_up.id, Some(SyncPhase::Enriched))
        .unwrap();
    assert_eq!(queued, 1);
    assert_eq!(w.fanout_rx.try_recv().unwrap().phase, SyncPhase::Enriched);
}

// Database file persistence: the schema survives reopen (scratch dir via
// tempfile, the same tooling the rest of the test suite uses).
#[test]
fn scenario_database_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldops-test.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::new(path).unwrap();
        db.exec(
            "INSERT INTO operators (id, name, auto_validate) VALUES (1, 'OpOne', 0)",
            [],
        )
        .unwrap();
    }

    let db = Database::new(path).unwrap();
    let count: i64 = db
        .query_one("SELECT COUNT(*) FROM operators", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}
