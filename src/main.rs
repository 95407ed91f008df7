//! FieldOps backend entry point.
//!
//! Wires the application root: persistence, event bus, credential vault,
//! partner clients, the sign-up pipeline workers, KPI loops, and the HTTP
//! surface. Background loops run as supervised tasks spawned here and
//! exit with the process.

use anyhow::{Context, Result};
use axum::{middleware as axum_mw, routing::get, Router};
use fieldops_backend::auth::{auth_middleware, JwtHandler};
use fieldops_backend::bus::{ClientRegistry, EventBus};
use fieldops_backend::db::Database;
use fieldops_backend::events::EventService;
use fieldops_backend::financial::FinancialService;
use fieldops_backend::import::BulkImporter;
use fieldops_backend::integrations::{CardOpsClient, CrmClient, LedgerBooksClient};
use fieldops_backend::kpi::{KpiEngine, LogNotificationGateway, MetricSample};
use fieldops_backend::models::Config;
use fieldops_backend::payroll::PayrollService;
use fieldops_backend::signup::{
    run_extraction_worker, ExtractionResult, HttpSlipExtractor, SignUpPipeline, SignUpStore,
    SlipExtractor,
};
use fieldops_backend::state::AppState;
use fieldops_backend::sync::SyncOrchestrator;
use fieldops_backend::vault::{CredentialVault, HttpTokenRefresher, TokenCipher};
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing();

    info!("🚀 FieldOps backend starting");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let db = Arc::new(Database::new(&config.database_path)?);
    info!("📊 Database ready at {}", config.database_path);

    // Event bus + real-time registry.
    let registry = Arc::new(ClientRegistry::new());
    let bus = Arc::new(EventBus::new(
        db.clone(),
        registry.clone(),
        config.replay_buffer_size,
    ));

    // Credential vault: explicit key material, provider token endpoints.
    let cipher = TokenCipher::from_hex(
        &config.vault_key_hex,
        config.vault_key_secondary_hex.as_deref(),
    )
    .context("Invalid vault key material")?;
    let token_urls: HashMap<String, String> = [
        (
            "ledgerbooks".to_string(),
            format!("{}/oauth/token", config.ledgerbooks_base_url),
        ),
        (
            "cardops".to_string(),
            format!("{}/token", config.cardops_base_url),
        ),
        (
            "crm".to_string(),
            format!("{}/oauth/token", config.crm_base_url),
        ),
    ]
    .into();
    let refresher = Arc::new(HttpTokenRefresher::new(http_client.clone(), token_urls));
    let vault = Arc::new(CredentialVault::new(db.clone(), cipher, refresher));

    // Partner adapters.
    let ledgerbooks = Arc::new(LedgerBooksClient::new(
        http_client.clone(),
        &config.ledgerbooks_base_url,
        vault.clone(),
    ));
    let cardops = Arc::new(CardOpsClient::new(
        http_client.clone(),
        &config.cardops_base_url,
        vault.clone(),
    ));
    let crm = Arc::new(CrmClient::new(
        http_client.clone(),
        &config.crm_base_url,
        vault.clone(),
    ));

    // Sign-up pipeline and its workers.
    let store = Arc::new(SignUpStore::new(db.clone()));
    let (extraction_tx, extraction_rx) = mpsc::unbounded_channel();
    let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(SignUpPipeline::new(
        store.clone(),
        bus.clone(),
        extraction_tx,
        fanout_tx,
    ));

    let extractor: Arc<dyn SlipExtractor> = match &config.extractor_base_url {
        Some(base_url) => Arc::new(HttpSlipExtractor::new(http_client.clone(), base_url)),
        None => {
            warn!("⚠️  EXTRACTOR_BASE_URL not set - slip extraction will fail until configured");
            Arc::new(UnconfiguredExtractor)
        }
    };
    tokio::spawn(run_extraction_worker(
        extraction_rx,
        pipeline.clone(),
        extractor,
    ));
    tokio::spawn(fieldops_backend::signup::fanout::run_fanout_worker(
        fanout_rx,
        store.clone(),
        crm.clone(),
    ));

    // Domain services.
    let events = Arc::new(EventService::new(db.clone(), bus.clone()));
    let financial = Arc::new(FinancialService::new(db.clone()));
    let payroll = Arc::new(PayrollService::new(db.clone(), bus.clone()));
    let kpi = Arc::new(KpiEngine::new(
        db.clone(),
        bus.clone(),
        Arc::new(LogNotificationGateway),
    ));
    let importer = Arc::new(BulkImporter::new(db.clone(), bus.clone()));
    let sync = Arc::new(SyncOrchestrator::new(db.clone(), bus.clone()));

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        bus: bus.clone(),
        vault,
        pipeline,
        events,
        financial,
        payroll,
        kpi: kpi.clone(),
        importer,
        sync,
        ledgerbooks,
        cardops,
        crm,
    };

    // Prometheus exporter; rendered at /metrics.
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Background loops, each holding a shutdown receiver so they exit
    // cleanly when the server stops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(session_reaper_polling(
        registry.clone(),
        config.session_reap_secs,
        shutdown_rx.clone(),
    ));
    tokio::spawn(snooze_reactivation_polling(kpi.clone(), shutdown_rx.clone()));
    tokio::spawn(kpi_evaluation_polling(
        kpi.clone(),
        db.clone(),
        config.kpi_eval_interval_secs,
        shutdown_rx,
    ));

    // Router: auth in front of everything under /api/v1.
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let api = fieldops_backend::api::router()
        .route_layer(axum_mw::from_fn_with_state(jwt_handler, auth_middleware))
        .with_state(state);

    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(
            fieldops_backend::middleware::logging::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Placeholder used when no extraction service is configured.
struct UnconfiguredExtractor;

#[async_trait::async_trait]
impl SlipExtractor for UnconfiguredExtractor {
    async fn extract(
        &self,
        _image_key: &str,
    ) -> std::result::Result<ExtractionResult, fieldops_backend::signup::extraction::ExtractionFailure>
    {
        Err(fieldops_backend::signup::extraction::ExtractionFailure {
            reason: "no extraction service configured".to_string(),
        })
    }
}

/// Close client sessions whose last ping exceeds the horizon. Every 30 s.
async fn session_reaper_polling(
    registry: Arc<ClientRegistry>,
    max_age_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("session reaper stopping");
                return;
            }
        }
        let reaped = registry.reap_stale(max_age_secs);
        if reaped > 0 {
            info!("🧹 Reaped {} stale websocket sessions", reaped);
        }
    }
}

/// Flip expired snoozes back to active. Every minute.
async fn snooze_reactivation_polling(kpi: Arc<KpiEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("snooze reactivation loop stopping");
                return;
            }
        }
        if let Err(e) = kpi.reactivate_expired_snoozes() {
            warn!("snooze reactivation failed: {e}");
        }
    }
}

/// Scheduled threshold evaluation against business metrics computed from
/// the primary store.
async fn kpi_evaluation_polling(
    kpi: Arc<KpiEngine>,
    db: Arc<Database>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(30)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("KPI evaluation loop stopping");
                return;
            }
        }
        let metrics = match gather_business_metrics(&db) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("metric gathering failed: {e}");
                continue;
            }
        };
        match kpi.check_thresholds(&metrics).await {
            Ok(alerts) if !alerts.is_empty() => {
                info!("🚨 KPI evaluation created {} alert(s)", alerts.len());
            }
            Ok(_) => {}
            Err(e) => warn!("threshold evaluation failed: {e}"),
        }
    }
}

/// The standing metric set for scheduled evaluation. Sliding one-hour
/// window, previous hour as the comparison point for percent-change rules.
fn gather_business_metrics(
    db: &Database,
) -> std::result::Result<Vec<MetricSample>, fieldops_backend::db::DbError> {
    let signups_last_hour: i64 = db.query_one(
        "SELECT COUNT(*) FROM sign_ups WHERE created_at >= strftime('%s', 'now') - 3600",
        [],
        |row| row.get(0),
    )?;
    let signups_prev_hour: i64 = db.query_one(
        "SELECT COUNT(*) FROM sign_ups
         WHERE created_at >= strftime('%s', 'now') - 7200
           AND created_at < strftime('%s', 'now') - 3600",
        [],
        |row| row.get(0),
    )?;
    let review_queue_depth: i64 = db.query_one(
        "SELECT COUNT(*) FROM sign_ups WHERE extraction_status = 'needs_review'",
        [],
        |row| row.get(0),
    )?;
    let unresolved_sync_failures: i64 = db.query_one(
        "SELECT COUNT(*) FROM sync_failures WHERE resolved = 0",
        [],
        |row| row.get(0),
    )?;
    let active_alerts: i64 = db.query_one(
        "SELECT COUNT(*) FROM kpi_alerts WHERE status = 'active'",
        params![],
        |row| row.get(0),
    )?;

    Ok(vec![
        MetricSample {
            kpi_name: "signups_per_hour".to_string(),
            value: signups_last_hour as f64,
            previous_value: Some(signups_prev_hour as f64),
        },
        MetricSample {
            kpi_name: "extraction_review_queue_depth".to_string(),
            value: review_queue_depth as f64,
            previous_value: None,
        },
        MetricSample {
            kpi_name: "unresolved_sync_failures".to_string(),
            value: unresolved_sync_failures as f64,
            previous_value: None,
        },
        MetricSample {
            kpi_name: "active_alerts".to_string(),
            value: active_alerts as f64,
            previous_value: None,
        },
    ])
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldops_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn health_check() -> &'static str {
    "FieldOps backend operational"
}
