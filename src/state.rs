//! Application state shared across all handlers and background tasks.

use crate::bus::EventBus;
use crate::db::Database;
use crate::events::EventService;
use crate::financial::FinancialService;
use crate::import::BulkImporter;
use crate::integrations::{CardOpsClient, CrmClient, LedgerBooksClient};
use crate::kpi::KpiEngine;
use crate::models::Config;
use crate::payroll::PayrollService;
use crate::signup::SignUpPipeline;
use crate::sync::SyncOrchestrator;
use crate::vault::CredentialVault;
use std::sync::Arc;

/// Everything the HTTP surface and the background loops share. Cheap to
/// clone; every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub vault: Arc<CredentialVault>,
    pub pipeline: Arc<SignUpPipeline>,
    pub events: Arc<EventService>,
    pub financial: Arc<FinancialService>,
    pub payroll: Arc<PayrollService>,
    pub kpi: Arc<KpiEngine>,
    pub importer: Arc<BulkImporter>,
    pub sync: Arc<SyncOrchestrator>,
    pub ledgerbooks: Arc<LedgerBooksClient>,
    pub cardops: Arc<CardOpsClient>,
    pub crm: Arc<CrmClient>,
}
