//! Relational schema. Tables mirror the domain entities in snake_case;
//! all timestamps are UTC (RFC 3339 text or unix seconds), monetary fields
//! are REAL dollars rounded to cents at write time.

/// Schema with pragmas tuned for a write-heavy single-process service.
pub const SCHEMA_SQL: &str = r#"
-- WAL for concurrent reads during writes
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sign_ups (
    id TEXT PRIMARY KEY,
    event_id TEXT,
    solo_chat_id TEXT,
    ambassador_id TEXT NOT NULL,
    operator_id INTEGER NOT NULL,
    customer_email TEXT NOT NULL,
    customer_name TEXT,
    customer_state TEXT,
    submitted_at TEXT NOT NULL,
    validation_status TEXT NOT NULL DEFAULT 'pending',
    extraction_status TEXT NOT NULL DEFAULT 'not_required',
    bet_amount REAL,
    team_bet_on TEXT,
    odds TEXT,
    extraction_confidence REAL,
    image_key TEXT,
    cpa_amount REAL,
    pay_period_id TEXT,
    idempotency_key TEXT NOT NULL,
    import_batch_id TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    CHECK ((event_id IS NULL) <> (solo_chat_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sign_ups_idempotency
    ON sign_ups(operator_id, idempotency_key);

CREATE INDEX IF NOT EXISTS idx_sign_ups_email_operator
    ON sign_ups(customer_email, operator_id);

CREATE INDEX IF NOT EXISTS idx_sign_ups_submitted
    ON sign_ups(submitted_at DESC);

CREATE INDEX IF NOT EXISTS idx_sign_ups_extraction
    ON sign_ups(extraction_status) WHERE extraction_status = 'needs_review';

CREATE TABLE IF NOT EXISTS sign_up_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sign_up_id TEXT NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    detail TEXT,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sign_up_audit_sign_up
    ON sign_up_audit(sign_up_id, at);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    venue TEXT NOT NULL,
    event_date TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    timezone TEXT NOT NULL DEFAULT 'America/New_York',
    city TEXT,
    state TEXT,
    event_type TEXT,
    notes TEXT,
    status TEXT NOT NULL DEFAULT 'planned',
    import_batch_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_date ON events(event_date);

CREATE TABLE IF NOT EXISTS event_status_history (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id),
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    actor TEXT NOT NULL,
    reason TEXT,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_event_history_event
    ON event_status_history(event_id, at);

CREATE TABLE IF NOT EXISTS ambassadors (
    id TEXT PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    hourly_rate REAL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_ambassadors_email ON ambassadors(email);

CREATE TABLE IF NOT EXISTS operators (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    short_name TEXT,
    auto_validate INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS assignments (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events(id),
    ambassador_id TEXT NOT NULL REFERENCES ambassadors(id),
    status TEXT NOT NULL DEFAULT 'pending',
    hours_worked REAL,
    created_at TEXT NOT NULL,
    UNIQUE (event_id, ambassador_id)
);

CREATE TABLE IF NOT EXISTS cpa_rates (
    id TEXT PRIMARY KEY,
    operator_id INTEGER NOT NULL,
    state_code TEXT NOT NULL,
    cpa_amount REAL NOT NULL,
    effective_date TEXT NOT NULL,
    end_date TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_cpa_rates_lookup
    ON cpa_rates(operator_id, state_code, effective_date DESC);

CREATE TABLE IF NOT EXISTS cpa_attributions (
    id TEXT PRIMARY KEY,
    sign_up_id TEXT NOT NULL,
    cpa_rate_id TEXT NOT NULL,
    amount REAL NOT NULL,
    attributed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_financials (
    event_id TEXT NOT NULL REFERENCES events(id),
    kind TEXT NOT NULL CHECK (kind IN ('budget', 'actual')),
    staff REAL NOT NULL DEFAULT 0,
    reimbursements REAL NOT NULL DEFAULT 0,
    rewards REAL NOT NULL DEFAULT 0,
    base REAL NOT NULL DEFAULT 0,
    bonus_kickback REAL NOT NULL DEFAULT 0,
    parking REAL NOT NULL DEFAULT 0,
    setup REAL NOT NULL DEFAULT 0,
    additional_1 REAL NOT NULL DEFAULT 0,
    additional_2 REAL NOT NULL DEFAULT 0,
    additional_3 REAL NOT NULL DEFAULT 0,
    additional_4 REAL NOT NULL DEFAULT 0,
    total REAL NOT NULL DEFAULT 0,
    revenue REAL NOT NULL DEFAULT 0,
    profit REAL NOT NULL DEFAULT 0,
    margin_percent REAL,
    import_batch_id TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (event_id, kind)
);

CREATE TABLE IF NOT EXISTS expenses (
    id TEXT PRIMARY KEY,
    event_id TEXT,
    description TEXT NOT NULL,
    amount REAL NOT NULL,
    incurred_on TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'manual',
    external_id TEXT,
    reconciled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_expenses_external
    ON expenses(source, external_id) WHERE external_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS revenue_entries (
    id TEXT PRIMARY KEY,
    event_id TEXT,
    operator_id INTEGER,
    amount REAL NOT NULL,
    earned_on TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS integration_credentials (
    provider TEXT PRIMARY KEY,
    access_token_enc TEXT NOT NULL,
    refresh_token_enc TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    scope TEXT,
    requires_reauth INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_checkpoints (
    id TEXT PRIMARY KEY,
    integration TEXT NOT NULL,
    sync_type TEXT NOT NULL,
    total_records INTEGER,
    processed_records INTEGER NOT NULL DEFAULT 0,
    failed_records INTEGER NOT NULL DEFAULT 0,
    last_processed_id TEXT,
    status TEXT NOT NULL DEFAULT 'in_progress',
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_checkpoints_lookup
    ON sync_checkpoints(integration, sync_type, created_at DESC);

CREATE TABLE IF NOT EXISTS synced_records (
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    record_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    synced_at INTEGER NOT NULL,
    PRIMARY KEY (provider, external_id)
);

CREATE TABLE IF NOT EXISTS sync_failures (
    id TEXT PRIMARY KEY,
    sign_up_id TEXT NOT NULL,
    sync_phase TEXT NOT NULL,
    error_type TEXT NOT NULL,
    error_message TEXT NOT NULL,
    last_attempt_at TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 1,
    resolved INTEGER NOT NULL DEFAULT 0,
    UNIQUE (sign_up_id, sync_phase)
);

CREATE TABLE IF NOT EXISTS kpi_thresholds (
    id TEXT PRIMARY KEY,
    kpi_name TEXT NOT NULL,
    category TEXT NOT NULL,
    condition TEXT NOT NULL,
    threshold_value REAL NOT NULL,
    warning_threshold REAL,
    critical_threshold REAL,
    aggregation TEXT NOT NULL DEFAULT 'avg',
    aggregation_period_minutes INTEGER NOT NULL DEFAULT 60,
    severity TEXT NOT NULL DEFAULT 'warning',
    enabled INTEGER NOT NULL DEFAULT 1,
    cooldown_minutes INTEGER NOT NULL DEFAULT 60,
    channels TEXT NOT NULL DEFAULT '[]',
    recipients TEXT NOT NULL DEFAULT '[]',
    current_version INTEGER NOT NULL DEFAULT 1,
    last_alert_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS kpi_threshold_versions (
    id TEXT PRIMARY KEY,
    threshold_id TEXT NOT NULL REFERENCES kpi_thresholds(id),
    version INTEGER NOT NULL,
    content_json TEXT NOT NULL,
    is_current INTEGER NOT NULL DEFAULT 0,
    effective_from INTEGER NOT NULL,
    effective_to INTEGER,
    change_reason TEXT,
    UNIQUE (threshold_id, version)
);

CREATE INDEX IF NOT EXISTS idx_threshold_versions_current
    ON kpi_threshold_versions(threshold_id) WHERE is_current = 1;

CREATE TABLE IF NOT EXISTS kpi_alerts (
    id TEXT PRIMARY KEY,
    threshold_id TEXT NOT NULL,
    kpi_name TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    current_value REAL NOT NULL,
    threshold_value REAL NOT NULL,
    deviation_percent REAL NOT NULL,
    message TEXT NOT NULL,
    context_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    acknowledged_by TEXT,
    acknowledged_at INTEGER,
    resolved_by TEXT,
    resolved_at INTEGER,
    snoozed_until INTEGER,
    notification_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_kpi_alerts_status ON kpi_alerts(status, created_at DESC);

CREATE TABLE IF NOT EXISTS alert_notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id TEXT NOT NULL REFERENCES kpi_alerts(id),
    channel TEXT NOT NULL,
    recipient TEXT NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT,
    sent_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS import_logs (
    id TEXT PRIMARY KEY,
    import_type TEXT NOT NULL,
    file_name TEXT,
    file_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'processing',
    total_rows INTEGER NOT NULL DEFAULT 0,
    processed_rows INTEGER NOT NULL DEFAULT 0,
    skipped_duplicates INTEGER NOT NULL DEFAULT 0,
    error_rows INTEGER NOT NULL DEFAULT 0,
    errors_json TEXT NOT NULL DEFAULT '[]',
    warnings_json TEXT NOT NULL DEFAULT '[]',
    started_by TEXT,
    created_at INTEGER NOT NULL,
    finished_at INTEGER
);

CREATE TABLE IF NOT EXISTS import_row_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    import_id TEXT NOT NULL REFERENCES import_logs(id),
    row_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    action TEXT,
    message TEXT,
    raw_data TEXT
);

CREATE INDEX IF NOT EXISTS idx_import_rows_import
    ON import_row_details(import_id, row_number);

CREATE TABLE IF NOT EXISTS import_audit_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    import_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT,
    at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_event_log (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    user_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_domain_event_log_time
    ON domain_event_log(created_at, event_type);

CREATE TABLE IF NOT EXISTS pay_periods (
    id TEXT PRIMARY KEY,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    processed_at TEXT,
    UNIQUE (period_start, period_end)
);

CREATE TABLE IF NOT EXISTS payroll_entries (
    id TEXT PRIMARY KEY,
    pay_period_id TEXT NOT NULL REFERENCES pay_periods(id),
    ambassador_id TEXT NOT NULL,
    hours_total REAL NOT NULL DEFAULT 0,
    hourly_pay REAL NOT NULL DEFAULT 0,
    commission_pay REAL NOT NULL DEFAULT 0,
    signup_count INTEGER NOT NULL DEFAULT 0,
    total_pay REAL NOT NULL DEFAULT 0,
    computed_at TEXT NOT NULL,
    UNIQUE (pay_period_id, ambassador_id)
);
"#;
