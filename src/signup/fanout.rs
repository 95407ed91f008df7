//! External fan-out legs.
//!
//! Two independent legs per sign-up: identity right after persist, enriched
//! fields after validation. Neither blocks the other, and a permanent
//! failure never touches the sign-up row itself — it lands in
//! `sync_failures` where the retry endpoint can re-queue it by phase.

use crate::models::{SignUp, SyncPhase};
use crate::retry::{ClassifiedError, ErrorCategory};
use crate::signup::store::SignUpStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Destination of the fan-out legs. `CrmClient` is the production target;
/// tests substitute a stub.
#[async_trait]
pub trait FanoutTarget: Send + Sync {
    async fn push_identity(&self, sign_up: &SignUp) -> Result<(), ClassifiedError>;
    async fn push_enriched(&self, sign_up: &SignUp) -> Result<(), ClassifiedError>;
}

#[async_trait]
impl FanoutTarget for crate::integrations::CrmClient {
    async fn push_identity(&self, sign_up: &SignUp) -> Result<(), ClassifiedError> {
        crate::integrations::CrmClient::push_identity(self, sign_up).await
    }

    async fn push_enriched(&self, sign_up: &SignUp) -> Result<(), ClassifiedError> {
        crate::integrations::CrmClient::push_enriched(self, sign_up).await
    }
}

#[derive(Debug, Clone)]
pub struct FanoutJob {
    pub sign_up_id: String,
    pub phase: SyncPhase,
}

/// The stored `error_type` buckets for permanent failures.
fn error_type_for(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::RateLimit => "rate_limit",
        ErrorCategory::ServerError => "server_error",
        ErrorCategory::Network => "network",
        _ => "other",
    }
}

/// Drains fan-out jobs until the channel closes. One job at a time per
/// worker keeps per-entity operations sequential.
pub async fn run_fanout_worker(
    mut rx: mpsc::UnboundedReceiver<FanoutJob>,
    store: Arc<SignUpStore>,
    target: Arc<dyn FanoutTarget>,
) {
    info!("fan-out worker started");
    while let Some(job) = rx.recv().await {
        process_job(&job, &store, target.as_ref()).await;
    }
    info!("fan-out worker stopped");
}

/// Execute one leg. The target client already owns retry/backoff; whatever
/// error reaches us is permanent for this attempt.
pub async fn process_job(job: &FanoutJob, store: &SignUpStore, target: &dyn FanoutTarget) {
    let sign_up = match store.get(&job.sign_up_id) {
        Ok(s) => s,
        Err(e) => {
            warn!(sign_up_id = %job.sign_up_id, "fan-out job for missing sign-up: {e}");
            return;
        }
    };

    let result = match job.phase {
        SyncPhase::Initial => target.push_identity(&sign_up).await,
        SyncPhase::Enriched => target.push_enriched(&sign_up).await,
    };

    match result {
        Ok(()) => {
            metrics::counter!("fanout_leg_success", 1);
            if let Err(e) = store.resolve_sync_failure(&job.sign_up_id, job.phase) {
                warn!(sign_up_id = %job.sign_up_id, "failed clearing sync failure: {e}");
            }
        }
        Err(err) => {
            metrics::counter!("fanout_leg_failure", 1);
            warn!(
                sign_up_id = %job.sign_up_id,
                phase = job.phase.as_str(),
                "fan-out leg failed permanently: {err}"
            );
            if let Err(e) = store.record_sync_failure(
                &job.sign_up_id,
                job.phase,
                error_type_for(err.category),
                &err.message,
            ) {
                warn!(sign_up_id = %job.sign_up_id, "failed recording sync failure: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ExtractedFields, ExtractionStatus, ValidationStatus};
    use chrono::Utc;
    use parking_lot::Mutex;

    struct StubTarget {
        identity_calls: Mutex<u32>,
        enriched_calls: Mutex<u32>,
        fail_with: Mutex<Option<ClassifiedError>>,
    }

    impl StubTarget {
        fn new() -> Self {
            Self {
                identity_calls: Mutex::new(0),
                enriched_calls: Mutex::new(0),
                fail_with: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl FanoutTarget for StubTarget {
        async fn push_identity(&self, _sign_up: &SignUp) -> Result<(), ClassifiedError> {
            *self.identity_calls.lock() += 1;
            match self.fail_with.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn push_enriched(&self, _sign_up: &SignUp) -> Result<(), ClassifiedError> {
            *self.enriched_calls.lock() += 1;
            match self.fail_with.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn seeded_store() -> Arc<SignUpStore> {
        let store = Arc::new(SignUpStore::new(Arc::new(
            Database::open_in_memory().unwrap(),
        )));
        store
            .insert(&SignUp {
                id: "su-1".to_string(),
                event_id: None,
                solo_chat_id: Some("chat-1".to_string()),
                ambassador_id: "amb-1".to_string(),
                operator_id: 7,
                customer_email: "a@b.com".to_string(),
                customer_name: None,
                customer_state: Some("NJ".to_string()),
                submitted_at: Utc::now(),
                validation_status: ValidationStatus::Pending,
                extraction_status: ExtractionStatus::NotRequired,
                extracted: ExtractedFields::default(),
                image_key: None,
                cpa_amount: None,
                pay_period_id: None,
                idempotency_key: "k1".to_string(),
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_successful_leg_leaves_no_failure() {
        let store = seeded_store();
        let target = StubTarget::new();

        process_job(
            &FanoutJob {
                sign_up_id: "su-1".to_string(),
                phase: SyncPhase::Initial,
            },
            &store,
            &target,
        )
        .await;

        assert_eq!(*target.identity_calls.lock(), 1);
        assert!(store.list_sync_failures(false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_leg_records_failure_by_phase() {
        let store = seeded_store();
        let target = StubTarget::new();
        *target.fail_with.lock() = Some(ClassifiedError::from_message("HTTP 503 from partner"));

        process_job(
            &FanoutJob {
                sign_up_id: "su-1".to_string(),
                phase: SyncPhase::Enriched,
            },
            &store,
            &target,
        )
        .await;

        let failures = store.list_sync_failures(false).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].sync_phase, SyncPhase::Enriched);
        assert_eq!(failures[0].error_type, "server_error");
        assert_eq!(failures[0].attempt_count, 1);

        // Retry succeeds: the failure row resolves.
        *target.fail_with.lock() = None;
        process_job(
            &FanoutJob {
                sign_up_id: "su-1".to_string(),
                phase: SyncPhase::Enriched,
            },
            &store,
            &target,
        )
        .await;
        assert!(store.list_sync_failures(false).unwrap().is_empty());
    }

    #[test]
    fn test_error_type_buckets() {
        assert_eq!(error_type_for(ErrorCategory::RateLimit), "rate_limit");
        assert_eq!(error_type_for(ErrorCategory::ServerError), "server_error");
        assert_eq!(error_type_for(ErrorCategory::Network), "network");
        assert_eq!(error_type_for(ErrorCategory::Validation), "other");
        assert_eq!(error_type_for(ErrorCategory::Unknown), "other");
    }
}
