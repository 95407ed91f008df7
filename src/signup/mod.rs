//! Sign-up intake and enrichment pipeline.
//!
//! Stages run as explicit state transitions on the row: persist → duplicate
//! check → (extraction, initial fan-out) → validation → enriched fan-out.
//! Everything downstream of persist is asynchronous; per-sign-up work stays
//! sequential through the job channels.

pub mod extraction;
pub mod fanout;
pub mod store;

pub use extraction::{
    ExtractionJob, ExtractionResult, HttpSlipExtractor, SlipExtractor, CONFIDENCE_AUTO_CONFIRM,
};
pub use fanout::{FanoutJob, FanoutTarget};
pub use store::SignUpStore;

use crate::bus::{types, EventBus};
use crate::db::DbError;
use crate::error::AppError;
use crate::models::{ExtractedFields, ExtractionStatus, SignUp, SyncPhase, ValidationStatus};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// An intake submission, event-sourced or solo.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpSubmission {
    pub event_id: Option<String>,
    pub solo_chat_id: Option<String>,
    pub ambassador_id: String,
    pub operator_id: i64,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customer_state: Option<String>,
    pub idempotency_key: String,
    pub image_key: Option<String>,
}

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub sign_up: SignUp,
    /// False when idempotency short-circuited to an existing row.
    pub created: bool,
}

/// Reviewer corrections applied alongside a manual confirmation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionCorrections {
    pub bet_amount: Option<f64>,
    pub team_bet_on: Option<String>,
    pub odds: Option<String>,
}

pub struct SignUpPipeline {
    store: Arc<SignUpStore>,
    bus: Arc<EventBus>,
    extraction_tx: mpsc::UnboundedSender<ExtractionJob>,
    fanout_tx: mpsc::UnboundedSender<FanoutJob>,
}

impl SignUpPipeline {
    pub fn new(
        store: Arc<SignUpStore>,
        bus: Arc<EventBus>,
        extraction_tx: mpsc::UnboundedSender<ExtractionJob>,
        fanout_tx: mpsc::UnboundedSender<FanoutJob>,
    ) -> Self {
        Self {
            store,
            bus,
            extraction_tx,
            fanout_tx,
        }
    }

    pub fn store(&self) -> &SignUpStore {
        &self.store
    }

    // -- entry points -------------------------------------------------------

    pub fn submit_event_signup(
        &self,
        mut submission: SignUpSubmission,
    ) -> Result<SubmissionOutcome, AppError> {
        if submission.event_id.is_none() {
            return Err(AppError::Validation("eventId is required".to_string()));
        }
        submission.solo_chat_id = None;
        self.submit(submission, false)
    }

    pub fn submit_solo_signup(
        &self,
        mut submission: SignUpSubmission,
    ) -> Result<SubmissionOutcome, AppError> {
        if submission.solo_chat_id.is_none() {
            return Err(AppError::Validation("soloChatId is required".to_string()));
        }
        submission.event_id = None;
        self.submit(submission, false)
    }

    /// Trusted internal creation: same idempotency contract, validates
    /// immediately instead of waiting for review.
    pub fn create_direct(
        &self,
        submission: SignUpSubmission,
    ) -> Result<SubmissionOutcome, AppError> {
        self.submit(submission, true)
    }

    fn submit(
        &self,
        submission: SignUpSubmission,
        trusted: bool,
    ) -> Result<SubmissionOutcome, AppError> {
        let submission = normalize(submission)?;

        // Idempotency: a key replay returns the existing row untouched and
        // publishes nothing.
        if let Some(existing) = self
            .store
            .find_by_idempotency(submission.operator_id, &submission.idempotency_key)?
        {
            return Ok(SubmissionOutcome {
                sign_up: existing,
                created: false,
            });
        }

        let sign_up = SignUp {
            id: Uuid::new_v4().to_string(),
            event_id: submission.event_id.clone(),
            solo_chat_id: submission.solo_chat_id.clone(),
            ambassador_id: submission.ambassador_id.clone(),
            operator_id: submission.operator_id,
            customer_email: submission.customer_email.clone(),
            customer_name: submission.customer_name.clone(),
            customer_state: submission.customer_state.clone(),
            submitted_at: Utc::now(),
            validation_status: ValidationStatus::Pending,
            extraction_status: if submission.image_key.is_some() {
                ExtractionStatus::Pending
            } else {
                ExtractionStatus::NotRequired
            },
            extracted: ExtractedFields::default(),
            image_key: submission.image_key.clone(),
            cpa_amount: None,
            pay_period_id: None,
            idempotency_key: submission.idempotency_key.clone(),
        };

        match self.store.insert(&sign_up) {
            Ok(()) => {}
            Err(DbError::Conflict(_)) => {
                // Lost an idempotency race; surface the winner.
                if let Some(existing) = self
                    .store
                    .find_by_idempotency(submission.operator_id, &submission.idempotency_key)?
                {
                    return Ok(SubmissionOutcome {
                        sign_up: existing,
                        created: false,
                    });
                }
                return Err(AppError::Conflict(
                    "sign-up violates a uniqueness constraint".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        self.store
            .append_audit(&sign_up.id, "created", &sign_up.ambassador_id, None)?;
        self.bus.publish(
            types::SIGN_UP_SUBMITTED,
            json!({
                "signUpId": sign_up.id,
                "ambassadorId": sign_up.ambassador_id,
                "eventId": sign_up.event_id,
                "operatorId": sign_up.operator_id,
            }),
            None,
        );
        metrics::counter!("signups_submitted", 1);

        // Duplicate check: an earlier live sign-up for the same customer and
        // operator terminates this one immediately.
        if let Some(original) = self.store.find_live_duplicate(
            &sign_up.customer_email,
            sign_up.operator_id,
            &sign_up.id,
        )? {
            self.store
                .set_validation_status(&sign_up.id, ValidationStatus::Duplicate, None)?;
            self.store.append_audit(
                &sign_up.id,
                "marked_duplicate",
                "system",
                Some(&format!("duplicate of {}", original.id)),
            )?;
            self.bus.publish(
                types::SIGN_UP_DUPLICATE,
                json!({
                    "signUpId": sign_up.id,
                    "ambassadorId": sign_up.ambassador_id,
                    "originalSignUpId": original.id,
                }),
                None,
            );
            let mut duplicate = sign_up;
            duplicate.validation_status = ValidationStatus::Duplicate;
            return Ok(SubmissionOutcome {
                sign_up: duplicate,
                created: true,
            });
        }

        // Extraction and the initial sync leg are independent; neither
        // blocks the other.
        if let Some(image_key) = &sign_up.image_key {
            let _ = self.extraction_tx.send(ExtractionJob {
                sign_up_id: sign_up.id.clone(),
                image_key: image_key.clone(),
            });
        }
        let _ = self.fanout_tx.send(FanoutJob {
            sign_up_id: sign_up.id.clone(),
            phase: SyncPhase::Initial,
        });

        let auto_validate = trusted || self.store.operator_auto_validates(sign_up.operator_id)?;
        if auto_validate {
            let actor = if trusted { "system:direct" } else { "system:auto" };
            let validated = self.validate(&sign_up.id, true, actor)?;
            return Ok(SubmissionOutcome {
                sign_up: validated,
                created: true,
            });
        }

        Ok(SubmissionOutcome {
            sign_up,
            created: true,
        })
    }

    /// Duplicate probe used by the intake form before submitting.
    pub fn check_duplicate(&self, email: &str, operator_id: i64) -> Result<bool, AppError> {
        let email = email.trim().to_lowercase();
        Ok(self
            .store
            .find_live_duplicate(&email, operator_id, "")?
            .is_some())
    }

    // -- validation ---------------------------------------------------------

    /// Human (or trusted-path) validation decision.
    pub fn validate(&self, id: &str, approve: bool, actor: &str) -> Result<SignUp, AppError> {
        let sign_up = self.store.get(id).map_err(|e| match e {
            DbError::NotFound => AppError::NotFound(format!("sign-up {id}")),
            other => other.into(),
        })?;

        if sign_up.validation_status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "sign-up is already {}",
                sign_up.validation_status.as_str()
            )));
        }

        if !approve {
            self.store
                .set_validation_status(id, ValidationStatus::Rejected, None)?;
            self.store.append_audit(id, "rejected", actor, None)?;
            self.bus.publish(
                types::SIGN_UP_REJECTED,
                json!({ "signUpId": id, "ambassadorId": sign_up.ambassador_id }),
                None,
            );
            return self.store.get(id).map_err(Into::into);
        }

        // Rate lookup keyed by operator, state, and the submission date.
        let cpa_amount = match &sign_up.customer_state {
            Some(state) => self
                .store
                .lookup_rate(
                    sign_up.operator_id,
                    state,
                    sign_up.submitted_at.date_naive(),
                )?
                .map(|rate| rate.cpa_amount),
            None => None,
        };

        if cpa_amount.is_none() {
            warn!(
                sign_up_id = id,
                operator_id = sign_up.operator_id,
                state = sign_up.customer_state.as_deref().unwrap_or("-"),
                "no CPA rate matched validated sign-up"
            );
            self.bus.publish(
                types::SIGN_UP_RATE_MISSING,
                json!({
                    "signUpId": id,
                    "ambassadorId": sign_up.ambassador_id,
                    "operatorId": sign_up.operator_id,
                    "state": sign_up.customer_state,
                }),
                None,
            );
        }

        self.store
            .set_validation_status(id, ValidationStatus::Validated, cpa_amount)?;
        self.store.append_audit(
            id,
            "validated",
            actor,
            cpa_amount.map(|c| format!("cpa={c:.2}")).as_deref(),
        )?;
        self.bus.publish(
            types::SIGN_UP_VALIDATED,
            json!({
                "signUpId": id,
                "ambassadorId": sign_up.ambassador_id,
                "cpaAmount": cpa_amount,
            }),
            None,
        );
        metrics::counter!("signups_validated", 1);

        // Enriched leg fires only after validation.
        let _ = self.fanout_tx.send(FanoutJob {
            sign_up_id: id.to_string(),
            phase: SyncPhase::Enriched,
        });

        self.store.get(id).map_err(Into::into)
    }

    // -- extraction ---------------------------------------------------------

    /// Apply an extractor outcome to a pending sign-up.
    pub fn apply_extraction(
        &self,
        sign_up_id: &str,
        outcome: Result<ExtractionResult, extraction::ExtractionFailure>,
    ) -> Result<(), AppError> {
        let sign_up = self.store.get(sign_up_id).map_err(|e| match e {
            DbError::NotFound => AppError::NotFound(format!("sign-up {sign_up_id}")),
            other => other.into(),
        })?;

        if sign_up.extraction_status != ExtractionStatus::Pending {
            info!(
                sign_up_id,
                status = sign_up.extraction_status.as_str(),
                "ignoring extraction result for non-pending sign-up"
            );
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                let fields = ExtractedFields {
                    bet_amount: result.bet_amount,
                    team_bet_on: result.team_bet_on.clone(),
                    odds: result.odds.clone(),
                    extraction_confidence: Some(result.confidence),
                };
                if result.auto_confirms() {
                    self.store
                        .set_extraction(sign_up_id, ExtractionStatus::Confirmed, &fields)?;
                    self.store.append_audit(
                        sign_up_id,
                        "extraction_confirmed",
                        "system:extractor",
                        Some(&format!("confidence={:.2}", result.confidence)),
                    )?;
                    self.bus.publish(
                        types::SIGN_UP_EXTRACTION_CONFIRMED,
                        json!({
                            "signUpId": sign_up_id,
                            "ambassadorId": sign_up.ambassador_id,
                            "confidence": result.confidence,
                        }),
                        None,
                    );
                } else {
                    self.store
                        .set_extraction(sign_up_id, ExtractionStatus::NeedsReview, &fields)?;
                    self.store.append_audit(
                        sign_up_id,
                        "extraction_needs_review",
                        "system:extractor",
                        Some(&format!("confidence={:.2}", result.confidence)),
                    )?;
                }
            }
            Err(failure) => {
                self.store
                    .set_extraction_status(sign_up_id, ExtractionStatus::Failed)?;
                self.store.append_audit(
                    sign_up_id,
                    "extraction_failed",
                    "system:extractor",
                    Some(&failure.reason),
                )?;
            }
        }
        Ok(())
    }

    /// Reviewer confirms, optionally with corrections.
    pub fn confirm_extraction(
        &self,
        id: &str,
        corrections: Option<ExtractionCorrections>,
        actor: &str,
    ) -> Result<SignUp, AppError> {
        let sign_up = self.store.get(id).map_err(|e| match e {
            DbError::NotFound => AppError::NotFound(format!("sign-up {id}")),
            other => other.into(),
        })?;

        match sign_up.extraction_status {
            ExtractionStatus::NeedsReview
            | ExtractionStatus::Pending
            | ExtractionStatus::Failed => {}
            other => {
                return Err(AppError::Conflict(format!(
                    "extraction is {} and cannot be confirmed",
                    other.as_str()
                )))
            }
        }

        let corrections = corrections.unwrap_or_default();
        let fields = ExtractedFields {
            bet_amount: corrections.bet_amount.or(sign_up.extracted.bet_amount),
            team_bet_on: corrections
                .team_bet_on
                .or(sign_up.extracted.team_bet_on.clone()),
            odds: corrections.odds.or(sign_up.extracted.odds.clone()),
            extraction_confidence: sign_up.extracted.extraction_confidence,
        };

        self.store
            .set_extraction(id, ExtractionStatus::Confirmed, &fields)?;
        self.store
            .append_audit(id, "extraction_confirmed", actor, None)?;
        self.bus.publish(
            types::SIGN_UP_EXTRACTION_CONFIRMED,
            json!({ "signUpId": id, "ambassadorId": sign_up.ambassador_id }),
            None,
        );

        self.store.get(id).map_err(Into::into)
    }

    /// Reviewer skips extraction entirely.
    pub fn skip_extraction(
        &self,
        id: &str,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<SignUp, AppError> {
        let sign_up = self.store.get(id).map_err(|e| match e {
            DbError::NotFound => AppError::NotFound(format!("sign-up {id}")),
            other => other.into(),
        })?;

        if matches!(
            sign_up.extraction_status,
            ExtractionStatus::Confirmed | ExtractionStatus::Skipped
        ) {
            return Err(AppError::Conflict(format!(
                "extraction is already {}",
                sign_up.extraction_status.as_str()
            )));
        }

        self.store
            .set_extraction_status(id, ExtractionStatus::Skipped)?;
        self.store
            .append_audit(id, "extraction_skipped", actor, reason)?;
        self.bus.publish(
            types::SIGN_UP_EXTRACTION_SKIPPED,
            json!({ "signUpId": id, "ambassadorId": sign_up.ambassador_id }),
            None,
        );

        self.store.get(id).map_err(Into::into)
    }

    // -- fan-out retry ------------------------------------------------------

    /// Re-queue failed legs for one sign-up, optionally narrowed to a phase.
    pub fn retry_sync(&self, sign_up_id: &str, phase: Option<SyncPhase>) -> Result<u32, AppError> {
        // Confirm the sign-up exists before queueing anything.
        self.store.get(sign_up_id).map_err(|e| match e {
            DbError::NotFound => AppError::NotFound(format!("sign-up {sign_up_id}")),
            other => other.into(),
        })?;

        let failures = self.store.list_sync_failures(false)?;
        let mut queued = 0u32;
        for failure in failures
            .iter()
            .filter(|f| f.sign_up_id == sign_up_id)
            .filter(|f| phase.map_or(true, |p| f.sync_phase == p))
        {
            let _ = self.fanout_tx.send(FanoutJob {
                sign_up_id: failure.sign_up_id.clone(),
                phase: failure.sync_phase,
            });
            queued += 1;
        }
        if queued == 0 {
            return Err(AppError::NotFound(format!(
                "unresolved sync failure for sign-up {sign_up_id}"
            )));
        }
        info!(sign_up_id, queued, "re-queued fan-out legs");
        Ok(queued)
    }
}

/// Drains extraction jobs, invoking the external extractor for each.
pub async fn run_extraction_worker(
    mut rx: mpsc::UnboundedReceiver<ExtractionJob>,
    pipeline: Arc<SignUpPipeline>,
    extractor: Arc<dyn SlipExtractor>,
) {
    info!("extraction worker started");
    while let Some(job) = rx.recv().await {
        let outcome = extractor.extract(&job.image_key).await;
        if let Err(e) = pipeline.apply_extraction(&job.sign_up_id, outcome) {
            warn!(sign_up_id = %job.sign_up_id, "failed applying extraction result: {e}");
        }
    }
    info!("extraction worker stopped");
}

fn normalize(mut submission: SignUpSubmission) -> Result<SignUpSubmission, AppError> {
    let mut fields: Vec<(String, String)> = Vec::new();

    submission.customer_email = submission.customer_email.trim().to_lowercase();
    if !submission.customer_email.contains('@') {
        fields.push(("customerEmail".into(), "must be an email address".into()));
    }
    if submission.idempotency_key.trim().is_empty() {
        fields.push(("idempotencyKey".into(), "must not be empty".into()));
    }
    if submission.ambassador_id.trim().is_empty() {
        fields.push(("ambassadorId".into(), "must not be empty".into()));
    }
    match (&submission.event_id, &submission.solo_chat_id) {
        (Some(_), Some(_)) | (None, None) => {
            fields.push((
                "eventId".into(),
                "exactly one of eventId / soloChatId must be set".into(),
            ));
        }
        _ => {}
    }
    if let Some(state) = &submission.customer_state {
        let state = state.trim().to_uppercase();
        if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
            fields.push(("customerState".into(), "must be a 2-letter code".into()));
        }
        submission.customer_state = Some(state);
    }

    if !fields.is_empty() {
        return Err(AppError::ValidationFields(fields));
    }
    Ok(submission)
}
