//! Partner CRM adapter — the fan-out target for sign-up identities.
//!
//! Two write shapes, matching the pipeline's two sync phases: identity
//! upsert right after persist, attribute enrichment after validation.

use crate::integrations::http::PartnerHttp;
use crate::models::SignUp;
use crate::retry::{with_retry, ClassifiedError, RetryConfig};
use crate::vault::CredentialVault;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "crm";

pub struct CrmClient {
    http: PartnerHttp,
    retry: RetryConfig,
}

impl CrmClient {
    pub fn new(client: reqwest::Client, base_url: &str, vault: Arc<CredentialVault>) -> Self {
        Self {
            http: PartnerHttp::new(client, base_url, PROVIDER, vault),
            // Fan-out legs run in the background; keep the budget tighter
            // than interactive calls.
            retry: RetryConfig {
                max_attempts: 4,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }

    /// Identity payload: who signed up, nothing commercial yet.
    pub fn identity_payload(sign_up: &SignUp) -> Value {
        json!({
            "email": sign_up.customer_email,
            "name": sign_up.customer_name,
            "state": sign_up.customer_state,
            "operatorId": sign_up.operator_id,
            "ambassadorId": sign_up.ambassador_id,
            "signedUpAt": sign_up.submitted_at.to_rfc3339(),
        })
    }

    /// Enrichment payload: commission and wager fields, sent once the
    /// sign-up validates.
    pub fn enriched_payload(sign_up: &SignUp) -> Value {
        json!({
            "email": sign_up.customer_email,
            "cpaAmount": sign_up.cpa_amount,
            "betAmount": sign_up.extracted.bet_amount,
            "teamBetOn": sign_up.extracted.team_bet_on,
            "odds": sign_up.extracted.odds,
            "validationStatus": sign_up.validation_status.as_str(),
        })
    }

    /// Upsert the person record keyed by our sign-up id.
    pub async fn push_identity(&self, sign_up: &SignUp) -> Result<(), ClassifiedError> {
        let path = format!("/customers/{}", sign_up.id);
        let body = Self::identity_payload(sign_up);
        with_retry(
            || self.http.put(&path, &body),
            &self.retry,
            "crm.push_identity",
            None,
        )
        .await
        .into_result()?;
        Ok(())
    }

    /// Push enriched attributes onto an existing person record.
    pub async fn push_enriched(&self, sign_up: &SignUp) -> Result<(), ClassifiedError> {
        let path = format!("/customers/{}/attributes", sign_up.id);
        let body = Self::enriched_payload(sign_up);
        with_retry(
            || self.http.put(&path, &body),
            &self.retry,
            "crm.push_enriched",
            None,
        )
        .await
        .into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractedFields, ExtractionStatus, ValidationStatus};
    use chrono::Utc;

    fn sign_up() -> SignUp {
        SignUp {
            id: "su-1".to_string(),
            event_id: Some("ev-1".to_string()),
            solo_chat_id: None,
            ambassador_id: "amb-1".to_string(),
            operator_id: 7,
            customer_email: "a@b.com".to_string(),
            customer_name: Some("Ada".to_string()),
            customer_state: Some("NJ".to_string()),
            submitted_at: Utc::now(),
            validation_status: ValidationStatus::Validated,
            extraction_status: ExtractionStatus::Confirmed,
            extracted: ExtractedFields {
                bet_amount: Some(50.0),
                team_bet_on: Some("Home".to_string()),
                odds: Some("+110".to_string()),
                extraction_confidence: Some(0.95),
            },
            image_key: None,
            cpa_amount: Some(125.0),
            pay_period_id: None,
            idempotency_key: "k1".to_string(),
        }
    }

    #[test]
    fn test_identity_payload_has_no_commercial_fields() {
        let payload = CrmClient::identity_payload(&sign_up());
        assert_eq!(payload["email"], "a@b.com");
        assert_eq!(payload["operatorId"], 7);
        assert!(payload.get("cpaAmount").is_none());
        assert!(payload.get("betAmount").is_none());
    }

    #[test]
    fn test_enriched_payload_carries_commission() {
        let payload = CrmClient::enriched_payload(&sign_up());
        assert_eq!(payload["cpaAmount"], 125.0);
        assert_eq!(payload["betAmount"], 50.0);
        assert_eq!(payload["validationStatus"], "validated");
    }
}
