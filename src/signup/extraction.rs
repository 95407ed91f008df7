//! Bet-slip extraction.
//!
//! The extractor is an external collaborator reached through a trait; the
//! core never reads pixels. Completed extractions either auto-confirm
//! (confidence ≥ 0.9 with all three fields) or land in the review queue.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Auto-confirm threshold.
pub const CONFIDENCE_AUTO_CONFIRM: f64 = 0.9;

/// What the extractor read off a slip image.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub bet_amount: Option<f64>,
    pub team_bet_on: Option<String>,
    pub odds: Option<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl ExtractionResult {
    pub fn is_complete(&self) -> bool {
        self.bet_amount.is_some() && self.team_bet_on.is_some() && self.odds.is_some()
    }

    pub fn auto_confirms(&self) -> bool {
        self.confidence >= CONFIDENCE_AUTO_CONFIRM && self.is_complete()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("extraction failed: {reason}")]
pub struct ExtractionFailure {
    pub reason: String,
}

/// Contract with the external extraction service: image key in, structured
/// fields (or failure) out.
#[async_trait]
pub trait SlipExtractor: Send + Sync {
    async fn extract(&self, image_key: &str) -> Result<ExtractionResult, ExtractionFailure>;
}

/// Work item queued by the pipeline when a submission carries an image.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub sign_up_id: String,
    pub image_key: String,
}

#[derive(Debug, Deserialize)]
struct ExtractorResponse {
    #[serde(rename = "betAmount")]
    bet_amount: Option<f64>,
    #[serde(rename = "teamBetOn")]
    team_bet_on: Option<String>,
    odds: Option<String>,
    confidence: f64,
}

/// HTTP adapter for the extraction service.
pub struct HttpSlipExtractor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSlipExtractor {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl SlipExtractor for HttpSlipExtractor {
    async fn extract(&self, image_key: &str) -> Result<ExtractionResult, ExtractionFailure> {
        let url = format!("{}/extract", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "imageKey": image_key }))
            .send()
            .await
            .map_err(|e| ExtractionFailure {
                reason: format!("extractor unreachable: {e}"),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractionFailure {
                reason: format!("extractor returned {status}: {body}"),
            });
        }

        let parsed: ExtractorResponse = resp.json().await.map_err(|e| ExtractionFailure {
            reason: format!("unparseable extractor response: {e}"),
        })?;

        debug!(image_key, confidence = parsed.confidence, "extraction returned");

        Ok(ExtractionResult {
            bet_amount: parsed.bet_amount,
            team_bet_on: parsed.team_bet_on,
            odds: parsed.odds,
            confidence: parsed.confidence.clamp(0.0, 1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_confirm_needs_confidence_and_completeness() {
        let full = ExtractionResult {
            bet_amount: Some(50.0),
            team_bet_on: Some("Home".to_string()),
            odds: Some("+110".to_string()),
            confidence: 0.95,
        };
        assert!(full.auto_confirms());

        let low_confidence = ExtractionResult {
            confidence: 0.6,
            ..full.clone()
        };
        assert!(!low_confidence.auto_confirms());

        let missing_field = ExtractionResult {
            odds: None,
            ..full
        };
        assert!(!missing_field.auto_confirms());
    }

    #[test]
    fn test_boundary_confidence() {
        let at_threshold = ExtractionResult {
            bet_amount: Some(10.0),
            team_bet_on: Some("Away".to_string()),
            odds: Some("-200".to_string()),
            confidence: 0.9,
        };
        assert!(at_threshold.auto_confirms());
    }
}
