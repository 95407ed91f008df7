//! CardOps expense client.
//!
//! Cursor-style pagination: every list response carries `{data, nextCursor?}`
//! and the caller loops while a cursor is present, passing it back opaque.
//! Monetary fields are major units on this wire.

use crate::integrations::http::PartnerHttp;
use crate::integrations::mappers::{self, CardRecord, CardTransaction};
use crate::retry::{with_retry, ClassifiedError, ErrorCategory, RetryConfig};
use crate::vault::CredentialVault;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const PROVIDER: &str = "cardops";

pub struct CardOpsClient {
    http: PartnerHttp,
    retry: RetryConfig,
}

/// One page of a cursor-style listing.
#[derive(Debug)]
pub struct CursorPage {
    pub data: Vec<Value>,
    pub next_cursor: Option<String>,
}

impl CursorPage {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// Spend aggregated per department over a window.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentSpend {
    pub department: String,
    pub transaction_count: u64,
    pub total_amount: f64,
}

impl CardOpsClient {
    pub fn new(client: reqwest::Client, base_url: &str, vault: Arc<CredentialVault>) -> Self {
        Self {
            http: PartnerHttp::new(client, base_url, PROVIDER, vault),
            retry: RetryConfig::default(),
        }
    }

    // -- reads --------------------------------------------------------------

    /// One transactions page. `from`/`to` are inclusive `YYYY-MM-DD`.
    pub async fn list_transactions(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<CursorPage, ClassifiedError> {
        let mut query: Vec<(String, String)> = Vec::with_capacity(3);
        if let Some(from) = from {
            query.push(("from_date".to_string(), from.to_string()));
        }
        if let Some(to) = to {
            query.push(("to_date".to_string(), to.to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("start".to_string(), cursor.to_string()));
        }

        let resp = with_retry(
            || self.http.get("/transactions", &query),
            &self.retry,
            "cardops.list_transactions",
            None,
        )
        .await
        .into_result()?;

        Ok(Self::parse_page(resp))
    }

    pub async fn get_card(&self, card_id: &str) -> Result<CardRecord, ClassifiedError> {
        let path = format!("/cards/{card_id}");
        let resp = with_retry(
            || self.http.get(&path, &[]),
            &self.retry,
            "cardops.get_card",
            None,
        )
        .await
        .into_result()?;
        mappers::cardops_card::to_internal(&resp).map_err(|e| {
            ClassifiedError::new(
                ErrorCategory::Validation,
                format!("card payload failed validation: {e}"),
            )
        })
    }

    pub async fn list_cards(&self, cursor: Option<&str>) -> Result<CursorPage, ClassifiedError> {
        let query: Vec<(String, String)> = cursor
            .map(|c| vec![("start".to_string(), c.to_string())])
            .unwrap_or_default();
        let resp = with_retry(
            || self.http.get("/cards", &query),
            &self.retry,
            "cardops.list_cards",
            None,
        )
        .await
        .into_result()?;
        Ok(Self::parse_page(resp))
    }

    pub async fn get_receipt(&self, receipt_id: &str) -> Result<Value, ClassifiedError> {
        let path = format!("/receipts/{receipt_id}");
        with_retry(
            || self.http.get(&path, &[]),
            &self.retry,
            "cardops.get_receipt",
            None,
        )
        .await
        .into_result()
    }

    pub async fn list_users(&self, cursor: Option<&str>) -> Result<CursorPage, ClassifiedError> {
        let query: Vec<(String, String)> = cursor
            .map(|c| vec![("start".to_string(), c.to_string())])
            .unwrap_or_default();
        let resp = with_retry(
            || self.http.get("/users", &query),
            &self.retry,
            "cardops.list_users",
            None,
        )
        .await
        .into_result()?;
        Ok(Self::parse_page(resp))
    }

    // -- card controls ------------------------------------------------------

    pub async fn suspend_card(&self, card_id: &str) -> Result<(), ClassifiedError> {
        let path = format!("/cards/{card_id}/deferred/suspension");
        let body = json!({});
        with_retry(
            || self.http.post(&path, &body),
            &self.retry,
            "cardops.suspend_card",
            None,
        )
        .await
        .into_result()?;
        Ok(())
    }

    pub async fn unsuspend_card(&self, card_id: &str) -> Result<(), ClassifiedError> {
        let path = format!("/cards/{card_id}/deferred/unsuspension");
        let body = json!({});
        with_retry(
            || self.http.post(&path, &body),
            &self.retry,
            "cardops.unsuspend_card",
            None,
        )
        .await
        .into_result()?;
        Ok(())
    }

    // -- aggregation --------------------------------------------------------

    /// Walk every transactions page in the window and aggregate spend per
    /// department. Unattributed transactions land in "Unassigned".
    pub async fn department_spend(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<DepartmentSpend>, ClassifiedError> {
        let mut totals: HashMap<String, (u64, f64)> = HashMap::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .list_transactions(Some(from), Some(to), cursor.as_deref())
                .await?;
            for raw in &page.data {
                let Ok(txn) = mappers::cardops_transaction::to_internal(raw) else {
                    debug!("skipping malformed transaction in spend aggregation");
                    continue;
                };
                let dept = txn
                    .department
                    .unwrap_or_else(|| "Unassigned".to_string());
                let entry = totals.entry(dept).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += txn.amount;
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        let mut out: Vec<DepartmentSpend> = totals
            .into_iter()
            .map(|(department, (transaction_count, total_amount))| DepartmentSpend {
                department,
                transaction_count,
                total_amount: (total_amount * 100.0).round() / 100.0,
            })
            .collect();
        out.sort_by(|a, b| {
            b.total_amount
                .partial_cmp(&a.total_amount)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(out)
    }

    /// Collect all transactions in a window across pages. Used by expense
    /// reconciliation.
    pub async fn fetch_all_transactions(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<CardTransaction>, ClassifiedError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .list_transactions(Some(from), Some(to), cursor.as_deref())
                .await?;
            for raw in &page.data {
                if let Ok(txn) = mappers::cardops_transaction::to_internal(raw) {
                    all.push(txn);
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(all)
    }

    fn parse_page(resp: Value) -> CursorPage {
        let data = resp
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        let next_cursor = resp
            .get("page")
            .and_then(|p| p.get("next"))
            .or_else(|| resp.get("nextCursor"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(String::from);
        CursorPage { data, next_cursor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_shapes() {
        let with_next = json!({
            "data": [{"id": "t1"}],
            "page": { "next": "cursor-abc" }
        });
        let page = CardOpsClient::parse_page(with_next);
        assert_eq!(page.data.len(), 1);
        assert!(page.has_more());
        assert_eq!(page.next_cursor.as_deref(), Some("cursor-abc"));

        let flat = json!({ "data": [], "nextCursor": "c2" });
        let page = CardOpsClient::parse_page(flat);
        assert_eq!(page.next_cursor.as_deref(), Some("c2"));

        let last = json!({ "data": [{"id": "t9"}] });
        let page = CardOpsClient::parse_page(last);
        assert!(!page.has_more());

        // Empty-string cursor means done, not a cursor.
        let empty = json!({ "data": [], "nextCursor": "" });
        assert!(!CardOpsClient::parse_page(empty).has_more());
    }
}
