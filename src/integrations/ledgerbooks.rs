//! LedgerBooks accounting client.
//!
//! Offset-style pagination: the caller supplies `startPosition`/`maxResults`
//! and iterates until it has consumed `totalCount`. Monetary fields travel
//! in minor units; `mappers` is the single conversion point.

use crate::integrations::http::PartnerHttp;
use crate::integrations::mappers::{self, CustomerRecord, InvoiceRecord, PaymentRecord};
use crate::retry::{with_retry, ClassifiedError, ErrorCategory, RetryConfig};
use crate::vault::CredentialVault;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const PROVIDER: &str = "ledgerbooks";

/// Page size for bulk pulls.
const QUERY_PAGE_SIZE: u64 = 100;

pub struct LedgerBooksClient {
    http: PartnerHttp,
    retry: RetryConfig,
}

/// One page of an offset-style query.
#[derive(Debug)]
pub struct OffsetPage {
    pub records: Vec<Value>,
    pub total_count: u64,
    pub start_position: u64,
}

#[derive(Debug, Clone)]
pub struct PnlReport {
    pub from_date: String,
    pub to_date: String,
    pub total_income: f64,
    pub total_expenses: f64,
    pub net_income: f64,
    pub rows: Vec<(String, f64)>,
}

impl LedgerBooksClient {
    pub fn new(client: reqwest::Client, base_url: &str, vault: Arc<CredentialVault>) -> Self {
        Self {
            http: PartnerHttp::new(client, base_url, PROVIDER, vault),
            retry: RetryConfig::default(),
        }
    }

    // -- invoices -----------------------------------------------------------

    pub async fn create_invoice(
        &self,
        invoice: &InvoiceRecord,
    ) -> Result<InvoiceRecord, ClassifiedError> {
        let body = mappers::ledgerbooks_invoice::to_external(invoice);
        let resp = with_retry(
            || self.http.post("/invoice", &body),
            &self.retry,
            "ledgerbooks.create_invoice",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Invoice", mappers::ledgerbooks_invoice::to_internal)
    }

    pub async fn get_invoice(&self, external_id: &str) -> Result<InvoiceRecord, ClassifiedError> {
        let path = format!("/invoice/{external_id}");
        let resp = with_retry(
            || self.http.get(&path, &[]),
            &self.retry,
            "ledgerbooks.get_invoice",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Invoice", mappers::ledgerbooks_invoice::to_internal)
    }

    pub async fn update_invoice(
        &self,
        invoice: &InvoiceRecord,
    ) -> Result<InvoiceRecord, ClassifiedError> {
        let body = mappers::ledgerbooks_invoice::to_external(invoice);
        let resp = with_retry(
            || self.http.post("/invoice?operation=update", &body),
            &self.retry,
            "ledgerbooks.update_invoice",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Invoice", mappers::ledgerbooks_invoice::to_internal)
    }

    pub async fn delete_invoice(&self, external_id: &str) -> Result<(), ClassifiedError> {
        let path = format!("/invoice/{external_id}?operation=delete");
        with_retry(
            || self.http.post(&path, &Value::Null),
            &self.retry,
            "ledgerbooks.delete_invoice",
            None,
        )
        .await
        .into_result()?;
        Ok(())
    }

    /// One page of invoices starting at `start_position` (1-based, partner
    /// convention).
    pub async fn query_invoices(
        &self,
        start_position: u64,
        max_results: u64,
    ) -> Result<OffsetPage, ClassifiedError> {
        self.query_entities("Invoice", start_position, max_results)
            .await
    }

    // -- customers ----------------------------------------------------------

    pub async fn create_customer(
        &self,
        customer: &CustomerRecord,
    ) -> Result<CustomerRecord, ClassifiedError> {
        let body = mappers::ledgerbooks_customer::to_external(customer);
        let resp = with_retry(
            || self.http.post("/customer", &body),
            &self.retry,
            "ledgerbooks.create_customer",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Customer", mappers::ledgerbooks_customer::to_internal)
    }

    pub async fn get_customer(&self, external_id: &str) -> Result<CustomerRecord, ClassifiedError> {
        let path = format!("/customer/{external_id}");
        let resp = with_retry(
            || self.http.get(&path, &[]),
            &self.retry,
            "ledgerbooks.get_customer",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Customer", mappers::ledgerbooks_customer::to_internal)
    }

    pub async fn update_customer(
        &self,
        customer: &CustomerRecord,
    ) -> Result<CustomerRecord, ClassifiedError> {
        let body = mappers::ledgerbooks_customer::to_external(customer);
        let resp = with_retry(
            || self.http.post("/customer?operation=update", &body),
            &self.retry,
            "ledgerbooks.update_customer",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Customer", mappers::ledgerbooks_customer::to_internal)
    }

    pub async fn query_customers(
        &self,
        start_position: u64,
        max_results: u64,
    ) -> Result<OffsetPage, ClassifiedError> {
        self.query_entities("Customer", start_position, max_results)
            .await
    }

    // -- payments -----------------------------------------------------------

    pub async fn create_payment(
        &self,
        payment: &PaymentRecord,
    ) -> Result<PaymentRecord, ClassifiedError> {
        let body = mappers::ledgerbooks_payment::to_external(payment);
        let resp = with_retry(
            || self.http.post("/payment", &body),
            &self.retry,
            "ledgerbooks.create_payment",
            None,
        )
        .await
        .into_result()?;
        Self::unwrap_entity(&resp, "Payment", mappers::ledgerbooks_payment::to_internal)
    }

    pub async fn query_payments(
        &self,
        start_position: u64,
        max_results: u64,
    ) -> Result<OffsetPage, ClassifiedError> {
        self.query_entities("Payment", start_position, max_results)
            .await
    }

    // -- reports ------------------------------------------------------------

    pub async fn profit_and_loss(
        &self,
        from_date: &str,
        to_date: &str,
    ) -> Result<PnlReport, ClassifiedError> {
        let query = vec![
            ("start_date".to_string(), from_date.to_string()),
            ("end_date".to_string(), to_date.to_string()),
        ];
        let resp = with_retry(
            || self.http.get("/reports/ProfitAndLoss", &query),
            &self.retry,
            "ledgerbooks.profit_and_loss",
            None,
        )
        .await
        .into_result()?;

        let rows = resp
            .get("Rows")
            .and_then(|r| r.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let label = row.get("Label")?.as_str()?.to_string();
                        let cents = row.get("AmountCents")?.as_i64()?;
                        Some((label, cents as f64 / 100.0))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let total = |label: &str| {
            rows.iter()
                .find(|(l, _)| l == label)
                .map(|(_, v)| *v)
                .unwrap_or(0.0)
        };

        Ok(PnlReport {
            from_date: from_date.to_string(),
            to_date: to_date.to_string(),
            total_income: total("Total Income"),
            total_expenses: total("Total Expenses"),
            net_income: total("Net Income"),
            rows,
        })
    }

    pub async fn balance_sheet(&self, as_of: &str) -> Result<Value, ClassifiedError> {
        let query = vec![("as_of".to_string(), as_of.to_string())];
        with_retry(
            || self.http.get("/reports/BalanceSheet", &query),
            &self.retry,
            "ledgerbooks.balance_sheet",
            None,
        )
        .await
        .into_result()
    }

    // -- plumbing -----------------------------------------------------------

    async fn query_entities(
        &self,
        entity: &str,
        start_position: u64,
        max_results: u64,
    ) -> Result<OffsetPage, ClassifiedError> {
        let query = vec![
            ("entity".to_string(), entity.to_string()),
            ("startPosition".to_string(), start_position.to_string()),
            ("maxResults".to_string(), max_results.to_string()),
        ];
        let resp = with_retry(
            || self.http.get("/query", &query),
            &self.retry,
            "ledgerbooks.query",
            None,
        )
        .await
        .into_result()?;

        let records = resp
            .get("QueryResponse")
            .and_then(|q| q.get(entity))
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default();
        let total_count = resp
            .get("QueryResponse")
            .and_then(|q| q.get("totalCount"))
            .and_then(|t| t.as_u64())
            .unwrap_or(records.len() as u64);

        debug!(entity, start_position, count = records.len(), total_count, "ledgerbooks page");

        Ok(OffsetPage {
            records,
            total_count,
            start_position,
        })
    }

    /// Page of invoices strictly after `after_id` in id order. This is the
    /// resumable shape the sync orchestrator drives.
    pub async fn query_invoices_after(
        &self,
        after_id: Option<&str>,
        max_results: u64,
    ) -> Result<Vec<Value>, ClassifiedError> {
        self.query_entities_after("Invoice", after_id, max_results)
            .await
    }

    pub async fn query_customers_after(
        &self,
        after_id: Option<&str>,
        max_results: u64,
    ) -> Result<Vec<Value>, ClassifiedError> {
        self.query_entities_after("Customer", after_id, max_results)
            .await
    }

    async fn query_entities_after(
        &self,
        entity: &str,
        after_id: Option<&str>,
        max_results: u64,
    ) -> Result<Vec<Value>, ClassifiedError> {
        let mut query = vec![
            ("entity".to_string(), entity.to_string()),
            ("orderBy".to_string(), "Id".to_string()),
            ("maxResults".to_string(), max_results.to_string()),
        ];
        if let Some(after) = after_id {
            query.push(("afterId".to_string(), after.to_string()));
        }
        let resp = with_retry(
            || self.http.get("/query", &query),
            &self.retry,
            "ledgerbooks.query_after",
            None,
        )
        .await
        .into_result()?;

        Ok(resp
            .get("QueryResponse")
            .and_then(|q| q.get(entity))
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Pull every invoice by walking offset pages until `totalCount` is
    /// consumed.
    pub async fn fetch_all_invoices(&self) -> Result<Vec<Value>, ClassifiedError> {
        let mut all: Vec<Value> = Vec::new();
        let mut position = 1u64;
        loop {
            let page = self.query_invoices(position, QUERY_PAGE_SIZE).await?;
            let fetched = page.records.len() as u64;
            all.extend(page.records);
            position += fetched;
            if all.len() as u64 >= page.total_count || fetched == 0 {
                break;
            }
        }
        Ok(all)
    }

    fn unwrap_entity<T>(
        resp: &Value,
        entity: &str,
        to_internal: impl Fn(&Value) -> Result<T, String>,
    ) -> Result<T, ClassifiedError> {
        let body = resp.get(entity).unwrap_or(resp);
        to_internal(body).map_err(|e| {
            ClassifiedError::new(
                ErrorCategory::Validation,
                format!("{entity} payload failed validation: {e}"),
            )
        })
    }
}
