//! Partner payload mappers.
//!
//! A mapper is a pure `{to_internal, to_external, validate}` triple. The
//! external side is untyped JSON; nothing past this layer sees it. Monetary
//! conversion happens here and only here: LedgerBooks speaks minor units
//! (cents) on the wire, CardOps speaks major units.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outcome of one record in a batch transform. Batches never abort on the
/// first bad record; each entry carries its own result.
#[derive(Debug)]
pub struct MappedOutcome<T> {
    pub record: Value,
    pub result: Result<T, String>,
}

/// Run a mapper across a batch, surfacing per-record outcomes.
pub fn map_batch<T, F>(records: Vec<Value>, mut to_internal: F) -> Vec<MappedOutcome<T>>
where
    F: FnMut(&Value) -> Result<T, String>,
{
    records
        .into_iter()
        .map(|record| {
            let result = to_internal(&record);
            MappedOutcome { record, result }
        })
        .collect()
}

fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn dollars_to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

fn require_str(v: &Value, field: &str) -> Result<String, String> {
    v.get(field)
        .and_then(|f| f.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("missing or non-string field `{field}`"))
}

fn require_i64(v: &Value, field: &str) -> Result<i64, String> {
    v.get(field)
        .and_then(|f| f.as_i64())
        .ok_or_else(|| format!("missing or non-integer field `{field}`"))
}

fn require_f64(v: &Value, field: &str) -> Result<f64, String> {
    v.get(field)
        .and_then(|f| f.as_f64())
        .ok_or_else(|| format!("missing or non-numeric field `{field}`"))
}

// ---------------------------------------------------------------------------
// LedgerBooks (accounting partner, minor units on the wire)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub external_id: String,
    pub customer_external_id: String,
    /// Dollars.
    pub amount: f64,
    pub balance: f64,
    pub issued_on: String,
    pub due_on: Option<String>,
    pub memo: Option<String>,
}

pub mod ledgerbooks_invoice {
    use super::*;

    pub fn validate(v: &Value) -> Result<(), String> {
        require_str(v, "Id")?;
        require_i64(v, "TotalAmountCents")?;
        v.get("CustomerRef")
            .and_then(|c| c.get("value"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| "missing CustomerRef.value".to_string())?;
        require_str(v, "TxnDate")?;
        Ok(())
    }

    pub fn to_internal(v: &Value) -> Result<InvoiceRecord, String> {
        validate(v)?;
        Ok(InvoiceRecord {
            external_id: require_str(v, "Id")?,
            customer_external_id: v["CustomerRef"]["value"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            amount: cents_to_dollars(require_i64(v, "TotalAmountCents")?),
            balance: v
                .get("BalanceCents")
                .and_then(|b| b.as_i64())
                .map(cents_to_dollars)
                .unwrap_or(0.0),
            issued_on: require_str(v, "TxnDate")?,
            due_on: v.get("DueDate").and_then(|d| d.as_str()).map(String::from),
            memo: v
                .get("PrivateNote")
                .and_then(|m| m.as_str())
                .map(String::from),
        })
    }

    pub fn to_external(record: &InvoiceRecord) -> Value {
        let mut out = json!({
            "Id": record.external_id,
            "CustomerRef": { "value": record.customer_external_id },
            "TotalAmountCents": dollars_to_cents(record.amount),
            "BalanceCents": dollars_to_cents(record.balance),
            "TxnDate": record.issued_on,
        });
        if let Some(due) = &record.due_on {
            out["DueDate"] = json!(due);
        }
        if let Some(memo) = &record.memo {
            out["PrivateNote"] = json!(memo);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub external_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub active: bool,
}

pub mod ledgerbooks_customer {
    use super::*;

    pub fn validate(v: &Value) -> Result<(), String> {
        require_str(v, "Id")?;
        require_str(v, "DisplayName")?;
        Ok(())
    }

    pub fn to_internal(v: &Value) -> Result<CustomerRecord, String> {
        validate(v)?;
        Ok(CustomerRecord {
            external_id: require_str(v, "Id")?,
            display_name: require_str(v, "DisplayName")?,
            email: v
                .get("PrimaryEmailAddr")
                .and_then(|e| e.get("Address"))
                .and_then(|a| a.as_str())
                .map(String::from),
            active: v.get("Active").and_then(|a| a.as_bool()).unwrap_or(true),
        })
    }

    pub fn to_external(record: &CustomerRecord) -> Value {
        let mut out = json!({
            "Id": record.external_id,
            "DisplayName": record.display_name,
            "Active": record.active,
        });
        if let Some(email) = &record.email {
            out["PrimaryEmailAddr"] = json!({ "Address": email });
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub external_id: String,
    pub customer_external_id: String,
    pub amount: f64,
    pub received_on: String,
}

pub mod ledgerbooks_payment {
    use super::*;

    pub fn validate(v: &Value) -> Result<(), String> {
        require_str(v, "Id")?;
        require_i64(v, "TotalAmountCents")?;
        require_str(v, "TxnDate")?;
        Ok(())
    }

    pub fn to_internal(v: &Value) -> Result<PaymentRecord, String> {
        validate(v)?;
        Ok(PaymentRecord {
            external_id: require_str(v, "Id")?,
            customer_external_id: v
                .get("CustomerRef")
                .and_then(|c| c.get("value"))
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            amount: cents_to_dollars(require_i64(v, "TotalAmountCents")?),
            received_on: require_str(v, "TxnDate")?,
        })
    }

    pub fn to_external(record: &PaymentRecord) -> Value {
        json!({
            "Id": record.external_id,
            "CustomerRef": { "value": record.customer_external_id },
            "TotalAmountCents": dollars_to_cents(record.amount),
            "TxnDate": record.received_on,
        })
    }
}

// ---------------------------------------------------------------------------
// CardOps (expense partner, major units on the wire)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardTransaction {
    pub external_id: String,
    pub card_id: String,
    pub user_id: Option<String>,
    pub merchant: String,
    pub amount: f64,
    pub occurred_at: String,
    pub department: Option<String>,
    pub receipt_ids: Vec<String>,
}

pub mod cardops_transaction {
    use super::*;

    pub fn validate(v: &Value) -> Result<(), String> {
        require_str(v, "id")?;
        require_str(v, "card_id")?;
        require_f64(v, "amount")?;
        require_str(v, "merchant_name")?;
        require_str(v, "user_transaction_time")?;
        Ok(())
    }

    pub fn to_internal(v: &Value) -> Result<CardTransaction, String> {
        validate(v)?;
        Ok(CardTransaction {
            external_id: require_str(v, "id")?,
            card_id: require_str(v, "card_id")?,
            user_id: v.get("user_id").and_then(|u| u.as_str()).map(String::from),
            merchant: require_str(v, "merchant_name")?,
            amount: require_f64(v, "amount")?,
            occurred_at: require_str(v, "user_transaction_time")?,
            department: v
                .get("department_name")
                .and_then(|d| d.as_str())
                .map(String::from),
            receipt_ids: v
                .get("receipts")
                .and_then(|r| r.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|r| r.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn to_external(record: &CardTransaction) -> Value {
        json!({
            "id": record.external_id,
            "card_id": record.card_id,
            "user_id": record.user_id,
            "merchant_name": record.merchant,
            "amount": record.amount,
            "user_transaction_time": record.occurred_at,
            "department_name": record.department,
            "receipts": record.receipt_ids,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRecord {
    pub external_id: String,
    pub holder_user_id: Option<String>,
    pub last_four: String,
    pub state: String,
}

pub mod cardops_card {
    use super::*;

    pub fn validate(v: &Value) -> Result<(), String> {
        require_str(v, "id")?;
        require_str(v, "last_four")?;
        require_str(v, "state")?;
        Ok(())
    }

    pub fn to_internal(v: &Value) -> Result<CardRecord, String> {
        validate(v)?;
        Ok(CardRecord {
            external_id: require_str(v, "id")?,
            holder_user_id: v
                .get("cardholder_id")
                .and_then(|u| u.as_str())
                .map(String::from),
            last_four: require_str(v, "last_four")?,
            state: require_str(v, "state")?,
        })
    }

    pub fn to_external(record: &CardRecord) -> Value {
        json!({
            "id": record.external_id,
            "cardholder_id": record.holder_user_id,
            "last_four": record.last_four,
            "state": record.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_round_trip_minor_units() {
        let wire = json!({
            "Id": "inv-77",
            "CustomerRef": { "value": "cust-3" },
            "TotalAmountCents": 123456,
            "BalanceCents": 10050,
            "TxnDate": "2025-06-01",
            "DueDate": "2025-07-01",
        });

        let internal = ledgerbooks_invoice::to_internal(&wire).unwrap();
        assert!((internal.amount - 1234.56).abs() < 1e-9);
        assert!((internal.balance - 100.50).abs() < 1e-9);

        let back = ledgerbooks_invoice::to_external(&internal);
        assert_eq!(back["TotalAmountCents"], 123456);
        assert_eq!(back["BalanceCents"], 10050);
        assert_eq!(back["Id"], "inv-77");
        assert_eq!(back["CustomerRef"]["value"], "cust-3");
        assert_eq!(back["DueDate"], "2025-07-01");
    }

    #[test]
    fn test_invoice_validate_rejects_missing_fields() {
        let bad = json!({ "Id": "inv-1", "TxnDate": "2025-01-01" });
        assert!(ledgerbooks_invoice::validate(&bad).is_err());
        assert!(ledgerbooks_invoice::to_internal(&bad).is_err());
    }

    #[test]
    fn test_cardops_transaction_major_units() {
        let wire = json!({
            "id": "txn-1",
            "card_id": "card-9",
            "user_id": "u-2",
            "merchant_name": "Stadium Parking LLC",
            "amount": 42.50,
            "user_transaction_time": "2025-03-04T19:22:00Z",
            "department_name": "Field Ops",
            "receipts": ["rcp-1", "rcp-2"],
        });

        let internal = cardops_transaction::to_internal(&wire).unwrap();
        assert!((internal.amount - 42.50).abs() < 1e-9);
        assert_eq!(internal.receipt_ids.len(), 2);

        let back = cardops_transaction::to_external(&internal);
        assert_eq!(back["amount"], 42.50);
        assert_eq!(back["merchant_name"], "Stadium Parking LLC");
    }

    #[test]
    fn test_map_batch_isolates_failures() {
        let records = vec![
            json!({ "Id": "c-1", "DisplayName": "Acme" }),
            json!({ "Id": "c-2" }),
            json!({ "Id": "c-3", "DisplayName": "Globex" }),
        ];

        let outcomes = map_batch(records, ledgerbooks_customer::to_internal);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
        // The failing record is preserved for diagnostics.
        assert_eq!(outcomes[1].record["Id"], "c-2");
    }

    #[test]
    fn test_rounding_is_the_only_loss() {
        let internal = InvoiceRecord {
            external_id: "inv-1".to_string(),
            customer_external_id: "cust-1".to_string(),
            amount: 10.005, // sub-cent: rounds on egress
            balance: 0.0,
            issued_on: "2025-01-01".to_string(),
            due_on: None,
            memo: None,
        };
        let wire = ledgerbooks_invoice::to_external(&internal);
        assert_eq!(wire["TotalAmountCents"], 1001);
    }
}
