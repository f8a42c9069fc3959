//! QuickBooks connector: API-key authenticated REST.

use super::{
    classify_reqwest, classify_status, ConnectionProbe, ErpApplication, ErpConnector, ErpError,
    FetchedInvoices, PostedApplication,
};
use crate::models::Invoice;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
struct QbInvoice {
    #[serde(rename = "DocNumber")]
    doc_number: String,
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "CustomerRef")]
    customer_ref: String,
    #[serde(rename = "TotalAmt")]
    total_amt: Decimal,
    #[serde(rename = "Balance")]
    balance: Decimal,
    #[serde(rename = "CurrencyRef")]
    currency_ref: String,
    #[serde(rename = "DueDate")]
    due_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct QbQueryResponse {
    #[serde(rename = "Invoice", default)]
    invoices: Vec<QbInvoice>,
}

#[derive(Debug, Deserialize)]
struct QbPayment {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct QbPaymentQueryResponse {
    #[serde(rename = "Payment", default)]
    payments: Vec<QbPayment>,
}

pub struct QuickBooksConnector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for QuickBooksConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickBooksConnector")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"***REDACTED***")
            .finish()
    }
}

impl QuickBooksConnector {
    pub fn new(name: String, base_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            name,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
        }
    }

    fn map_invoice(&self, inv: QbInvoice) -> Invoice {
        let status = if inv.balance <= Decimal::ZERO {
            "closed".to_string()
        } else if inv
            .due_date
            .map(|d| d < Utc::now().date_naive())
            .unwrap_or(false)
        {
            "overdue".to_string()
        } else {
            "open".to_string()
        };
        Invoice {
            invoice_id: inv.doc_number,
            erp_system: self.name.clone(),
            customer_id: inv.customer_ref,
            original_amount: inv.total_amt,
            amount_due: inv.balance,
            currency: inv.currency_ref,
            status,
            due_date: inv.due_date,
            erp_record_id: inv.id,
            fetched_utc: Utc::now(),
        }
    }
}

#[async_trait]
impl ErpConnector for QuickBooksConnector {
    fn system(&self) -> &str {
        &self.name
    }

    fn supports_idempotency_keys(&self) -> bool {
        false
    }

    async fn fetch_invoices(
        &self,
        invoice_ids: &[String],
        customer_id: Option<&str>,
    ) -> Result<FetchedInvoices, ErpError> {
        let mut query = format!(
            "select * from Invoice where DocNumber in ({})",
            invoice_ids
                .iter()
                .map(|id| format!("'{}'", id))
                .collect::<Vec<_>>()
                .join(",")
        );
        if let Some(customer) = customer_id {
            query = format!("{} and CustomerRef = '{}'", query, customer);
        }

        let response = self
            .client
            .get(format!("{}/v3/query", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "quickbooks query"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "quickbooks query"));
        }

        let body: QbQueryResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("quickbooks query response: {}", e)))?;

        let invoices: Vec<Invoice> = body
            .invoices
            .into_iter()
            .map(|inv| self.map_invoice(inv))
            .collect();
        let not_found = invoice_ids
            .iter()
            .filter(|id| !invoices.iter().any(|inv| &inv.invoice_id == *id))
            .cloned()
            .collect();

        Ok(FetchedInvoices {
            invoices,
            not_found,
        })
    }

    async fn post_application(
        &self,
        application: &ErpApplication,
    ) -> Result<PostedApplication, ErpError> {
        let response = self
            .client
            .post(format!("{}/v3/payment", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({
                "PrivateNote": application.transaction_id,
                "CustomerRef": application.customer_id,
                "CurrencyRef": application.currency,
                "TotalAmt": application.total_amount.to_string(),
                "Line": application.applications.iter().map(|a| serde_json::json!({
                    "LinkedTxn": { "DocNumber": a.invoice_id },
                    "Amount": a.amount_applied.to_string(),
                })).collect::<Vec<_>>(),
            }))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "quickbooks payment"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "quickbooks payment"));
        }

        let body: QbPayment = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("quickbooks payment response: {}", e)))?;

        Ok(PostedApplication {
            erp_transaction_id: body.id,
            posted_at: Utc::now(),
            duplicate: false,
        })
    }

    async fn find_application(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PostedApplication>, ErpError> {
        let query = format!(
            "select * from Payment where PrivateNote = '{}'",
            transaction_id
        );
        let response = self
            .client
            .get(format!("{}/v3/query", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "quickbooks payment lookup"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "quickbooks payment lookup"));
        }

        let body: QbPaymentQueryResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("quickbooks lookup response: {}", e)))?;

        Ok(body.payments.into_iter().next().map(|p| PostedApplication {
            erp_transaction_id: p.id,
            posted_at: Utc::now(),
            duplicate: true,
        }))
    }

    async fn test_connection(&self) -> Result<ConnectionProbe, ErpError> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/v3/companyinfo", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "quickbooks probe"))?;

        Ok(ConnectionProbe {
            ok: response.status().is_success(),
            latency_ms: started.elapsed().as_millis() as u64,
            version: None,
        })
    }
}
