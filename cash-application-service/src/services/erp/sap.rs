//! SAP connector: certificate-authenticated OData service.

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
struct SapInvoice {
    #[serde(rename = "InvoiceNumber")]
    invoice_number: String,
    #[serde(rename = "DocumentId")]
    document_id: String,
    #[serde(rename = "Customer")]
    customer: String,
    #[serde(rename = "GrossAmount")]
    gross_amount: Decimal,
    #[serde(rename = "OpenAmount")]
    open_amount: Decimal,
    #[serde(rename = "Currency")]
    currency: String,
    #[serde(rename = "ClearingStatus")]
    clearing_status: String,
    #[serde(rename = "DueDate")]
    due_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct SapResults<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SapPostResponse {
    #[serde(rename = "ClearingDocument")]
    clearing_document: String,
}

pub struct SapConnector {
    name: String,
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for SapConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SapConnector")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("identity", &"***REDACTED***")
            .finish()
    }
}

impl SapConnector {
    /// `certificate_pem` holds the client certificate and key used for
    /// mutual TLS towards the SAP gateway.
    pub fn new(
        name: String,
        base_url: String,
        certificate_pem: &[u8],
        timeout: Duration,
    ) -> Result<Self, ErpError> {
        let identity = reqwest::Identity::from_pem(certificate_pem)
            .map_err(|e| ErpError::Auth(format!("sap client certificate: {}", e)))?;

        let client = reqwest::Client::builder()
            .identity(identity)
            .timeout(timeout)
            .build()
            .map_err(|e| ErpError::Auth(format!("sap client build: {}", e)))?;

        Ok(Self {
            name,
            client,
            base_url,
        })
    }

    fn map_invoice(&self, inv: SapInvoice) -> Invoice {
        Invoice {
            invoice_id: inv.invoice_number,
            erp_system: self.name.clone(),
            customer_id: inv.customer,
            original_amount: inv.gross_amount,
            amount_due: inv.open_amount,
            currency: inv.currency,
            status: match inv.clearing_status.as_str() {
                "C" => "closed".to_string(),
                "D" => "disputed".to_string(),
                "O" if inv.due_date.map(|d| d < Utc::now().date_naive()).unwrap_or(false) => {
                    "overdue".to_string()
                }
                _ => "open".to_string(),
            },
            due_date: inv.due_date,
            erp_record_id: inv.document_id,
            fetched_utc: Utc::now(),
        }
    }
}

#[async_trait]
impl ErpConnector for SapConnector {
    fn system(&self) -> &str {
        &self.name
    }

    fn supports_idempotency_keys(&self) -> bool {
        // SAP clearing has no native idempotency key; the facade issues a
        // reference lookup before posting.
        false
    }

    async fn fetch_invoices(
        &self,
        invoice_ids: &[String],
        customer_id: Option<&str>,
    ) -> Result<FetchedInvoices, ErpError> {
        let mut filter = format!(
            "InvoiceNumber in ({})",
            invoice_ids
                .iter()
                .map(|id| format!("'{}'", id))
                .collect::<Vec<_>>()
                .join(",")
        );
        if let Some(customer) = customer_id {
            filter = format!("{} and Customer eq '{}'", filter, customer);
        }

        let response = self
            .client
            .get(format!("{}/API_OPENINVOICE_SRV/OpenInvoices", self.base_url))
            .query(&[("$filter", filter.as_str()), ("$format", "json")])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "sap invoice query"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "sap invoice query"));
        }

        let body: SapResults<SapInvoice> = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("sap invoice response: {}", e)))?;

        let invoices: Vec<Invoice> = body
            .results
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
            .post(format!(
                "{}/API_CASHAPPLICATION_SRV/Clearings",
                self.base_url
            ))
            .json(&serde_json::json!({
                "Reference": application.transaction_id,
                "Customer": application.customer_id,
                "Currency": application.currency,
                "Amount": application.total_amount.to_string(),
                "Items": application.applications.iter().map(|a| serde_json::json!({
                    "InvoiceNumber": a.invoice_id,
                    "AppliedAmount": a.amount_applied.to_string(),
                })).collect::<Vec<_>>(),
            }))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "sap clearing"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "sap clearing"));
        }

        let body: SapPostResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("sap clearing response: {}", e)))?;

        Ok(PostedApplication {
            erp_transaction_id: body.clearing_document,
            posted_at: Utc::now(),
            duplicate: false,
        })
    }

    async fn find_application(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PostedApplication>, ErpError> {
        let response = self
            .client
            .get(format!(
                "{}/API_CASHAPPLICATION_SRV/Clearings",
                self.base_url
            ))
            .query(&[
                ("$filter", format!("Reference eq '{}'", transaction_id)),
                ("$format", "json".to_string()),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "sap clearing lookup"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "sap clearing lookup"));
        }

        let body: SapResults<SapPostResponse> = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("sap lookup response: {}", e)))?;

        Ok(body.results.into_iter().next().map(|r| PostedApplication {
            erp_transaction_id: r.clearing_document,
            posted_at: Utc::now(),
            duplicate: true,
        }))
    }

    async fn test_connection(&self) -> Result<ConnectionProbe, ErpError> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/$metadata", self.base_url))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "sap probe"))?;

        Ok(ConnectionProbe {
            ok: response.status().is_success(),
            latency_ms: started.elapsed().as_millis() as u64,
            version: None,
        })
    }
}
