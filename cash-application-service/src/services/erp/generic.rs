//! Generic REST adapter for ERPs without a dedicated connector.
//!
//! Expects a small conventional surface: `POST {base}/invoices/search`,
//! `POST {base}/applications`, `GET {base}/applications?reference=` and
//! `GET {base}/health`, with invoices serialized in this service's own
//! shape. Optional bearer auth.

use super::{
    classify_reqwest, classify_status, ConnectionProbe, ErpApplication, ErpConnector, ErpError,
    FetchedInvoices, PostedApplication,
};
use crate::models::Invoice;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
struct GenericSearchResponse {
    invoices: Vec<Invoice>,
    #[serde(default)]
    not_found: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenericPostResponse {
    erp_transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct GenericLookupResponse {
    #[serde(default)]
    applications: Vec<GenericPostResponse>,
}

pub struct GenericConnector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for GenericConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericConnector")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***REDACTED***"))
            .finish()
    }
}

impl GenericConnector {
    pub fn new(name: String, base_url: String, api_key: Option<String>, timeout: Duration) -> Self {
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

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl ErpConnector for GenericConnector {
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
        let response = self
            .authorize(self.client.post(format!("{}/invoices/search", self.base_url)))
            .json(&serde_json::json!({
                "invoice_ids": invoice_ids,
                "customer_id": customer_id,
            }))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "generic invoice search"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "generic invoice search"));
        }

        let mut body: GenericSearchResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("generic search response: {}", e)))?;

        for invoice in &mut body.invoices {
            invoice.erp_system = self.name.clone();
            invoice.fetched_utc = Utc::now();
        }

        Ok(FetchedInvoices {
            invoices: body.invoices,
            not_found: body.not_found,
        })
    }

    async fn post_application(
        &self,
        application: &ErpApplication,
    ) -> Result<PostedApplication, ErpError> {
        let response = self
            .authorize(self.client.post(format!("{}/applications", self.base_url)))
            .json(application)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "generic application"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "generic application"));
        }

        let body: GenericPostResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("generic post response: {}", e)))?;

        Ok(PostedApplication {
            erp_transaction_id: body.erp_transaction_id,
            posted_at: Utc::now(),
            duplicate: false,
        })
    }

    async fn find_application(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PostedApplication>, ErpError> {
        let response = self
            .authorize(self.client.get(format!("{}/applications", self.base_url)))
            .query(&[("reference", transaction_id)])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "generic application lookup"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "generic application lookup"));
        }

        let body: GenericLookupResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("generic lookup response: {}", e)))?;

        Ok(body
            .applications
            .into_iter()
            .next()
            .map(|a| PostedApplication {
                erp_transaction_id: a.erp_transaction_id,
                posted_at: Utc::now(),
                duplicate: true,
            }))
    }

    async fn test_connection(&self) -> Result<ConnectionProbe, ErpError> {
        let started = Instant::now();
        let response = self
            .authorize(self.client.get(format!("{}/health", self.base_url)))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "generic probe"))?;

        Ok(ConnectionProbe {
            ok: response.status().is_success(),
            latency_ms: started.elapsed().as_millis() as u64,
            version: None,
        })
    }
}
