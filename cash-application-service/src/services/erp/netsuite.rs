//! NetSuite connector: OAuth2 client-credentials with token rotation.

use super::{
    classify_reqwest, classify_status, ApplicationLine, ConnectionProbe, ErpApplication,
    ErpConnector, ErpError, FetchedInvoices, PostedApplication,
};
use crate::models::Invoice;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct NetSuiteInvoice {
    #[serde(rename = "tranId")]
    tran_id: String,
    #[serde(rename = "internalId")]
    internal_id: String,
    entity: String,
    total: Decimal,
    #[serde(rename = "amountRemaining")]
    amount_remaining: Decimal,
    currency: String,
    status: String,
    #[serde(rename = "dueDate")]
    due_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct NetSuiteSearchResponse {
    items: Vec<NetSuiteInvoice>,
}

#[derive(Debug, Serialize)]
struct NetSuitePaymentBody<'a> {
    #[serde(rename = "externalId")]
    external_id: &'a str,
    entity: &'a str,
    currency: &'a str,
    total: Decimal,
    #[serde(rename = "applyList")]
    apply_list: &'a [ApplicationLine],
}

#[derive(Debug, Deserialize)]
struct NetSuitePaymentResponse {
    #[serde(rename = "internalId")]
    internal_id: String,
}

pub struct NetSuiteConnector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for NetSuiteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetSuiteConnector")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***REDACTED***")
            .finish()
    }
}

impl NetSuiteConnector {
    pub fn new(
        name: String,
        base_url: String,
        client_id: String,
        client_secret: String,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url,
            client_id,
            client_secret,
            token: RwLock::new(None),
        }
    }

    async fn ensure_token(&self) -> Result<String, ErpError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.access_token.clone());
            }
        }

        let mut guard = self.token.write().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.access_token.clone());
            }
        }

        debug!(system = %self.name, "Acquiring NetSuite access token");
        let response = self
            .client
            .post(format!(
                "{}/services/rest/auth/oauth2/v1/token",
                self.base_url
            ))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "netsuite token"))?;

        if !response.status().is_success() {
            return Err(ErpError::Auth(format!(
                "netsuite token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Auth(format!("netsuite token response: {}", e)))?;

        let cached = CachedToken {
            access_token: body.access_token.clone(),
            // Refresh one minute early.
            expires_at: Utc::now() + ChronoDuration::seconds((body.expires_in - 60).max(30)),
        };
        *guard = Some(cached);
        Ok(body.access_token)
    }

    fn map_invoice(&self, inv: NetSuiteInvoice) -> Invoice {
        Invoice {
            invoice_id: inv.tran_id,
            erp_system: self.name.clone(),
            customer_id: inv.entity,
            original_amount: inv.total,
            amount_due: inv.amount_remaining,
            currency: inv.currency,
            status: match inv.status.as_str() {
                "paidInFull" => "closed".to_string(),
                "inDispute" => "disputed".to_string(),
                "pastDue" => "overdue".to_string(),
                _ => "open".to_string(),
            },
            due_date: inv.due_date,
            erp_record_id: inv.internal_id,
            fetched_utc: Utc::now(),
        }
    }
}

#[async_trait]
impl ErpConnector for NetSuiteConnector {
    fn system(&self) -> &str {
        &self.name
    }

    fn supports_idempotency_keys(&self) -> bool {
        true
    }

    async fn fetch_invoices(
        &self,
        invoice_ids: &[String],
        customer_id: Option<&str>,
    ) -> Result<FetchedInvoices, ErpError> {
        let token = self.ensure_token().await?;

        let response = self
            .client
            .post(format!(
                "{}/services/rest/record/v1/invoice/search",
                self.base_url
            ))
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "tranIds": invoice_ids,
                "entity": customer_id,
                "status": ["open", "pastDue", "inDispute", "paidInFull"],
            }))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "netsuite invoice search"))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), "netsuite invoice search"));
        }

        let body: NetSuiteSearchResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("netsuite search response: {}", e)))?;

        let invoices: Vec<Invoice> = body
            .items
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
        let token = self.ensure_token().await?;

        let response = self
            .client
            .post(format!(
                "{}/services/rest/record/v1/customerPayment",
                self.base_url
            ))
            .bearer_auth(&token)
            .header("Idempotency-Key", &application.transaction_id)
            .json(&NetSuitePaymentBody {
                external_id: &application.transaction_id,
                entity: &application.customer_id,
                currency: &application.currency,
                total: application.total_amount,
                apply_list: &application.applications,
            })
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "netsuite payment"))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            // The idempotency key matched a prior posting.
            if let Some(existing) = self.find_application(&application.transaction_id).await? {
                return Err(ErpError::Duplicate {
                    erp_transaction_id: existing.erp_transaction_id,
                });
            }
            return Err(ErpError::Conflict("netsuite payment conflict".to_string()));
        }
        if !status.is_success() {
            return Err(classify_status(status, "netsuite payment"));
        }

        let body: NetSuitePaymentResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("netsuite payment response: {}", e)))?;

        Ok(PostedApplication {
            erp_transaction_id: body.internal_id,
            posted_at: Utc::now(),
            duplicate: false,
        })
    }

    async fn find_application(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PostedApplication>, ErpError> {
        let token = self.ensure_token().await?;

        let response = self
            .client
            .get(format!(
                "{}/services/rest/record/v1/customerPayment",
                self.base_url
            ))
            .bearer_auth(&token)
            .query(&[("externalId", transaction_id)])
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "netsuite payment lookup"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "netsuite payment lookup"));
        }

        let body: NetSuitePaymentResponse = response
            .json()
            .await
            .map_err(|e| ErpError::Permanent(format!("netsuite lookup response: {}", e)))?;

        Ok(Some(PostedApplication {
            erp_transaction_id: body.internal_id,
            posted_at: Utc::now(),
            duplicate: true,
        }))
    }

    async fn test_connection(&self) -> Result<ConnectionProbe, ErpError> {
        let started = Instant::now();
        let token = self.ensure_token().await?;

        let response = self
            .client
            .get(format!(
                "{}/services/rest/record/v1/metadata-catalog",
                self.base_url
            ))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "netsuite probe"))?;

        Ok(ConnectionProbe {
            ok: response.status().is_success(),
            latency_ms: started.elapsed().as_millis() as u64,
            version: response
                .headers()
                .get("x-netsuite-version")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
        })
    }
}
