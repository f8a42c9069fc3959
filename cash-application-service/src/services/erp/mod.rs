//! Uniform operations over heterogeneous ERPs.
//!
//! Concrete connectors (OAuth2 NetSuite, certificate SAP, API-key
//! QuickBooks, a configurable generic adapter and an in-memory mock) hang
//! behind the `ErpConnector` capability; the facade owns the registry,
//! bounded per-system concurrency, per-customer posting serialization,
//! retries and idempotency.

mod generic;
mod mock;
mod netsuite;
mod quickbooks;
mod sap;

pub use generic::GenericConnector;
pub use mock::MockErpConnector;
pub use netsuite::NetSuiteConnector;
pub use quickbooks::QuickBooksConnector;
pub use sap::SapConnector;

use crate::models::Invoice;
use crate::services::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_call, RetryClass, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ErpError {
    #[error("transient ERP failure: {0}")]
    Transient(String),

    #[error("permanent ERP failure: {0}")]
    Permanent(String),

    #[error("ERP authentication failure: {0}")]
    Auth(String),

    /// The ERP already holds an application for this transaction id.
    /// Callers treat this as success.
    #[error("application already posted as {erp_transaction_id}")]
    Duplicate { erp_transaction_id: String },

    #[error("concurrency conflict: {0}")]
    Conflict(String),

    #[error("unknown ERP system: {0}")]
    UnknownSystem(String),
}

impl RetryClass for ErpError {
    fn is_transient(&self) -> bool {
        matches!(self, ErpError::Transient(_) | ErpError::Conflict(_))
    }
}

impl From<ErpError> for AppError {
    fn from(err: ErpError) -> Self {
        match err {
            ErpError::UnknownSystem(s) => {
                AppError::BadRequest(anyhow::anyhow!("unknown ERP system: {}", s))
            }
            ErpError::Duplicate { erp_transaction_id } => AppError::Conflict(anyhow::anyhow!(
                "application already posted as {}",
                erp_transaction_id
            )),
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

/// Classify an HTTP response status into the ERP error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, context: &str) -> ErpError {
    if status.is_server_error() {
        ErpError::Transient(format!("{}: {}", context, status))
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        ErpError::Auth(format!("{}: {}", context, status))
    } else if status == reqwest::StatusCode::CONFLICT {
        ErpError::Conflict(format!("{}: {}", context, status))
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ErpError::Transient(format!("{}: {}", context, status))
    } else {
        ErpError::Permanent(format!("{}: {}", context, status))
    }
}

pub(crate) fn classify_reqwest(err: reqwest::Error, context: &str) -> ErpError {
    if err.is_timeout() || err.is_connect() {
        ErpError::Transient(format!("{}: {}", context, err))
    } else {
        ErpError::Permanent(format!("{}: {}", context, err))
    }
}

#[derive(Debug, Clone)]
pub struct FetchedInvoices {
    pub invoices: Vec<Invoice>,
    pub not_found: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationLine {
    pub invoice_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_applied: Decimal,
}

/// A cash application to post; `transaction_id` doubles as the
/// idempotency key towards the ERP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErpApplication {
    pub transaction_id: String,
    pub customer_id: String,
    pub erp_system: String,
    pub applications: Vec<ApplicationLine>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedApplication {
    pub erp_transaction_id: String,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProbe {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[async_trait]
pub trait ErpConnector: Send + Sync {
    fn system(&self) -> &str;

    /// Whether the ERP deduplicates on a caller-supplied idempotency key.
    /// When false the facade reads before posting.
    fn supports_idempotency_keys(&self) -> bool;

    async fn fetch_invoices(
        &self,
        invoice_ids: &[String],
        customer_id: Option<&str>,
    ) -> Result<FetchedInvoices, ErpError>;

    async fn post_application(
        &self,
        application: &ErpApplication,
    ) -> Result<PostedApplication, ErpError>;

    /// Look up a prior application carrying this transaction id in a
    /// reference field.
    async fn find_application(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PostedApplication>, ErpError>;

    async fn test_connection(&self) -> Result<ConnectionProbe, ErpError>;
}

pub struct ErpFacade {
    connectors: HashMap<String, Arc<dyn ErpConnector>>,
    customer_locks: DashMap<String, Arc<Mutex<()>>>,
    pool_limits: HashMap<String, Arc<Semaphore>>,
    fetch_retry: RetryConfig,
    post_retry: RetryConfig,
}

impl ErpFacade {
    pub fn new(connectors: Vec<Arc<dyn ErpConnector>>, max_connections_per_system: usize) -> Self {
        let mut registry = HashMap::new();
        let mut pool_limits = HashMap::new();
        for connector in connectors {
            let name = connector.system().to_string();
            pool_limits.insert(
                name.clone(),
                Arc::new(Semaphore::new(max_connections_per_system.max(1))),
            );
            registry.insert(name, connector);
        }

        Self {
            connectors: registry,
            customer_locks: DashMap::new(),
            pool_limits,
            // Transient failures retried up to 5 times, total backoff
            // stays under a minute.
            fetch_retry: RetryConfig {
                max_retries: 5,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(10),
                ..RetryConfig::default()
            },
            post_retry: RetryConfig {
                max_retries: 5,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(10),
                ..RetryConfig::default()
            },
        }
    }

    pub fn systems(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }

    fn connector(&self, erp_system: &str) -> Result<&Arc<dyn ErpConnector>, ErpError> {
        self.connectors
            .get(erp_system)
            .ok_or_else(|| ErpError::UnknownSystem(erp_system.to_string()))
    }

    async fn acquire_slot(
        &self,
        erp_system: &str,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, ErpError> {
        let semaphore = self
            .pool_limits
            .get(erp_system)
            .ok_or_else(|| ErpError::UnknownSystem(erp_system.to_string()))?;
        semaphore
            .acquire()
            .await
            .map_err(|_| ErpError::Transient("connection pool closed".to_string()))
    }

    #[instrument(skip(self, invoice_ids), fields(erp_system = %erp_system, count = invoice_ids.len()))]
    pub async fn fetch_invoices(
        &self,
        erp_system: &str,
        invoice_ids: &[String],
        customer_id: Option<&str>,
    ) -> Result<FetchedInvoices, ErpError> {
        let connector = self.connector(erp_system)?;
        let _slot = self.acquire_slot(erp_system).await?;

        let result = retry_call(&self.fetch_retry, "erp_fetch_invoices", || async {
            connector.fetch_invoices(invoice_ids, customer_id).await
        })
        .await;

        metrics::record_erp_call(erp_system, "fetch_invoices", result.is_ok());
        let fetched = result?;
        info!(
            found = fetched.invoices.len(),
            not_found = fetched.not_found.len(),
            "Invoices fetched"
        );
        Ok(fetched)
    }

    /// Post a cash application. Safe to retry: postings for the same
    /// customer are serialized, and a duplicate reported by the ERP is
    /// returned as the prior posting.
    #[instrument(skip(self, application), fields(erp_system = %application.erp_system, transaction_id = %application.transaction_id))]
    pub async fn post_application(
        &self,
        application: &ErpApplication,
    ) -> Result<PostedApplication, ErpError> {
        let connector = self.connector(&application.erp_system)?;

        let lock = self
            .customer_locks
            .entry(application.customer_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _customer_guard = lock.lock().await;
        let _slot = self.acquire_slot(&application.erp_system).await?;

        if !connector.supports_idempotency_keys() {
            if let Some(existing) = connector
                .find_application(&application.transaction_id)
                .await?
            {
                info!(
                    erp_transaction_id = %existing.erp_transaction_id,
                    "Prior application found, skipping post"
                );
                metrics::record_erp_call(&application.erp_system, "post_application", true);
                return Ok(PostedApplication {
                    duplicate: true,
                    ..existing
                });
            }
        }

        let result = retry_call(&self.post_retry, "erp_post_application", || async {
            connector.post_application(application).await
        })
        .await;

        let posted = match result {
            Ok(posted) => posted,
            Err(ErpError::Duplicate { erp_transaction_id }) => {
                warn!(
                    erp_transaction_id = %erp_transaction_id,
                    "ERP reported duplicate application, treating as success"
                );
                PostedApplication {
                    erp_transaction_id,
                    posted_at: Utc::now(),
                    duplicate: true,
                }
            }
            Err(e) => {
                metrics::record_erp_call(&application.erp_system, "post_application", false);
                return Err(e);
            }
        };

        metrics::record_erp_call(&application.erp_system, "post_application", true);
        info!(
            erp_transaction_id = %posted.erp_transaction_id,
            duplicate = posted.duplicate,
            "Application posted"
        );
        Ok(posted)
    }

    #[instrument(skip(self), fields(erp_system = %erp_system))]
    pub async fn test_connection(&self, erp_system: &str) -> Result<ConnectionProbe, ErpError> {
        let connector = self.connector(erp_system)?;
        let probe = connector.test_connection().await;
        metrics::record_erp_call(erp_system, "test_connection", probe.is_ok());
        probe
    }
}
