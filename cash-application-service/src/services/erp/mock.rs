//! In-memory connector for tests and dependency-free local runs.

use super::{
    ConnectionProbe, ErpApplication, ErpConnector, ErpError, FetchedInvoices, PostedApplication,
};
use crate::models::Invoice;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockErpConnector {
    name: String,
    invoices: Mutex<HashMap<String, Invoice>>,
    postings: Mutex<Vec<ErpApplication>>,
    posted_by_txn: Mutex<HashMap<String, PostedApplication>>,
    latency_ms: AtomicU64,
    fail_fetches: AtomicU32,
    next_posting_id: AtomicU64,
}

impl MockErpConnector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn insert_invoice(&self, invoice: Invoice) {
        self.invoices
            .lock()
            .expect("mock invoices lock")
            .insert(invoice.invoice_id.clone(), invoice);
    }

    /// Artificial delay applied to every call, for cancellation and
    /// ordering tests.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `n` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn postings(&self) -> Vec<ErpApplication> {
        self.postings.lock().expect("mock postings lock").clone()
    }

    pub fn posted_count(&self) -> usize {
        self.postings.lock().expect("mock postings lock").len()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl ErpConnector for MockErpConnector {
    fn system(&self) -> &str {
        &self.name
    }

    fn supports_idempotency_keys(&self) -> bool {
        true
    }

    async fn fetch_invoices(
        &self,
        invoice_ids: &[String],
        _customer_id: Option<&str>,
    ) -> Result<FetchedInvoices, ErpError> {
        self.simulate_latency().await;

        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(ErpError::Transient("injected fetch failure".to_string()));
        }

        let known = self.invoices.lock().expect("mock invoices lock");
        let mut invoices = Vec::new();
        let mut not_found = Vec::new();
        for id in invoice_ids {
            match known.get(id) {
                Some(invoice) => invoices.push(Invoice {
                    fetched_utc: Utc::now(),
                    ..invoice.clone()
                }),
                None => not_found.push(id.clone()),
            }
        }

        Ok(FetchedInvoices {
            invoices,
            not_found,
        })
    }

    async fn post_application(
        &self,
        application: &ErpApplication,
    ) -> Result<PostedApplication, ErpError> {
        self.simulate_latency().await;

        {
            let posted = self.posted_by_txn.lock().expect("mock posted lock");
            if let Some(existing) = posted.get(&application.transaction_id) {
                return Err(ErpError::Duplicate {
                    erp_transaction_id: existing.erp_transaction_id.clone(),
                });
            }
        }

        let id = self.next_posting_id.fetch_add(1, Ordering::SeqCst) + 1;
        let posted = PostedApplication {
            erp_transaction_id: format!("{}-pay-{}", self.name, id),
            posted_at: Utc::now(),
            duplicate: false,
        };

        // Reduce balances the way a real ERP would.
        {
            let mut known = self.invoices.lock().expect("mock invoices lock");
            for line in &application.applications {
                if let Some(invoice) = known.get_mut(&line.invoice_id) {
                    invoice.amount_due -= line.amount_applied;
                    if invoice.amount_due <= rust_decimal::Decimal::ZERO {
                        invoice.status = "closed".to_string();
                    }
                }
            }
        }

        self.postings
            .lock()
            .expect("mock postings lock")
            .push(application.clone());
        self.posted_by_txn
            .lock()
            .expect("mock posted lock")
            .insert(application.transaction_id.clone(), posted.clone());

        Ok(posted)
    }

    async fn find_application(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PostedApplication>, ErpError> {
        self.simulate_latency().await;
        Ok(self
            .posted_by_txn
            .lock()
            .expect("mock posted lock")
            .get(transaction_id)
            .cloned())
    }

    async fn test_connection(&self) -> Result<ConnectionProbe, ErpError> {
        Ok(ConnectionProbe {
            ok: true,
            latency_ms: self.latency_ms.load(Ordering::SeqCst),
            version: Some("mock-1.0".to_string()),
        })
    }
}
