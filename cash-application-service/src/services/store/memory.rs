//! In-memory store used by the test suite and for dependency-free local
//! runs when no database is configured.

use super::{AuditFilter, AuditStore, RegisterOutcome, TransactionFilter};
use crate::models::{
    AuditEvent, Checkpoint, CommunicationEvent, DeliveryStatus, InvoicePaymentMatch, MatchResult,
    NewAuditEvent, NewTransaction, PaymentTransaction, TransactionStatus, WorkflowStep,
};
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    transactions: HashMap<String, PaymentTransaction>,
    by_workflow: HashMap<Uuid, String>,
    match_results: HashMap<String, (MatchResult, Vec<InvoicePaymentMatch>)>,
    communications: HashMap<Uuid, CommunicationEvent>,
    audit: Vec<AuditEvent>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    next_seq: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn register_transaction(
        &self,
        new: &NewTransaction,
    ) -> Result<RegisterOutcome, AppError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.transactions.get(&new.transaction_id) {
            return Ok(RegisterOutcome {
                created: false,
                workflow_id: existing.workflow_id,
                status: existing.status.clone(),
            });
        }

        let workflow_id = Uuid::new_v4();
        let txn = PaymentTransaction::from_new(new, workflow_id);
        inner
            .by_workflow
            .insert(workflow_id, new.transaction_id.clone());
        inner.transactions.insert(new.transaction_id.clone(), txn);

        Ok(RegisterOutcome {
            created: true,
            workflow_id,
            status: TransactionStatus::Pending.as_str().to_string(),
        })
    }

    async fn claim_transaction(&self, transaction_id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.transactions.get_mut(transaction_id) {
            Some(txn) if txn.status == TransactionStatus::Pending.as_str() => {
                txn.status = TransactionStatus::Processing.as_str().to_string();
                txn.updated_utc = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Unknown transaction: {}",
                transaction_id
            ))),
        }
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner.transactions.get(transaction_id).cloned())
    }

    async fn get_transaction_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_workflow
            .get(&workflow_id)
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn update_transaction_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        let txn = inner.transactions.get_mut(transaction_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Unknown transaction: {}", transaction_id))
        })?;
        txn.status = status.as_str().to_string();
        txn.updated_utc = Utc::now();
        if status.is_terminal() {
            txn.processed_utc = Some(txn.updated_utc);
        }
        Ok(())
    }

    async fn record_match(
        &self,
        result: &MatchResult,
        matches: &[InvoicePaymentMatch],
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        // At most one match result per transaction; replays keep the first.
        inner
            .match_results
            .entry(result.transaction_id.clone())
            .or_insert_with(|| (result.clone(), matches.to_vec()));
        Ok(())
    }

    async fn get_match_result(
        &self,
        transaction_id: &str,
    ) -> Result<Option<(MatchResult, Vec<InvoicePaymentMatch>)>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner.match_results.get(transaction_id).cloned())
    }

    async fn record_communication(&self, event: &CommunicationEvent) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        inner.communications.insert(event.id, event.clone());
        Ok(())
    }

    async fn update_communication_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.communications.get_mut(&delivery_id) {
            event.delivery_status = status.as_str().to_string();
            event.error_message = error.map(|e| e.to_string());
            if status == DeliveryStatus::Sent {
                event.sent_utc = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn append_audit(&self, event: NewAuditEvent) -> Result<i64, AppError> {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.audit.push(AuditEvent {
            seq,
            ts: Utc::now(),
            event_type: event.event_type,
            source: event.source,
            correlation_id: event.correlation_id,
            transaction_id: event.transaction_id,
            data: event.data,
        });
        Ok(seq)
    }

    async fn query_audit(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AppError> {
        let inner = self.inner.lock().await;
        let limit = filter.limit.unwrap_or(100).max(0) as usize;
        let events = inner
            .audit
            .iter()
            .filter(|e| {
                filter
                    .transaction_id
                    .as_ref()
                    .map(|id| e.transaction_id.as_deref() == Some(id.as_str()))
                    .unwrap_or(true)
                    && filter
                        .event_type
                        .as_ref()
                        .map(|t| &e.event_type == t)
                        .unwrap_or(true)
            })
            .cloned()
            .take(limit)
            .collect();
        Ok(events)
    }

    async fn query_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        let inner = self.inner.lock().await;
        let limit = filter.limit.unwrap_or(100).max(0) as usize;
        let mut txns: Vec<PaymentTransaction> = inner
            .transactions
            .values()
            .filter(|t| {
                filter
                    .status
                    .as_ref()
                    .map(|s| &t.status == s)
                    .unwrap_or(true)
                    && filter
                        .source_account_ref
                        .as_ref()
                        .map(|a| &t.source_account_ref == a)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        txns.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        txns.truncate(limit);
        Ok(txns)
    }

    async fn save_checkpoint(
        &self,
        transaction_id: &str,
        step: WorkflowStep,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        let checkpoints = inner
            .checkpoints
            .entry(transaction_id.to_string())
            .or_default();
        if checkpoints.iter().any(|c| c.step == step.as_str()) {
            return Ok(());
        }
        checkpoints.push(Checkpoint {
            transaction_id: transaction_id.to_string(),
            step: step.as_str().to_string(),
            payload,
            created_utc: Utc::now(),
        });
        Ok(())
    }

    async fn load_checkpoints(&self, transaction_id: &str) -> Result<Vec<Checkpoint>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .checkpoints
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_unfinished(&self) -> Result<Vec<PaymentTransaction>, AppError> {
        let inner = self.inner.lock().await;
        let mut txns: Vec<PaymentTransaction> = inner
            .transactions
            .values()
            .filter(|t| !t.status().is_terminal())
            .cloned()
            .collect();
        txns.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(txns)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sample_transaction(id: &str) -> NewTransaction {
        NewTransaction {
            transaction_id: id.to_string(),
            source_account_ref: "ACC-1".to_string(),
            amount: Decimal::new(100000, 2),
            currency: "EUR".to_string(),
            value_date: None,
            raw_remittance_data: "INV-1".to_string(),
            customer_identifier: None,
            associated_document_uris: vec![],
            erp_system: "mock".to_string(),
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_on_transaction_id() {
        let store = MemoryStore::new();
        let first = store
            .register_transaction(&sample_transaction("TXN-1"))
            .await
            .unwrap();
        let second = store
            .register_transaction(&sample_transaction("TXN-1"))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.workflow_id, second.workflow_id);
    }

    #[tokio::test]
    async fn claim_succeeds_exactly_once() {
        let store = MemoryStore::new();
        store
            .register_transaction(&sample_transaction("TXN-2"))
            .await
            .unwrap();

        assert!(store.claim_transaction("TXN-2").await.unwrap());
        assert!(!store.claim_transaction("TXN-2").await.unwrap());
    }

    #[tokio::test]
    async fn audit_sequence_is_strictly_increasing() {
        let store = MemoryStore::new();
        let mut last = 0;
        for i in 0..5 {
            let seq = store
                .append_audit(NewAuditEvent::new(
                    "workflow.step",
                    "test",
                    &format!("corr-{}", i),
                    None,
                    serde_json::json!({}),
                ))
                .await
                .unwrap();
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test]
    async fn checkpoints_are_recorded_once_per_step() {
        let store = MemoryStore::new();
        store
            .register_transaction(&sample_transaction("TXN-3"))
            .await
            .unwrap();

        store
            .save_checkpoint("TXN-3", WorkflowStep::Claimed, serde_json::json!({}))
            .await
            .unwrap();
        store
            .save_checkpoint("TXN-3", WorkflowStep::Claimed, serde_json::json!({"x": 1}))
            .await
            .unwrap();

        let checkpoints = store.load_checkpoints("TXN-3").await.unwrap();
        assert_eq!(checkpoints.len(), 1);
    }
}
