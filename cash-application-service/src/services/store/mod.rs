//! Persistence for transactions, match results, communications and the
//! append-only audit log.
//!
//! The store is a capability: the orchestrator and handlers talk to
//! `dyn AuditStore`, backed by Postgres in deployment and by an in-memory
//! implementation in tests and dependency-free local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::models::{
    AuditEvent, Checkpoint, CommunicationEvent, DeliveryStatus, InvoicePaymentMatch, MatchResult,
    NewAuditEvent, NewTransaction, PaymentTransaction, TransactionStatus, WorkflowStep,
};
use async_trait::async_trait;
use service_core::error::AppError;
use uuid::Uuid;

/// Result of registering an incoming transaction.
///
/// Registration is idempotent on `transaction_id`: a repeated submission
/// observes `created = false` together with the workflow id minted by the
/// first submission.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub created: bool,
    pub workflow_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub transaction_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub status: Option<String>,
    pub source_account_ref: Option<String>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert the transaction with status `pending` if it does not exist.
    async fn register_transaction(&self, new: &NewTransaction)
        -> Result<RegisterOutcome, AppError>;

    /// Atomically transition `pending -> processing`. Returns whether this
    /// caller won the claim.
    async fn claim_transaction(&self, transaction_id: &str) -> Result<bool, AppError>;

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    async fn get_transaction_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    async fn update_transaction_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> Result<(), AppError>;

    /// Atomic write of a match result and its per-invoice applications.
    /// Idempotent: a result already recorded for the transaction is kept.
    async fn record_match(
        &self,
        result: &MatchResult,
        matches: &[InvoicePaymentMatch],
    ) -> Result<(), AppError>;

    async fn get_match_result(
        &self,
        transaction_id: &str,
    ) -> Result<Option<(MatchResult, Vec<InvoicePaymentMatch>)>, AppError>;

    async fn record_communication(&self, event: &CommunicationEvent) -> Result<(), AppError>;

    async fn update_communication_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), AppError>;

    /// Append an audit event; returns the assigned monotonic sequence.
    async fn append_audit(&self, event: NewAuditEvent) -> Result<i64, AppError>;

    async fn query_audit(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AppError>;

    async fn query_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PaymentTransaction>, AppError>;

    async fn save_checkpoint(
        &self,
        transaction_id: &str,
        step: WorkflowStep,
        payload: serde_json::Value,
    ) -> Result<(), AppError>;

    async fn load_checkpoints(&self, transaction_id: &str) -> Result<Vec<Checkpoint>, AppError>;

    /// Transactions that have not reached a terminal state, used for
    /// startup reconciliation.
    async fn list_unfinished(&self) -> Result<Vec<PaymentTransaction>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
