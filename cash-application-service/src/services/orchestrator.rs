//! Durable per-transaction workflow.
//!
//! Sequences Extract -> Fetch -> Match -> Post -> Communicate -> Finalize,
//! persisting every step outcome before the next step starts. Workflows
//! for the same source account run in submission order through a per-key
//! queue with a single consumer; a global semaphore bounds parallelism
//! across accounts.

use crate::models::{
    Checkpoint, CommunicationKind, InvoicePaymentMatch, MatchResult, MatchStatus, NewAuditEvent,
    NewTransaction, PaymentTransaction, TransactionStatus, WorkflowStep,
};
use crate::services::communicator::{Communicator, DispatchRequest};
use crate::services::erp::{ApplicationLine, ErpApplication, ErpFacade, PostedApplication};
use crate::services::extractor::{
    ExtractError, ExtractRequest, ExtractResult, ExtractionTier, Extractor, TierPreference,
};
use crate::services::matcher::{
    self, MatchOutcome, MatchPolicy, NextAction, PaymentView, ALGORITHM_VERSION,
};
use crate::services::metrics;
use crate::services::store::AuditStore;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const SOURCE: &str = "orchestrator";

/// What a saturated engine does with new submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Queue the workflow; it waits for a permit.
    Block,
    /// Refuse the submission with a Busy error.
    Reject,
}

impl BusyPolicy {
    pub fn from_str(s: &str) -> Self {
        match s {
            "reject" => Self::Reject,
            _ => Self::Block,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_transactions: usize,
    pub workflow_timeout: Duration,
    pub extract_timeout: Duration,
    pub fetch_timeout: Duration,
    pub post_timeout: Duration,
    pub communicate_timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub enable_autonomous_erp_updates: bool,
    pub notify_in_read_only: bool,
    pub send_confirmations: bool,
    pub ar_team_recipient: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transactions: 10,
            workflow_timeout: Duration::from_secs(600),
            extract_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(15),
            post_timeout: Duration::from_secs(30),
            communicate_timeout: Duration::from_secs(20),
            busy_policy: BusyPolicy::Block,
            enable_autonomous_erp_updates: true,
            notify_in_read_only: true,
            send_confirmations: false,
            ar_team_recipient: "ar-team".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub workflow_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub transaction_id: String,
    pub state: TransactionStatus,
    pub result: Option<(MatchResult, Vec<InvoicePaymentMatch>)>,
    pub error: Option<serde_json::Value>,
}

struct QueuedJob {
    transaction: PaymentTransaction,
    cancel: CancellationToken,
}

pub struct WorkflowEngine {
    store: Arc<dyn AuditStore>,
    extractor: Arc<Extractor>,
    erp: Arc<ErpFacade>,
    communicator: Arc<Communicator>,
    policy: MatchPolicy,
    settings: OrchestratorSettings,
    default_tier: TierPreference,
    semaphore: Arc<Semaphore>,
    account_queues: DashMap<String, mpsc::UnboundedSender<QueuedJob>>,
    handles: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn AuditStore>,
        extractor: Arc<Extractor>,
        erp: Arc<ErpFacade>,
        communicator: Arc<Communicator>,
        policy: MatchPolicy,
        settings: OrchestratorSettings,
        default_tier: TierPreference,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_transactions.max(1)));
        Arc::new(Self {
            store,
            extractor,
            erp,
            communicator,
            policy,
            settings,
            default_tier,
            semaphore,
            account_queues: DashMap::new(),
            handles: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Submit a transaction. Idempotent on `transaction_id`: replays get
    /// the workflow id minted by the first submission.
    #[instrument(skip(self, new), fields(transaction_id = %new.transaction_id, account = %new.source_account_ref))]
    pub async fn start_workflow(
        self: &Arc<Self>,
        new: NewTransaction,
    ) -> Result<StartOutcome, AppError> {
        if self.settings.busy_policy == BusyPolicy::Reject
            && self.semaphore.available_permits() == 0
        {
            metrics::record_error("busy");
            return Err(AppError::ServiceUnavailable(
                "workflow capacity exhausted".to_string(),
            ));
        }

        let outcome = self.store.register_transaction(&new).await?;
        if !outcome.created {
            info!(workflow_id = %outcome.workflow_id, "Duplicate submission, returning existing workflow");
            return Ok(StartOutcome {
                workflow_id: outcome.workflow_id,
                created: false,
            });
        }

        let transaction = PaymentTransaction::from_new(&new, outcome.workflow_id);
        self.store
            .append_audit(NewAuditEvent::new(
                "workflow.started",
                SOURCE,
                &outcome.workflow_id.to_string(),
                Some(&new.transaction_id),
                json!({
                    "source_account_ref": new.source_account_ref,
                    "amount": new.amount.to_string(),
                    "currency": new.currency,
                }),
            ))
            .await?;

        let cancel = CancellationToken::new();
        self.handles.insert(outcome.workflow_id, cancel.clone());
        self.enqueue(QueuedJob {
            transaction,
            cancel,
        });

        Ok(StartOutcome {
            workflow_id: outcome.workflow_id,
            created: true,
        })
    }

    pub async fn get_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, AppError> {
        let txn = self
            .store
            .get_transaction_by_workflow(workflow_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("unknown workflow: {}", workflow_id))
            })?;

        let result = self.store.get_match_result(&txn.transaction_id).await?;
        let error = if txn.status() == TransactionStatus::Error {
            self.store
                .query_audit(crate::services::store::AuditFilter {
                    transaction_id: Some(txn.transaction_id.clone()),
                    event_type: Some("workflow.error".to_string()),
                    limit: Some(100),
                })
                .await?
                .into_iter()
                .last()
                .map(|e| e.data)
        } else {
            None
        };

        let state = txn.status();
        Ok(WorkflowStatus {
            workflow_id,
            transaction_id: txn.transaction_id,
            state,
            result,
            error,
        })
    }

    /// Request cooperative cancellation. The in-flight external call
    /// completes; the workflow stops at the next step boundary.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), AppError> {
        let txn = self
            .store
            .get_transaction_by_workflow(workflow_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("unknown workflow: {}", workflow_id))
            })?;

        if txn.status().is_terminal() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "workflow already terminal: {}",
                txn.status.clone()
            )));
        }

        let token = self.handles.get(&workflow_id).map(|entry| entry.clone());
        match token {
            Some(token) => {
                token.cancel();
                self.store
                    .append_audit(NewAuditEvent::new(
                        "workflow.cancel_requested",
                        SOURCE,
                        &workflow_id.to_string(),
                        Some(&txn.transaction_id),
                        json!({}),
                    ))
                    .await?;
                Ok(())
            }
            None => Err(AppError::Conflict(anyhow::anyhow!(
                "workflow is not running in this instance"
            ))),
        }
    }

    /// Re-enqueue transactions left non-terminal by a previous instance.
    /// Those checkpointed past the Post step finalize without re-running.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, AppError> {
        let unfinished = self.store.list_unfinished().await?;
        let count = unfinished.len();
        for transaction in unfinished {
            let cancel = CancellationToken::new();
            self.handles.insert(transaction.workflow_id, cancel.clone());
            info!(
                transaction_id = %transaction.transaction_id,
                status = %transaction.status,
                "Recovering in-flight workflow"
            );
            self.enqueue(QueuedJob {
                transaction,
                cancel,
            });
        }
        if count > 0 {
            info!(count = count, "Startup recovery enqueued workflows");
        }
        Ok(count)
    }

    /// Stop accepting queued work. Running workflows finish their current
    /// step sequence.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn enqueue(self: &Arc<Self>, job: QueuedJob) {
        let account = job.transaction.source_account_ref.clone();
        let sender = self
            .account_queues
            .entry(account)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.consume_account_queue(rx).await;
                });
                tx
            })
            .clone();

        if sender.send(job).is_err() {
            error!("Account queue consumer is gone; workflow will be picked up by recovery");
        }
    }

    async fn consume_account_queue(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    let permit = match self.semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    self.run_workflow(job).await;
                    drop(permit);
                }
            }
        }
    }

    #[instrument(skip(self, job), fields(transaction_id = %job.transaction.transaction_id, workflow_id = %job.transaction.workflow_id))]
    async fn run_workflow(&self, job: QueuedJob) {
        let started = Instant::now();
        let txn = &job.transaction;
        let workflow_id = txn.workflow_id;
        let correlation = workflow_id.to_string();

        let checkpoints = match self.store.load_checkpoints(&txn.transaction_id).await {
            Ok(list) => index_checkpoints(list),
            Err(e) => {
                error!(error = %e, "Failed to load checkpoints");
                self.fail(txn, &correlation, "StoreError", &e.to_string(), started)
                    .await;
                return;
            }
        };

        if checkpoints.contains_key(&WorkflowStep::Finalized) {
            self.handles.remove(&workflow_id);
            return;
        }

        // Claim: pending -> processing, exactly once.
        if !checkpoints.contains_key(&WorkflowStep::Claimed) {
            match self.store.claim_transaction(&txn.transaction_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Recovery replays land here with the row already in
                    // processing; a terminal row means nothing to do.
                    match self.store.get_transaction(&txn.transaction_id).await {
                        Ok(Some(current)) if current.status().is_terminal() => {
                            self.handles.remove(&workflow_id);
                            return;
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    self.fail(txn, &correlation, "StoreError", &e.to_string(), started)
                        .await;
                    return;
                }
            }
            if self
                .checkpoint(txn, WorkflowStep::Claimed, json!({}), &correlation)
                .await
                .is_err()
            {
                return;
            }
        }

        if self.aborted(&job, started, &correlation).await {
            return;
        }

        // Extract.
        let extract = match checkpoints.get(&WorkflowStep::Extracted) {
            Some(payload) => serde_json::from_value::<ExtractResult>(payload.clone()).ok(),
            None => None,
        };
        let extract = match extract {
            Some(result) => result,
            None => {
                let result = self.run_extract(txn).await;
                let payload = serde_json::to_value(&result).unwrap_or_default();
                if self
                    .checkpoint(txn, WorkflowStep::Extracted, payload, &correlation)
                    .await
                    .is_err()
                {
                    return;
                }
                result
            }
        };

        if self.aborted(&job, started, &correlation).await {
            return;
        }

        // Fetch invoices for the extracted candidates.
        let fetched = match checkpoints.get(&WorkflowStep::Fetched) {
            Some(payload) => serde_json::from_value::<FetchedPayload>(payload.clone()).ok(),
            None => None,
        };
        let fetched = match fetched {
            Some(payload) => payload,
            None => {
                let payload = if extract.invoice_ids.is_empty() {
                    FetchedPayload::default()
                } else {
                    match tokio::time::timeout(
                        self.settings.fetch_timeout,
                        self.erp.fetch_invoices(
                            &txn.erp_system,
                            &extract.invoice_ids,
                            txn.customer_identifier.as_deref(),
                        ),
                    )
                    .await
                    {
                        Ok(Ok(result)) => FetchedPayload {
                            invoices: result.invoices,
                            not_found: result.not_found,
                        },
                        Ok(Err(e)) => {
                            self.alert_and_fail(txn, &correlation, "ERPError", &e.to_string(), started)
                                .await;
                            return;
                        }
                        Err(_) => {
                            self.alert_and_fail(
                                txn,
                                &correlation,
                                "ERPError",
                                "invoice fetch timed out",
                                started,
                            )
                            .await;
                            return;
                        }
                    }
                };
                let value = serde_json::to_value(&payload).unwrap_or_default();
                if self
                    .checkpoint(txn, WorkflowStep::Fetched, value, &correlation)
                    .await
                    .is_err()
                {
                    return;
                }
                payload
            }
        };

        if self.aborted(&job, started, &correlation).await {
            return;
        }

        // Match: pure, in-process.
        let matched = match checkpoints.get(&WorkflowStep::Matched) {
            Some(payload) => serde_json::from_value::<MatchedPayload>(payload.clone()).ok(),
            None => None,
        };
        let matched = match matched {
            Some(payload) => payload,
            None => {
                let payment = PaymentView {
                    transaction_id: txn.transaction_id.clone(),
                    amount: txn.amount,
                    currency: txn.currency.clone(),
                    customer_identifier: txn.customer_identifier.clone(),
                };
                let outcome = matcher::match_payment(
                    &payment,
                    &extract.invoice_ids,
                    &fetched.invoices,
                    &self.policy,
                );
                let payload = self
                    .persist_match(txn, &outcome, started, &correlation)
                    .await;
                let Some(payload) = payload else { return };
                payload
            }
        };

        if self.aborted(&job, started, &correlation).await {
            return;
        }

        let status = MatchStatus::from_str(&matched.result.status);
        let wants_post = !matched.matches.is_empty()
            && !matched.result.requires_human_review
            && matches!(
                status,
                MatchStatus::Matched | MatchStatus::PartiallyMatched
            );
        let autonomous = self.settings.enable_autonomous_erp_updates;
        let read_only_hold = wants_post && !autonomous;

        // Post.
        let mut posted: Option<PostedApplication> = checkpoints
            .get(&WorkflowStep::Posted)
            .and_then(|p| serde_json::from_value(p.clone()).ok());
        if wants_post && autonomous && posted.is_none() {
            let application = build_application(txn, &fetched, &matched.matches);
            match tokio::time::timeout(
                self.settings.post_timeout,
                self.erp.post_application(&application),
            )
            .await
            {
                Ok(Ok(result)) => {
                    self.store
                        .append_audit(NewAuditEvent::new(
                            "erp.posted",
                            SOURCE,
                            &correlation,
                            Some(&txn.transaction_id),
                            json!({
                                "erp_transaction_id": result.erp_transaction_id,
                                "duplicate": result.duplicate,
                                "total_amount": application.total_amount.to_string(),
                            }),
                        ))
                        .await
                        .ok();
                    let payload = serde_json::to_value(&result).unwrap_or_default();
                    if self
                        .checkpoint(txn, WorkflowStep::Posted, payload, &correlation)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    posted = Some(result);
                }
                Ok(Err(e)) => {
                    self.alert_and_fail(txn, &correlation, "ERPError", &e.to_string(), started)
                        .await;
                    return;
                }
                Err(_) => {
                    self.alert_and_fail(
                        txn,
                        &correlation,
                        "ERPError",
                        "application post timed out",
                        started,
                    )
                    .await;
                    return;
                }
            }
        }

        // Communicate. Failures are recorded but never fail the workflow.
        if !checkpoints.contains_key(&WorkflowStep::Communicated) {
            let action = NextAction::from_str(&matched.next_action);
            self.communicate(txn, &matched, action, read_only_hold, posted.as_ref())
                .await;
            if self
                .checkpoint(txn, WorkflowStep::Communicated, json!({}), &correlation)
                .await
                .is_err()
            {
                return;
            }
        }

        // Finalize.
        let terminal = if status == MatchStatus::Error {
            TransactionStatus::Error
        } else if matched.result.requires_human_review || read_only_hold {
            TransactionStatus::RequiresReview
        } else {
            match status {
                MatchStatus::Matched => TransactionStatus::Matched,
                MatchStatus::PartiallyMatched => TransactionStatus::PartiallyMatched,
                MatchStatus::Unmatched => TransactionStatus::Unmatched,
                MatchStatus::RequiresReview => TransactionStatus::RequiresReview,
                MatchStatus::Error => TransactionStatus::Error,
            }
        };
        self.finalize(txn, terminal, &correlation, started).await;
    }

    async fn run_extract(&self, txn: &PaymentTransaction) -> ExtractResult {
        let request = ExtractRequest {
            document_uris: txn.associated_document_uris.clone(),
            remittance_text: txn.raw_remittance_data.clone(),
            client_id: txn.customer_identifier.clone(),
            tier_preference: self.default_tier,
            confidence_threshold: None,
        };

        match tokio::time::timeout(self.settings.extract_timeout, self.extractor.extract(&request))
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(ExtractError::Unavailable { message, partial })) => {
                // The matcher still runs with whatever the earlier tiers
                // produced.
                warn!(error = %message, "Extractor unavailable, continuing with partial result");
                metrics::record_error("extractor_unavailable");
                partial.unwrap_or_else(empty_extract)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Extraction failed, continuing with empty candidate set");
                empty_extract()
            }
            Err(_) => {
                warn!("Extraction timed out, continuing with empty candidate set");
                metrics::record_error("extractor_timeout");
                empty_extract()
            }
        }
    }

    async fn persist_match(
        &self,
        txn: &PaymentTransaction,
        outcome: &MatchOutcome,
        started: Instant,
        correlation: &str,
    ) -> Option<MatchedPayload> {
        let result_id = Uuid::new_v4();
        let result = MatchResult {
            id: result_id,
            transaction_id: txn.transaction_id.clone(),
            status: outcome.status.as_str().to_string(),
            unapplied_amount: outcome.unapplied_amount,
            discrepancy_code: outcome.discrepancy.as_str().to_string(),
            confidence: outcome.confidence,
            algorithm_version: ALGORITHM_VERSION.to_string(),
            log_entry: outcome.log_entry.clone(),
            requires_human_review: outcome.requires_human_review,
            processing_time_ms: started.elapsed().as_millis() as i64,
            created_utc: Utc::now(),
        };
        let matches: Vec<InvoicePaymentMatch> = outcome
            .allocations
            .iter()
            .map(|a| InvoicePaymentMatch {
                id: Uuid::new_v4(),
                match_result_id: result_id,
                invoice_id: a.invoice_id.clone(),
                erp_system: a.erp_system.clone(),
                amount_applied: a.amount_applied,
            })
            .collect();

        if let Err(e) = self.store.record_match(&result, &matches).await {
            self.fail(txn, correlation, "StoreError", &e.to_string(), started)
                .await;
            return None;
        }
        metrics::record_match_outcome(&result.status, &result.discrepancy_code);
        if outcome.status == MatchStatus::Error {
            self.store
                .append_audit(NewAuditEvent::new(
                    "workflow.error",
                    SOURCE,
                    correlation,
                    Some(&txn.transaction_id),
                    json!({"kind": "InvariantViolation", "message": result.log_entry}),
                ))
                .await
                .ok();
        }
        self.store
            .append_audit(NewAuditEvent::new(
                "match.recorded",
                SOURCE,
                correlation,
                Some(&txn.transaction_id),
                json!({
                    "status": result.status,
                    "discrepancy_code": result.discrepancy_code,
                    "confidence": result.confidence,
                    "unapplied_amount": result.unapplied_amount.to_string(),
                    "allocations": matches.len(),
                }),
            ))
            .await
            .ok();

        let payload = MatchedPayload {
            result,
            matches,
            next_action: outcome.next_action.as_str().to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap_or_default();
        if self
            .checkpoint(txn, WorkflowStep::Matched, value, correlation)
            .await
            .is_err()
        {
            return None;
        }
        Some(payload)
    }

    async fn communicate(
        &self,
        txn: &PaymentTransaction,
        matched: &MatchedPayload,
        action: NextAction,
        read_only_hold: bool,
        posted: Option<&PostedApplication>,
    ) {
        if read_only_hold && !self.settings.notify_in_read_only {
            return;
        }

        let detail = if read_only_hold {
            format!(
                "autonomous posting disabled; proposed allocation held for review: {}",
                matched.result.log_entry
            )
        } else {
            matched.result.log_entry.clone()
        };
        let data = json!({
            "transaction_id": txn.transaction_id,
            "amount": txn.amount.to_string(),
            "currency": txn.currency,
            "status": matched.result.status,
            "detail": detail,
            "erp_transaction_id": posted.map(|p| p.erp_transaction_id.clone()),
        });

        let customer_recipient = format!(
            "customer:{}",
            txn.customer_identifier
                .as_deref()
                .unwrap_or(&txn.source_account_ref)
        );

        let request = if read_only_hold || matched.result.requires_human_review {
            Some(DispatchRequest {
                kind: CommunicationKind::InternalAlert,
                recipient: self.settings.ar_team_recipient.clone(),
                template_name: "internal_alert".to_string(),
                data,
                transaction_id: Some(txn.transaction_id.clone()),
                priority: None,
                scheduled_at: None,
            })
        } else {
            match action {
                NextAction::PostAndConfirm if self.settings.send_confirmations => {
                    Some(DispatchRequest {
                        kind: CommunicationKind::Confirmation,
                        recipient: customer_recipient,
                        template_name: "payment_confirmation".to_string(),
                        data,
                        transaction_id: Some(txn.transaction_id.clone()),
                        priority: None,
                        scheduled_at: None,
                    })
                }
                NextAction::PostAndConfirm | NextAction::PostOnly => None,
                NextAction::PostAndClarify => Some(DispatchRequest {
                    kind: CommunicationKind::CustomerClarification,
                    recipient: customer_recipient,
                    template_name: "customer_clarification".to_string(),
                    data,
                    transaction_id: Some(txn.transaction_id.clone()),
                    priority: None,
                    scheduled_at: None,
                }),
                NextAction::PostAndAlert | NextAction::AlertOnly => Some(DispatchRequest {
                    kind: CommunicationKind::InternalAlert,
                    recipient: self.settings.ar_team_recipient.clone(),
                    template_name: "internal_alert".to_string(),
                    data,
                    transaction_id: Some(txn.transaction_id.clone()),
                    priority: None,
                    scheduled_at: None,
                }),
            }
        };

        let Some(request) = request else { return };
        match tokio::time::timeout(
            self.settings.communicate_timeout,
            self.communicator.dispatch(request),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                info!(delivery_id = %receipt.delivery_id, status = ?receipt.status, "Communication dispatched");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Communication dispatch rejected");
                metrics::record_error("communication_rejected");
            }
            Err(_) => {
                warn!("Communication dispatch timed out");
                metrics::record_error("communication_timeout");
            }
        }
    }

    /// Check cancellation and the workflow deadline at a step boundary.
    async fn aborted(&self, job: &QueuedJob, started: Instant, correlation: &str) -> bool {
        let txn = &job.transaction;
        if job.cancel.is_cancelled() {
            self.store
                .append_audit(NewAuditEvent::new(
                    "workflow.error",
                    SOURCE,
                    correlation,
                    Some(&txn.transaction_id),
                    json!({"kind": "Cancelled", "message": "workflow cancelled"}),
                ))
                .await
                .ok();
            self.finalize(txn, TransactionStatus::Error, correlation, started)
                .await;
            return true;
        }
        if started.elapsed() > self.settings.workflow_timeout {
            self.store
                .append_audit(NewAuditEvent::new(
                    "workflow.error",
                    SOURCE,
                    correlation,
                    Some(&txn.transaction_id),
                    json!({"kind": "Cancelled", "message": "workflow timeout exceeded"}),
                ))
                .await
                .ok();
            self.finalize(txn, TransactionStatus::Error, correlation, started)
                .await;
            return true;
        }
        false
    }

    async fn checkpoint(
        &self,
        txn: &PaymentTransaction,
        step: WorkflowStep,
        payload: serde_json::Value,
        correlation: &str,
    ) -> Result<(), ()> {
        if let Err(e) = self
            .store
            .save_checkpoint(&txn.transaction_id, step, payload)
            .await
        {
            error!(step = step.as_str(), error = %e, "Failed to persist checkpoint");
            self.fail(txn, correlation, "StoreError", &e.to_string(), Instant::now())
                .await;
            return Err(());
        }
        self.store
            .append_audit(NewAuditEvent::new(
                "workflow.step",
                SOURCE,
                correlation,
                Some(&txn.transaction_id),
                json!({"step": step.as_str()}),
            ))
            .await
            .ok();
        Ok(())
    }

    async fn alert_and_fail(
        &self,
        txn: &PaymentTransaction,
        correlation: &str,
        kind: &str,
        message: &str,
        started: Instant,
    ) {
        let dispatch = DispatchRequest {
            kind: CommunicationKind::InternalAlert,
            recipient: self.settings.ar_team_recipient.clone(),
            template_name: "internal_alert".to_string(),
            data: json!({
                "transaction_id": txn.transaction_id,
                "amount": txn.amount.to_string(),
                "currency": txn.currency,
                "status": "error",
                "detail": format!("{}: {}", kind, message),
            }),
            transaction_id: Some(txn.transaction_id.clone()),
            priority: Some("high".to_string()),
            scheduled_at: None,
        };
        if let Err(e) = self.communicator.dispatch(dispatch).await {
            warn!(error = %e, "Failed to dispatch failure alert");
        }
        self.fail(txn, correlation, kind, message, started).await;
    }

    async fn fail(
        &self,
        txn: &PaymentTransaction,
        correlation: &str,
        kind: &str,
        message: &str,
        started: Instant,
    ) {
        error!(kind = kind, message = message, "Workflow failed");
        metrics::record_error(kind);
        self.store
            .append_audit(NewAuditEvent::new(
                "workflow.error",
                SOURCE,
                correlation,
                Some(&txn.transaction_id),
                json!({"kind": kind, "message": message}),
            ))
            .await
            .ok();
        self.finalize(txn, TransactionStatus::Error, correlation, started)
            .await;
    }

    async fn finalize(
        &self,
        txn: &PaymentTransaction,
        terminal: TransactionStatus,
        correlation: &str,
        started: Instant,
    ) {
        if let Err(e) = self
            .store
            .update_transaction_status(&txn.transaction_id, terminal)
            .await
        {
            error!(error = %e, "Failed to persist terminal status");
        }
        self.store
            .save_checkpoint(&txn.transaction_id, WorkflowStep::Finalized, json!({}))
            .await
            .ok();
        self.store
            .append_audit(NewAuditEvent::new(
                "workflow.finalized",
                SOURCE,
                correlation,
                Some(&txn.transaction_id),
                json!({"status": terminal.as_str()}),
            ))
            .await
            .ok();
        metrics::record_workflow_outcome(terminal.as_str(), started.elapsed().as_secs_f64());
        self.handles.remove(&txn.workflow_id);
        info!(status = terminal.as_str(), "Workflow finalized");
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct FetchedPayload {
    invoices: Vec<crate::models::Invoice>,
    not_found: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct MatchedPayload {
    result: MatchResult,
    matches: Vec<InvoicePaymentMatch>,
    next_action: String,
}

fn index_checkpoints(list: Vec<Checkpoint>) -> HashMap<WorkflowStep, serde_json::Value> {
    list.into_iter()
        .filter_map(|c| c.step().map(|step| (step, c.payload)))
        .collect()
}

fn empty_extract() -> ExtractResult {
    ExtractResult {
        invoice_ids: Vec::new(),
        confidence: 0.0,
        tier_used: ExtractionTier::Pattern,
        cost_estimate: Decimal::ZERO,
        processing_time_ms: 0,
        per_document: Vec::new(),
    }
}

fn build_application(
    txn: &PaymentTransaction,
    fetched: &FetchedPayload,
    matches: &[InvoicePaymentMatch],
) -> ErpApplication {
    let total: Decimal = matches.iter().map(|m| m.amount_applied).sum();
    let customer_id = matches
        .first()
        .and_then(|m| {
            fetched
                .invoices
                .iter()
                .find(|inv| inv.invoice_id == m.invoice_id)
                .map(|inv| inv.customer_id.clone())
        })
        .or_else(|| txn.customer_identifier.clone())
        .unwrap_or_else(|| txn.source_account_ref.clone());

    ErpApplication {
        transaction_id: txn.transaction_id.clone(),
        customer_id,
        erp_system: txn.erp_system.clone(),
        applications: matches
            .iter()
            .map(|m| ApplicationLine {
                invoice_id: m.invoice_id.clone(),
                amount_applied: m.amount_applied,
            })
            .collect(),
        total_amount: total,
        currency: txn.currency.clone(),
    }
}
