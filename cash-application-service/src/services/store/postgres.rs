//! Postgres-backed store.

use super::{AuditFilter, AuditStore, RegisterOutcome, TransactionFilter};
use crate::models::{
    AuditEvent, Checkpoint, CommunicationEvent, DeliveryStatus, InvoicePaymentMatch, MatchResult,
    NewAuditEvent, NewTransaction, PaymentTransaction, TransactionStatus, WorkflowStep,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "cash-application-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

const TXN_COLUMNS: &str = "transaction_id, workflow_id, source_account_ref, amount, currency, value_date, raw_remittance_data, customer_identifier, associated_document_uris, erp_system, status, created_utc, updated_utc, processed_utc";

#[async_trait]
impl AuditStore for PostgresStore {
    #[instrument(skip(self, new), fields(transaction_id = %new.transaction_id))]
    async fn register_transaction(
        &self,
        new: &NewTransaction,
    ) -> Result<RegisterOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["register_transaction"])
            .start_timer();

        let workflow_id = Uuid::new_v4();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO transactions (transaction_id, workflow_id, source_account_ref, amount, currency, value_date, raw_remittance_data, customer_identifier, associated_document_uris, erp_system, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
            ON CONFLICT (transaction_id) DO NOTHING
            RETURNING workflow_id
            "#,
        )
        .bind(&new.transaction_id)
        .bind(workflow_id)
        .bind(&new.source_account_ref)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.value_date)
        .bind(&new.raw_remittance_data)
        .bind(&new.customer_identifier)
        .bind(&new.associated_document_uris)
        .bind(&new.erp_system)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to register transaction: {}", e))
        })?;

        let outcome = match inserted {
            Some((workflow_id,)) => {
                info!(workflow_id = %workflow_id, "Transaction registered");
                RegisterOutcome {
                    created: true,
                    workflow_id,
                    status: TransactionStatus::Pending.as_str().to_string(),
                }
            }
            None => {
                let (workflow_id, status): (Uuid, String) = sqlx::query_as(
                    "SELECT workflow_id, status FROM transactions WHERE transaction_id = $1",
                )
                .bind(&new.transaction_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to read existing transaction: {}",
                        e
                    ))
                })?;
                RegisterOutcome {
                    created: false,
                    workflow_id,
                    status,
                }
            }
        };

        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn claim_transaction(&self, transaction_id: &str) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_transaction"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'processing', updated_utc = NOW()
            WHERE transaction_id = $1 AND status = 'pending'
            "#,
        )
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to claim transaction: {}", e))
        })?;

        timer.observe_duration();

        if result.rows_affected() == 1 {
            info!("Transaction claimed");
            return Ok(true);
        }

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT status FROM transactions WHERE transaction_id = $1")
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to read transaction: {}", e))
                })?;

        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Unknown transaction: {}",
                transaction_id
            ))),
        }
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let txn = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {} FROM transactions WHERE transaction_id = $1",
            TXN_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(txn)
    }

    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    async fn get_transaction_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction_by_workflow"])
            .start_timer();

        let txn = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {} FROM transactions WHERE workflow_id = $1",
            TXN_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(txn)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id, status = %status.as_str()))]
    async fn update_transaction_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction_status"])
            .start_timer();

        let processed = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, updated_utc = NOW(), processed_utc = COALESCE($3, processed_utc)
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(status.as_str())
        .bind(processed)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, result, matches), fields(transaction_id = %result.transaction_id))]
    async fn record_match(
        &self,
        result: &MatchResult,
        matches: &[InvoicePaymentMatch],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_match"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO match_results (id, transaction_id, status, unapplied_amount, discrepancy_code, confidence, algorithm_version, log_entry, requires_human_review, processing_time_ms, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(result.id)
        .bind(&result.transaction_id)
        .bind(&result.status)
        .bind(result.unapplied_amount)
        .bind(&result.discrepancy_code)
        .bind(result.confidence)
        .bind(&result.algorithm_version)
        .bind(&result.log_entry)
        .bind(result.requires_human_review)
        .bind(result.processing_time_ms)
        .bind(result.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record match: {}", e)))?;

        if inserted.rows_affected() == 1 {
            for m in matches {
                sqlx::query(
                    r#"
                    INSERT INTO invoice_payment_matches (id, match_result_id, invoice_id, erp_system, amount_applied)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(m.id)
                .bind(m.match_result_id)
                .bind(&m.invoice_id)
                .bind(&m.erp_system)
                .bind(m.amount_applied)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to record invoice match: {}",
                        e
                    ))
                })?;
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit match: {}", e))
        })?;

        timer.observe_duration();
        info!(match_count = matches.len(), "Match result recorded");
        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_match_result(
        &self,
        transaction_id: &str,
    ) -> Result<Option<(MatchResult, Vec<InvoicePaymentMatch>)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_match_result"])
            .start_timer();

        let result = sqlx::query_as::<_, MatchResult>(
            r#"
            SELECT id, transaction_id, status, unapplied_amount, discrepancy_code, confidence, algorithm_version, log_entry, requires_human_review, processing_time_ms, created_utc
            FROM match_results
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get match: {}", e)))?;

        let Some(result) = result else {
            timer.observe_duration();
            return Ok(None);
        };

        let matches = sqlx::query_as::<_, InvoicePaymentMatch>(
            r#"
            SELECT id, match_result_id, invoice_id, erp_system, amount_applied
            FROM invoice_payment_matches
            WHERE match_result_id = $1
            ORDER BY invoice_id
            "#,
        )
        .bind(result.id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice matches: {}", e))
        })?;

        timer.observe_duration();
        Ok(Some((result, matches)))
    }

    #[instrument(skip(self, event), fields(delivery_id = %event.id))]
    async fn record_communication(&self, event: &CommunicationEvent) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_communication"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO communication_events (id, transaction_id, kind, recipient, template_name, payload, delivery_status, error_message, created_utc, sent_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(&event.transaction_id)
        .bind(&event.kind)
        .bind(&event.recipient)
        .bind(&event.template_name)
        .bind(&event.payload)
        .bind(&event.delivery_status)
        .bind(&event.error_message)
        .bind(event.created_utc)
        .bind(event.sent_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record communication: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(delivery_id = %delivery_id, status = %status.as_str()))]
    async fn update_communication_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_communication_status"])
            .start_timer();

        let sent = if status == DeliveryStatus::Sent {
            Some(Utc::now())
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE communication_events
            SET delivery_status = $2, error_message = $3, sent_utc = COALESCE($4, sent_utc)
            WHERE id = $1
            "#,
        )
        .bind(delivery_id)
        .bind(status.as_str())
        .bind(error)
        .bind(sent)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update communication: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    async fn append_audit(&self, event: NewAuditEvent) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit"])
            .start_timer();

        let (seq,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_log (ts, event_type, source, correlation_id, transaction_id, data)
            VALUES (NOW(), $1, $2, $3, $4, $5)
            RETURNING seq
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.source)
        .bind(&event.correlation_id)
        .bind(&event.transaction_id)
        .bind(&event.data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to append audit: {}", e)))?;

        timer.observe_duration();
        Ok(seq)
    }

    #[instrument(skip(self, filter))]
    async fn query_audit(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["query_audit"])
            .start_timer();

        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);

        let events = sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT seq, ts, event_type, source, correlation_id, transaction_id, data
            FROM audit_log
            WHERE ($1::TEXT IS NULL OR transaction_id = $1)
              AND ($2::TEXT IS NULL OR event_type = $2)
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(&filter.transaction_id)
        .bind(&filter.event_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to query audit: {}", e)))?;

        timer.observe_duration();
        Ok(events)
    }

    #[instrument(skip(self, filter))]
    async fn query_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["query_transactions"])
            .start_timer();

        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);

        let txns = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR source_account_ref = $2)
            ORDER BY created_utc
            LIMIT $3
            "#,
            TXN_COLUMNS
        ))
        .bind(&filter.status)
        .bind(&filter.source_account_ref)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to query transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(txns)
    }

    #[instrument(skip(self, payload), fields(transaction_id = %transaction_id, step = %step.as_str()))]
    async fn save_checkpoint(
        &self,
        transaction_id: &str,
        step: WorkflowStep,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_checkpoint"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (transaction_id, step, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (transaction_id, step) DO NOTHING
            "#,
        )
        .bind(transaction_id)
        .bind(step.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to save checkpoint: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn load_checkpoints(&self, transaction_id: &str) -> Result<Vec<Checkpoint>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_checkpoints"])
            .start_timer();

        let checkpoints = sqlx::query_as::<_, Checkpoint>(
            r#"
            SELECT transaction_id, step, payload, created_utc
            FROM workflow_checkpoints
            WHERE transaction_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load checkpoints: {}", e))
        })?;

        timer.observe_duration();
        Ok(checkpoints)
    }

    #[instrument(skip(self))]
    async fn list_unfinished(&self) -> Result<Vec<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unfinished"])
            .start_timer();

        let txns = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE status IN ('pending', 'processing')
            ORDER BY created_utc
            "#,
            TXN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list unfinished: {}", e))
        })?;

        timer.observe_duration();
        Ok(txns)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}
