//! HTTP request/response shapes for the control plane.
//!
//! Amounts travel as canonical fixed-point strings ("1234.56") to avoid
//! floating-point drift; timestamps are RFC3339 UTC.

use crate::models::{Invoice, InvoicePaymentMatch, MatchResult};
use crate::services::erp::{ApplicationLine, ErpApplication};
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

pub static CURRENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{3}$").expect("invalid currency regex"));

/// Parse a canonical fixed-point amount with at most two decimal places.
pub fn parse_amount(raw: &str) -> Result<Decimal, AppError> {
    let amount = Decimal::from_str(raw)
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("invalid amount: {}", raw)))?;
    if amount < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "amount must not be negative: {}",
            raw
        )));
    }
    if amount.round_dp(2) != amount {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "amount precision exceeds 2 decimal places: {}",
            raw
        )));
    }
    Ok(amount)
}

// ============================================================================
// Workflows
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct StartWorkflowRequest {
    #[validate(length(min = 1, max = 64, message = "transaction_id must be 1-64 chars"))]
    pub transaction_id: String,
    #[validate(length(min = 1, max = 64, message = "source_account_ref must be 1-64 chars"))]
    pub source_account_ref: String,
    pub amount: String,
    #[validate(regex(path = "CURRENCY_RE", message = "currency must be a 3-letter code"))]
    pub currency: String,
    #[serde(default)]
    pub value_date: Option<NaiveDate>,
    #[serde(default)]
    pub raw_remittance_data: String,
    #[serde(default)]
    pub customer_identifier: Option<String>,
    #[serde(default)]
    pub associated_document_uris: Vec<String>,
    #[serde(default)]
    pub erp_system: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartWorkflowResponse {
    pub workflow_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct MatchResultDto {
    pub status: String,
    pub unapplied_amount: String,
    pub discrepancy_code: String,
    pub confidence: f64,
    pub algorithm_version: String,
    pub log_entry: String,
    pub requires_human_review: bool,
    pub processing_time_ms: i64,
    pub matches: Vec<InvoiceMatchDto>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceMatchDto {
    pub invoice_id: String,
    pub erp_system: String,
    pub amount_applied: String,
}

impl MatchResultDto {
    pub fn from_model(result: MatchResult, matches: Vec<InvoicePaymentMatch>) -> Self {
        Self {
            status: result.status,
            unapplied_amount: result.unapplied_amount.to_string(),
            discrepancy_code: result.discrepancy_code,
            confidence: result.confidence,
            algorithm_version: result.algorithm_version,
            log_entry: result.log_entry,
            requires_human_review: result.requires_human_review,
            processing_time_ms: result.processing_time_ms,
            matches: matches
                .into_iter()
                .map(|m| InvoiceMatchDto {
                    invoice_id: m.invoice_id,
                    erp_system: m.erp_system,
                    amount_applied: m.amount_applied.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkflowStatusResponse {
    pub workflow_id: Uuid,
    pub transaction_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MatchResultDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

// ============================================================================
// ERP facade
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct FetchInvoicesRequest {
    #[validate(length(min = 1, message = "invoice_ids must not be empty"))]
    pub invoice_ids: Vec<String>,
    #[validate(length(min = 1, message = "erp_system must not be empty"))]
    pub erp_system: String,
    #[serde(default)]
    pub customer_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceDto {
    pub invoice_id: String,
    pub erp_system: String,
    pub customer_id: String,
    pub original_amount: String,
    pub amount_due: String,
    pub currency: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub erp_record_id: String,
    pub fetched_at: DateTime<Utc>,
}

impl From<Invoice> for InvoiceDto {
    fn from(inv: Invoice) -> Self {
        Self {
            invoice_id: inv.invoice_id,
            erp_system: inv.erp_system,
            customer_id: inv.customer_id,
            original_amount: inv.original_amount.to_string(),
            amount_due: inv.amount_due.to_string(),
            currency: inv.currency,
            status: inv.status,
            due_date: inv.due_date,
            erp_record_id: inv.erp_record_id,
            fetched_at: inv.fetched_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FetchInvoicesResponse {
    pub invoices: Vec<InvoiceDto>,
    pub not_found: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PostApplicationRequest {
    #[validate(length(min = 1, message = "transaction_id must not be empty"))]
    pub transaction_id: String,
    #[validate(length(min = 1, message = "customer_id must not be empty"))]
    pub customer_id: String,
    #[validate(length(min = 1, message = "erp_system must not be empty"))]
    pub erp_system: String,
    #[validate(length(min = 1, message = "applications must not be empty"))]
    pub applications: Vec<ApplicationLineDto>,
    pub total_amount: String,
    #[validate(regex(path = "CURRENCY_RE", message = "currency must be a 3-letter code"))]
    pub currency: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ApplicationLineDto {
    pub invoice_id: String,
    pub amount_applied: String,
}

impl PostApplicationRequest {
    pub fn into_application(self) -> Result<ErpApplication, AppError> {
        let total_amount = parse_amount(&self.total_amount)?;
        let applications = self
            .applications
            .into_iter()
            .map(|line| {
                let amount_applied = parse_amount(&line.amount_applied)?;
                if amount_applied <= Decimal::ZERO {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "amount_applied must be positive for {}",
                        line.invoice_id
                    )));
                }
                Ok(ApplicationLine {
                    invoice_id: line.invoice_id,
                    amount_applied,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        let sum: Decimal = applications.iter().map(|a| a.amount_applied).sum();
        if sum != total_amount {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "application lines sum to {} but total_amount is {}",
                sum,
                total_amount
            )));
        }

        Ok(ErpApplication {
            transaction_id: self.transaction_id,
            customer_id: self.customer_id,
            erp_system: self.erp_system,
            applications,
            total_amount,
            currency: self.currency,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PostApplicationResponse {
    pub erp_transaction_id: String,
    pub posted_at: DateTime<Utc>,
    pub duplicate: bool,
}

// ============================================================================
// Extractor
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ExtractRequestDto {
    #[serde(default)]
    pub document_uris: Vec<String>,
    #[serde(default)]
    pub remittance_text: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub tier_preference: Option<String>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub delivery_id: Uuid,
    pub status: String,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub store: String,
    pub erp_systems: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_accepts_canonical_form() {
        assert_eq!(parse_amount("1234.56").unwrap(), Decimal::new(123456, 2));
        assert_eq!(parse_amount("0").unwrap(), Decimal::ZERO);
        assert_eq!(parse_amount("10.5").unwrap(), Decimal::new(105, 1));
    }

    #[test]
    fn parse_amount_rejects_bad_input() {
        assert!(parse_amount("12.345").is_err());
        assert!(parse_amount("-1.00").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("1,000.00").is_err());
    }

    #[test]
    fn amount_string_round_trips() {
        for raw in ["1234.56", "0.01", "999999.99"] {
            let parsed = parse_amount(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }
}
