use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Matched,
    PartiallyMatched,
    Unmatched,
    RequiresReview,
    Error,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::PartiallyMatched => "partially_matched",
            Self::Unmatched => "unmatched",
            Self::RequiresReview => "requires_review",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "matched" => Self::Matched,
            "partially_matched" => Self::PartiallyMatched,
            "unmatched" => Self::Unmatched,
            "requires_review" => Self::RequiresReview,
            "error" => Self::Error,
            _ => Self::Unmatched,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscrepancyCode {
    ShortPayment,
    OverPayment,
    InvalidInvoice,
    CurrencyMismatch,
    DuplicatePayment,
    None,
}

impl DiscrepancyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortPayment => "short_payment",
            Self::OverPayment => "over_payment",
            Self::InvalidInvoice => "invalid_invoice",
            Self::CurrencyMismatch => "currency_mismatch",
            Self::DuplicatePayment => "duplicate_payment",
            Self::None => "none",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "short_payment" => Self::ShortPayment,
            "over_payment" => Self::OverPayment,
            "invalid_invoice" => Self::InvalidInvoice,
            "currency_mismatch" => Self::CurrencyMismatch,
            "duplicate_payment" => Self::DuplicatePayment,
            _ => Self::None,
        }
    }
}

/// Outcome of one completed matching attempt for a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MatchResult {
    pub id: Uuid,
    pub transaction_id: String,
    pub status: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub unapplied_amount: Decimal,
    pub discrepancy_code: String,
    pub confidence: f64,
    pub algorithm_version: String,
    pub log_entry: String,
    pub requires_human_review: bool,
    pub processing_time_ms: i64,
    pub created_utc: DateTime<Utc>,
}

impl MatchResult {
    pub fn status(&self) -> MatchStatus {
        MatchStatus::from_str(&self.status)
    }

    pub fn discrepancy(&self) -> DiscrepancyCode {
        DiscrepancyCode::from_str(&self.discrepancy_code)
    }
}

/// Applied amount linking a match result to one invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoicePaymentMatch {
    pub id: Uuid,
    pub match_result_id: Uuid,
    pub invoice_id: String,
    pub erp_system: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_applied: Decimal,
}
