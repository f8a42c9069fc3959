use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Open,
    Closed,
    Disputed,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Disputed => "disputed",
            Self::Overdue => "overdue",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "closed" => Self::Closed,
            "disputed" => Self::Disputed,
            "overdue" => Self::Overdue,
            _ => Self::Open,
        }
    }
}

/// Advisory snapshot of an ERP invoice. The ERP remains the system of
/// record; `fetched_utc` marks the freshness of this copy.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: String,
    pub erp_system: String,
    pub customer_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub original_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_due: Decimal,
    pub currency: String,
    pub status: String,
    pub due_date: Option<NaiveDate>,
    pub erp_record_id: String,
    pub fetched_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_str(&self.status)
    }

    /// An invoice can receive an application while open or overdue with a
    /// positive balance.
    pub fn is_payable(&self) -> bool {
        matches!(self.status(), InvoiceStatus::Open | InvoiceStatus::Overdue)
            && self.amount_due > Decimal::ZERO
    }
}
