use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Processing,
    Matched,
    PartiallyMatched,
    Unmatched,
    RequiresReview,
    Error,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Matched => "matched",
            Self::PartiallyMatched => "partially_matched",
            Self::Unmatched => "unmatched",
            Self::RequiresReview => "requires_review",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "matched" => Self::Matched,
            "partially_matched" => Self::PartiallyMatched,
            "unmatched" => Self::Unmatched,
            "requires_review" => Self::RequiresReview,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Matched
                | Self::PartiallyMatched
                | Self::Unmatched
                | Self::RequiresReview
                | Self::Error
        )
    }
}

/// An incoming bank payment as submitted for processing.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_id: String,
    pub source_account_ref: String,
    pub amount: Decimal,
    pub currency: String,
    pub value_date: Option<NaiveDate>,
    pub raw_remittance_data: String,
    pub customer_identifier: Option<String>,
    pub associated_document_uris: Vec<String>,
    pub erp_system: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentTransaction {
    pub transaction_id: String,
    pub workflow_id: Uuid,
    pub source_account_ref: String,
    pub amount: Decimal,
    pub currency: String,
    pub value_date: Option<NaiveDate>,
    pub raw_remittance_data: String,
    pub customer_identifier: Option<String>,
    pub associated_document_uris: Vec<String>,
    pub erp_system: String,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_str(&self.status)
    }

    pub fn from_new(new: &NewTransaction, workflow_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: new.transaction_id.clone(),
            workflow_id,
            source_account_ref: new.source_account_ref.clone(),
            amount: new.amount,
            currency: new.currency.clone(),
            value_date: new.value_date,
            raw_remittance_data: new.raw_remittance_data.clone(),
            customer_identifier: new.customer_identifier.clone(),
            associated_document_uris: new.associated_document_uris.clone(),
            erp_system: new.erp_system.clone(),
            status: TransactionStatus::Pending.as_str().to_string(),
            created_utc: now,
            updated_utc: now,
            processed_utc: None,
        }
    }
}
