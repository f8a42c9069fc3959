use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationKind {
    CustomerClarification,
    InternalAlert,
    Confirmation,
}

impl CommunicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerClarification => "customer_clarification",
            Self::InternalAlert => "internal_alert",
            Self::Confirmation => "confirmation",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "customer_clarification" => Self::CustomerClarification,
            "confirmation" => Self::Confirmation,
            _ => Self::InternalAlert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CommunicationEvent {
    pub id: Uuid,
    pub transaction_id: Option<String>,
    pub kind: String,
    pub recipient: String,
    pub template_name: String,
    pub payload: serde_json::Value,
    pub delivery_status: String,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub sent_utc: Option<DateTime<Utc>>,
}

impl CommunicationEvent {
    pub fn new(
        kind: CommunicationKind,
        recipient: String,
        template_name: String,
        payload: serde_json::Value,
        transaction_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            kind: kind.as_str().to_string(),
            recipient,
            template_name,
            payload,
            delivery_status: DeliveryStatus::Queued.as_str().to_string(),
            error_message: None,
            created_utc: Utc::now(),
            sent_utc: None,
        }
    }
}
