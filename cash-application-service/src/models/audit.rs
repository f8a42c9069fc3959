use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Append-only audit record. `seq` is assigned by the store and strictly
/// increasing; rows are never mutated or deleted.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEvent {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub source: String,
    pub correlation_id: String,
    pub transaction_id: Option<String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_type: String,
    pub source: String,
    pub correlation_id: String,
    pub transaction_id: Option<String>,
    pub data: serde_json::Value,
}

impl NewAuditEvent {
    pub fn new(
        event_type: &str,
        source: &str,
        correlation_id: &str,
        transaction_id: Option<&str>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            source: source.to_string(),
            correlation_id: correlation_id.to_string(),
            transaction_id: transaction_id.map(|t| t.to_string()),
            data,
        }
    }
}
