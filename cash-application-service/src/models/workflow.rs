use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Steps of the cash-application workflow, in execution order. Each step's
/// outcome is persisted before the next step starts so a replacement
/// instance can resume from the last completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkflowStep {
    Claimed,
    Extracted,
    Fetched,
    Matched,
    Posted,
    Communicated,
    Finalized,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Extracted => "extracted",
            Self::Fetched => "fetched",
            Self::Matched => "matched",
            Self::Posted => "posted",
            Self::Communicated => "communicated",
            Self::Finalized => "finalized",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "claimed" => Some(Self::Claimed),
            "extracted" => Some(Self::Extracted),
            "fetched" => Some(Self::Fetched),
            "matched" => Some(Self::Matched),
            "posted" => Some(Self::Posted),
            "communicated" => Some(Self::Communicated),
            "finalized" => Some(Self::Finalized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Checkpoint {
    pub transaction_id: String,
    pub step: String,
    pub payload: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

impl Checkpoint {
    pub fn step(&self) -> Option<WorkflowStep> {
        WorkflowStep::from_str(&self.step)
    }
}
