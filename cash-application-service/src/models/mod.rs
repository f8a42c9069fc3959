//! Domain models for cash-application-service.

mod audit;
mod communication;
mod invoice;
mod match_result;
mod transaction;
mod workflow;

pub use audit::{AuditEvent, NewAuditEvent};
pub use communication::{CommunicationEvent, CommunicationKind, DeliveryStatus};
pub use invoice::{Invoice, InvoiceStatus};
pub use match_result::{DiscrepancyCode, InvoicePaymentMatch, MatchResult, MatchStatus};
pub use transaction::{NewTransaction, PaymentTransaction, TransactionStatus};
pub use workflow::{Checkpoint, WorkflowStep};
