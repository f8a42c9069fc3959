mod erp;
mod extract;
mod health;
mod notifications;
mod workflows;

pub use erp::{fetch_invoices, post_application, test_erp_connection};
pub use extract::extract;
pub use health::{health_check, metrics_endpoint};
pub use notifications::dispatch_notification;
pub use workflows::{cancel_workflow, get_workflow, start_workflow};
