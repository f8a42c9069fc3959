pub mod communicator;
pub mod erp;
pub mod extractor;
pub mod matcher;
pub mod metrics;
pub mod orchestrator;
pub mod store;

pub use metrics::{get_metrics, init_metrics};
