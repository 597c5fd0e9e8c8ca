//! HTTP API Module
//!
//! Optional read-only status and metrics endpoints for the reconciler.

mod routes;
mod metrics;

pub use routes::{run_api_server, ApiState};
pub use metrics::Metrics;
