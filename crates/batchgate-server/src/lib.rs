//! Batch processor daemon.
//!
//! Serves Prometheus metrics and health probes next to the scheduler loop.

pub mod listener;
pub mod routes;
pub mod state;

pub use listener::MetricsServer;
pub use state::AppState;
