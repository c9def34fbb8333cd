//! Diagnostic events for the integration subsystem
//!
//! The orchestrator publishes lifecycle and dispatch activity here so a host
//! can surface it (progress output, audit logs) without coupling to tracing.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
