//! RAII guards for automatic cleanup.
//!
//! - [`IntegrationsGuard`] - Stops every started integration when dropped

mod integrations_guard;

pub use integrations_guard::IntegrationsGuard;
