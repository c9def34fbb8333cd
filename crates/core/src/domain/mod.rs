mod hook;
mod integration;
mod state;

pub use hook::{event_names, HookAction, HookResult, HookStatus};
pub use integration::{FailurePolicy, Integration};
pub use state::IntegrationState;
