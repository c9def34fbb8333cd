pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hook;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod resources;
pub mod state_machine;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelOptions, ProcessChannel, INTEGRATION_NAME_ENV};
pub use config::{IntegrationsConfig, Settings, DEFAULT_CONFIG_FILE, MAX_TIMEOUT_SECS};
pub use dispatcher::{AggregatedOutcome, CallOutcome, Dispatcher, IntegrationResult, DEFAULT_HOOK_TIMEOUT};
pub use error::{OrchestratorError, Result};
pub use hook::{ChangeCounts, IntegrationHook, LifecycleHook, NoopHook, ResourceAction, ResourceIdentity};
pub use manager::IntegrationManager;
pub use process::{HostInfo, IntegrationInfo, IntegrationProcess};
pub use registry::{IntegrationRegistry, IntegrationStatus};
pub use resources::IntegrationsGuard;
pub use state_machine::IntegrationStateMachine;
pub use supervisor::{resolve_source, Severity, StartupDiagnostic, StopSummary, Supervisor, SupervisorConfig};
