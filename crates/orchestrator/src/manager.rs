use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use events::EventBus;
use integrations_core::Integration;
use serde_json::Value;

use crate::config::IntegrationsConfig;
use crate::dispatcher::{AggregatedOutcome, Dispatcher};
use crate::hook::IntegrationHook;
use crate::process::HostInfo;
use crate::registry::{IntegrationRegistry, IntegrationStatus};
use crate::supervisor::{StartupDiagnostic, StopSummary, Supervisor, SupervisorConfig};

/// Entry point for a host: owns the registry, supervisor and dispatcher for
/// one operation. Clones share the same integrations.
#[derive(Clone)]
pub struct IntegrationManager {
    integrations: Arc<Vec<Integration>>,
    registry: IntegrationRegistry,
    supervisor: Arc<Supervisor>,
    dispatcher: Dispatcher,
    events: EventBus,
    hook_timeout: Duration,
}

impl IntegrationManager {
    pub fn new(config: IntegrationsConfig, host: HostInfo, events: EventBus) -> Self {
        let settings = &config.settings;
        let registry = IntegrationRegistry::new();

        let supervisor = Supervisor::new(
            registry.clone(),
            SupervisorConfig {
                host,
                handshake_timeout: settings.handshake_timeout(),
                shutdown_grace: settings.shutdown_grace(),
                max_frame_bytes: settings.max_frame_bytes,
                ..Default::default()
            },
        )
        .with_events(events.clone());

        let mut dispatcher = Dispatcher::new(registry.clone()).with_events(events.clone());
        if let Some(limit) = settings.max_consecutive_timeouts {
            dispatcher = dispatcher.with_max_consecutive_timeouts(limit);
        }
        if let Some(limit) = settings.max_concurrent_calls {
            dispatcher = dispatcher.with_concurrency_limit(limit);
        }

        Self {
            hook_timeout: settings.hook_timeout(),
            integrations: Arc::new(config.integrations),
            registry,
            supervisor: Arc::new(supervisor),
            dispatcher,
            events,
        }
    }

    pub fn from_config(config: IntegrationsConfig) -> Self {
        Self::new(config, HostInfo::default(), EventBus::new())
    }

    /// Resolve relative `source` paths against `dir` instead of the
    /// current directory. Call before [`start`](Self::start).
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        let config = SupervisorConfig {
            working_dir: dir,
            ..self.supervisor.config().clone()
        };
        self.supervisor = Arc::new(
            Supervisor::new(self.registry.clone(), config).with_events(self.events.clone()),
        );
        self
    }

    pub async fn start(&self) -> Vec<StartupDiagnostic> {
        self.supervisor.start_all(&self.integrations).await
    }

    /// Dispatch with the configured per-call timeout.
    pub async fn dispatch(&self, event: &str, payload: Value) -> AggregatedOutcome {
        self.dispatcher
            .dispatch(event, payload, self.hook_timeout)
            .await
    }

    pub async fn dispatch_with_timeout(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> AggregatedOutcome {
        self.dispatcher.dispatch(event, payload, timeout).await
    }

    pub async fn stop(&self) -> StopSummary {
        self.supervisor.stop_all().await
    }

    pub async fn status(&self) -> Vec<IntegrationStatus> {
        self.registry.snapshot().await
    }

    /// Adapter for host engines that drive callbacks.
    pub fn hook(&self) -> IntegrationHook {
        IntegrationHook::new(self.dispatcher.clone()).with_timeout(self.hook_timeout)
    }

    pub fn registry(&self) -> &IntegrationRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn hook_timeout(&self) -> Duration {
        self.hook_timeout
    }

    pub fn integrations(&self) -> &[Integration] {
        &self.integrations
    }
}

impl std::fmt::Debug for IntegrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationManager")
            .field("integrations", &self.integrations.len())
            .field("hook_timeout", &self.hook_timeout)
            .finish_non_exhaustive()
    }
}
