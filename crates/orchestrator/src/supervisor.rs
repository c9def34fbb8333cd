//! Starts integrations, runs their handshakes, watches for crashes, and
//! stops them again at the end of the host operation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use events::{Event, EventBus};
use futures::future::join_all;
use integrations_core::{Integration, IntegrationState};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelOptions;
use crate::process::{HostInfo, IntegrationProcess};
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::registry::IntegrationRegistry;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: HostInfo,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_frame_bytes: usize,
    /// Base for relative `source` paths.
    pub working_dir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: HostInfo::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

/// A problem found while starting one integration.
///
/// Errors mean the integration was skipped; warnings mean it is running.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartupDiagnostic {
    pub integration: String,
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

impl StartupDiagnostic {
    pub fn error(
        integration: impl Into<String>,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            integration: integration.into(),
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    pub fn warning(
        integration: impl Into<String>,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            integration: integration.into(),
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for StartupDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]: {}: {}",
            self.severity, self.integration, self.summary, self.detail
        )
    }
}

/// Counts from one `stop_all` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    /// Exited on their own within the grace period.
    pub stopped: usize,
    /// Still running after the grace period and killed.
    pub forced: usize,
    /// Failed or never became ready, and were killed.
    pub killed: usize,
}

impl StopSummary {
    pub fn total(&self) -> usize {
        self.stopped + self.forced + self.killed
    }
}

enum StopResult {
    Graceful,
    Forced,
    Killed,
    Skipped,
}

/// Resolve an integration `source` to an executable path.
///
/// Absolute paths must exist. A relative path is tried against
/// `working_dir`, then the bare name is looked up on `PATH`.
pub fn resolve_source(source: &str, working_dir: &Path) -> Result<PathBuf, String> {
    let path = Path::new(source);

    if path.is_absolute() {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(format!("integration not found at path {}", path.display()))
        };
    }

    let relative = working_dir.join(path);
    if relative.is_file() {
        return Ok(relative);
    }

    which::which(source).map_err(|_| format!("integration not found: {}", source))
}

pub struct Supervisor {
    registry: IntegrationRegistry,
    config: SupervisorConfig,
    events: Option<EventBus>,
}

impl Supervisor {
    pub fn new(registry: IntegrationRegistry, config: SupervisorConfig) -> Self {
        Self {
            registry,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &IntegrationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            max_frame_bytes: self.config.max_frame_bytes,
            events: self.events.clone(),
        }
    }

    /// Start every integration concurrently.
    ///
    /// A failure only affects its own integration; the returned diagnostics
    /// list what went wrong. Integrations that reach `Ready` are registered
    /// for dispatch.
    pub async fn start_all(&self, integrations: &[Integration]) -> Vec<StartupDiagnostic> {
        let mut diagnostics = Vec::new();
        let mut seen = HashSet::new();
        let mut to_start = Vec::new();

        for integration in integrations {
            if !seen.insert(integration.name.as_str()) {
                diagnostics.push(StartupDiagnostic::error(
                    &integration.name,
                    "duplicate integration name",
                    format!("an integration named {:?} is already configured", integration.name),
                ));
                continue;
            }
            to_start.push(integration.clone());
        }

        let results = join_all(to_start.into_iter().map(|i| self.start_one(i))).await;
        diagnostics.extend(results.into_iter().flatten());

        let failed = diagnostics.iter().filter(|d| d.is_error()).count();
        info!(
            configured = integrations.len(),
            failed,
            "Integrations started"
        );

        diagnostics
    }

    async fn start_one(&self, integration: Integration) -> Vec<StartupDiagnostic> {
        let name = integration.name.clone();

        if let Err(e) = integration.validate() {
            return vec![StartupDiagnostic::error(name, "invalid integration", e.to_string())];
        }

        let executable = match resolve_source(&integration.source, &self.config.working_dir) {
            Ok(path) => path,
            Err(reason) => {
                error!(integration = %name, source = %integration.source, "Integration not found");
                self.publish(Event::IntegrationFailed {
                    integration: name.clone(),
                    reason: reason.clone(),
                });
                return vec![StartupDiagnostic::error(name, "integration not found", reason)];
            }
        };

        info!(integration = %name, path = %executable.display(), "Starting integration");

        let process = match IntegrationProcess::spawn(integration, executable, self.channel_options()) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                error!(integration = %name, error = %e, "Failed to start integration");
                self.publish(Event::IntegrationFailed {
                    integration: name.clone(),
                    reason: e.to_string(),
                });
                return vec![StartupDiagnostic::error(
                    name,
                    "failed to start integration",
                    e.to_string(),
                )];
            }
        };

        // Registered before the handshake so a failed process is still visible and reaped.
        self.registry.insert(process.clone()).await;

        let info = match process
            .initialize(&self.config.host, self.config.handshake_timeout)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                process.fail(&e.to_string()).await;
                return vec![StartupDiagnostic::error(
                    name,
                    "integration handshake failed",
                    e.to_string(),
                )];
            }
        };

        self.spawn_crash_monitor(&process);

        let mut diagnostics = Vec::new();
        if info.name != name {
            warn!(integration = %name, reported = %info.name, "Integration reported a different name");
            diagnostics.push(StartupDiagnostic::warning(
                &name,
                "integration reported a different name",
                format!("configured as {:?}, reported {:?}", name, info.name),
            ));
        }
        if info.subscribed_events.is_empty() {
            warn!(integration = %name, "Integration subscribed to no events");
            diagnostics.push(StartupDiagnostic::warning(
                &name,
                "integration subscribed to no events",
                "it will not receive any hooks",
            ));
        }
        diagnostics
    }

    /// Fail a ready integration as soon as its channel closes.
    fn spawn_crash_monitor(&self, process: &Arc<IntegrationProcess>) {
        let weak = Arc::downgrade(process);
        let mut closed = process.subscribe_closed();

        tokio::spawn(async move {
            if closed.wait_for(|closed| *closed).await.is_err() {
                return;
            }
            let Some(process) = weak.upgrade() else {
                return;
            };
            if process
                .fail_if_ready("integration exited unexpectedly")
                .await
            {
                debug!(integration = %process.name(), "Crash monitor marked integration failed");
            }
        });
    }

    /// Stop every registered integration. Safe to call more than once.
    pub async fn stop_all(&self) -> StopSummary {
        let processes = self.registry.drain().await;
        if processes.is_empty() {
            debug!("No integrations to stop");
            return StopSummary::default();
        }

        let grace = self.config.shutdown_grace;
        let results = join_all(processes.iter().map(|process| stop_one(process, grace))).await;

        let mut summary = StopSummary::default();
        for result in results {
            match result {
                StopResult::Graceful => summary.stopped += 1,
                StopResult::Forced => summary.forced += 1,
                StopResult::Killed => summary.killed += 1,
                StopResult::Skipped => {}
            }
        }

        info!(
            stopped = summary.stopped,
            forced = summary.forced,
            killed = summary.killed,
            "Integrations stopped"
        );
        summary
    }
}

async fn stop_one(process: &IntegrationProcess, grace: Duration) -> StopResult {
    match process.state() {
        IntegrationState::Ready => match process.shutdown(grace).await {
            Ok(true) => StopResult::Forced,
            Ok(false) => StopResult::Graceful,
            Err(e) => {
                warn!(integration = %process.name(), error = %e, "Integration could not be shut down cleanly");
                process.fail(&e.to_string()).await;
                StopResult::Killed
            }
        },
        IntegrationState::Failed => {
            if process.kill().await {
                StopResult::Killed
            } else {
                StopResult::Skipped
            }
        }
        IntegrationState::Terminated => StopResult::Skipped,
        IntegrationState::Starting | IntegrationState::Initializing | IntegrationState::Stopping => {
            process.fail("stopped before becoming ready").await;
            StopResult::Killed
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("logger");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        assert_eq!(
            resolve_source(exe.to_str().unwrap(), Path::new("/")).unwrap(),
            exe
        );
    }

    #[test]
    fn test_resolve_missing_absolute_path() {
        let err = resolve_source("/definitely/not/here/logger", Path::new("/")).unwrap_err();
        assert!(err.contains("/definitely/not/here/logger"));
    }

    #[test]
    fn test_resolve_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/cost"), "").unwrap();

        assert_eq!(
            resolve_source("bin/cost", dir.path()).unwrap(),
            dir.path().join("bin/cost")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_source("sh", dir.path()).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn test_resolve_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_source("no-such-integration-xyz", dir.path()).unwrap_err();
        assert_eq!(err, "integration not found: no-such-integration-xyz");
    }

    #[test]
    fn test_diagnostic_display() {
        let diagnostic =
            StartupDiagnostic::warning("logger", "integration subscribed to no events", "idle");
        assert_eq!(
            diagnostic.to_string(),
            "warning [logger]: integration subscribed to no events: idle"
        );
        assert!(!diagnostic.is_error());
    }

    #[tokio::test]
    async fn test_start_all_reports_missing_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            IntegrationRegistry::new(),
            SupervisorConfig {
                working_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
        );

        let diagnostics = supervisor
            .start_all(&[
                Integration::new("ghost", "./ghost-integration"),
                Integration::new("ghost", "./ghost-integration"),
                Integration::new("", "./x"),
            ])
            .await;

        assert_eq!(diagnostics.len(), 3);
        assert!(diagnostics.iter().all(StartupDiagnostic::is_error));
        assert!(diagnostics
            .iter()
            .any(|d| d.summary == "duplicate integration name"));
        assert!(diagnostics
            .iter()
            .any(|d| d.summary == "integration not found"));
        assert!(supervisor.registry().is_empty().await);

        assert_eq!(supervisor.stop_all().await, StopSummary::default());
    }
}
