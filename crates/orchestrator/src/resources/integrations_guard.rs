//! RAII guard for a started set of integrations.
//!
//! Stops every integration process when the guard goes out of scope, so an
//! early return or `?` in the host does not leave processes behind.

use tracing::{debug, warn};

use crate::manager::IntegrationManager;
use crate::supervisor::{StartupDiagnostic, StopSummary};

/// RAII guard for running integrations.
///
/// # Example
///
/// ```ignore
/// let guard = IntegrationsGuard::start(manager.clone()).await;
/// for diagnostic in guard.diagnostics() {
///     eprintln!("{diagnostic}");
/// }
/// // ... dispatch events ...
/// // integrations are stopped when the guard is dropped
/// ```
pub struct IntegrationsGuard {
    manager: IntegrationManager,
    diagnostics: Vec<StartupDiagnostic>,
    active: bool,
}

impl IntegrationsGuard {
    /// Start all configured integrations and guard them.
    pub async fn start(manager: IntegrationManager) -> Self {
        let diagnostics = manager.start().await;
        debug!(
            diagnostics = diagnostics.len(),
            "Integrations started under guard"
        );

        Self {
            manager,
            diagnostics,
            active: true,
        }
    }

    pub fn manager(&self) -> &IntegrationManager {
        &self.manager
    }

    pub fn diagnostics(&self) -> &[StartupDiagnostic] {
        &self.diagnostics
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stop the integrations now.
    ///
    /// This is called automatically in `Drop`, but waiting for it here lets
    /// the caller observe the result.
    pub async fn stop(&mut self) -> StopSummary {
        if !self.active {
            return StopSummary::default();
        }
        self.active = false;
        self.manager.stop().await
    }
}

impl Drop for IntegrationsGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        // Cannot await in Drop
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                debug!("Spawning integration cleanup task");
                handle.spawn(async move {
                    let summary = manager.stop().await;
                    debug!(stopped = summary.total(), "Integrations stopped in Drop");
                });
            }
            Err(_) => {
                // Processes are still killed when their handles drop.
                warn!("No runtime available to stop integrations gracefully");
            }
        }
    }
}
