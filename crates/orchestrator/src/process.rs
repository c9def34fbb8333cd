use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

use events::{Event, EventBus};
use integrations_core::{FailurePolicy, Integration, IntegrationState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelOptions, ProcessChannel};
use crate::error::{OrchestratorError, Result};
use crate::state_machine::IntegrationStateMachine;

/// Version of the handshake sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "1";
pub const INITIALIZE_METHOD: &str = "initialize";
pub const SHUTDOWN_METHOD: &str = "shutdown";
/// Event names are sent as `event:<name>` methods.
pub const EVENT_METHOD_PREFIX: &str = "event:";

/// Identity of the host, announced in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub version: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            name: "integrations".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What an integration reported about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationInfo {
    pub name: String,
    pub version: String,
    pub subscribed_events: BTreeSet<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams<'a> {
    protocol_version: &'a str,
    host_name: &'a str,
    host_version: &'a str,
    name: &'a str,
    config: &'a Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    name: String,
    version: String,
    #[serde(alias = "hooks")]
    subscribed_events: Vec<String>,
}

/// One running integration: its process, channel and lifecycle state.
pub struct IntegrationProcess {
    integration: Integration,
    executable: PathBuf,
    channel: ProcessChannel,
    child: Mutex<Option<Child>>,
    state: StdMutex<IntegrationState>,
    info: OnceLock<IntegrationInfo>,
    consecutive_timeouts: AtomicU32,
    events: Option<EventBus>,
}

impl IntegrationProcess {
    /// Launch the integration's executable. The process starts in `Starting`.
    pub fn spawn(
        integration: Integration,
        executable: PathBuf,
        options: ChannelOptions,
    ) -> Result<Self> {
        let events = options.events.clone();
        let (channel, child) = ProcessChannel::spawn(
            &integration.name,
            &executable,
            &integration.args,
            &integration.env,
            options,
        )?;

        let process = Self {
            integration,
            executable,
            channel,
            child: Mutex::new(Some(child)),
            state: StdMutex::new(IntegrationState::Starting),
            info: OnceLock::new(),
            consecutive_timeouts: AtomicU32::new(0),
            events,
        };
        process.publish_starting();
        Ok(process)
    }

    /// Wrap an already-connected channel with no OS process behind it.
    pub fn from_channel(
        integration: Integration,
        channel: ProcessChannel,
        events: Option<EventBus>,
    ) -> Self {
        let process = Self {
            executable: PathBuf::from(&integration.source),
            integration,
            channel,
            child: Mutex::new(None),
            state: StdMutex::new(IntegrationState::Starting),
            info: OnceLock::new(),
            consecutive_timeouts: AtomicU32::new(0),
            events,
        };
        process.publish_starting();
        process
    }

    fn publish_starting(&self) {
        self.publish(Event::IntegrationStarting {
            integration: self.integration.name.clone(),
            source: self.executable.display().to_string(),
        });
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    pub fn name(&self) -> &str {
        &self.integration.name
    }

    pub fn integration(&self) -> &Integration {
        &self.integration
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.integration.failure_policy
    }

    pub fn channel(&self) -> &ProcessChannel {
        &self.channel
    }

    pub fn state(&self) -> IntegrationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handshake result; set once the integration reaches `Ready`.
    pub fn info(&self) -> Option<&IntegrationInfo> {
        self.info.get()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&self, to: IntegrationState) -> Result<IntegrationState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        IntegrationStateMachine::validate_transition(&from, &to)?;
        *state = to;
        drop(state);

        debug!(
            integration = %self.integration.name,
            from = %from,
            to = %to,
            "Integration state changed"
        );
        Ok(from)
    }

    /// Send `initialize` and record the reported name, version and events.
    pub async fn initialize(&self, host: &HostInfo, timeout: Duration) -> Result<IntegrationInfo> {
        self.transition(IntegrationState::Initializing)?;

        let params = serde_json::to_value(InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            host_name: &host.name,
            host_version: &host.version,
            name: &self.integration.name,
            config: &self.integration.startup_config,
        })?;

        let value = self
            .channel
            .call(INITIALIZE_METHOD, Some(params), timeout)
            .await
            .map_err(|e| OrchestratorError::handshake(&self.integration.name, e.to_string()))?;

        let result: InitializeResult = serde_json::from_value(value).map_err(|e| {
            OrchestratorError::handshake(
                &self.integration.name,
                format!("invalid initialize result: {}", e),
            )
        })?;

        let info = IntegrationInfo {
            name: result.name,
            version: result.version,
            subscribed_events: result.subscribed_events.into_iter().collect(),
        };
        self.info.set(info.clone()).map_err(|_| {
            OrchestratorError::handshake(&self.integration.name, "integration already initialized")
        })?;

        self.transition(IntegrationState::Ready)?;

        info!(
            integration = %self.integration.name,
            version = %info.version,
            events = info.subscribed_events.len(),
            "Integration ready"
        );
        self.publish(Event::IntegrationReady {
            integration: self.integration.name.clone(),
            version: info.version.clone(),
            subscribed_events: info.subscribed_events.iter().cloned().collect(),
        });

        Ok(info)
    }

    /// Whether a dispatch of `event` should reach this integration now.
    pub fn is_subscribed(&self, event: &str) -> bool {
        self.state() == IntegrationState::Ready
            && self
                .info
                .get()
                .is_some_and(|info| info.subscribed_events.contains(event))
    }

    /// Call the `event:<event>` method, tracking consecutive timeouts.
    pub async fn call_event(&self, event: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let method = format!("{}{}", EVENT_METHOD_PREFIX, event);
        let result = self.channel.call(&method, Some(payload), timeout).await;

        match &result {
            Err(e) if e.is_timeout() => {
                self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst);
            }
            _ => self.consecutive_timeouts.store(0, Ordering::SeqCst),
        }
        result
    }

    /// Mark the integration `Failed`, close its channel and kill its process.
    ///
    /// Returns false if it had already reached a terminal state.
    pub async fn fail(&self, reason: &str) -> bool {
        self.fail_when(reason, |_| true).await
    }

    /// Like [`fail`](Self::fail), but only from `Ready`, so a shutdown that
    /// is already under way is left alone.
    pub async fn fail_if_ready(&self, reason: &str) -> bool {
        self.fail_when(reason, |state| state == IntegrationState::Ready)
            .await
    }

    async fn fail_when<F>(&self, reason: &str, allowed: F) -> bool
    where
        F: Fn(IntegrationState) -> bool,
    {
        let transitioned = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if allowed(*state)
                && IntegrationStateMachine::can_transition(&state, &IntegrationState::Failed)
            {
                *state = IntegrationState::Failed;
                true
            } else {
                false
            }
        };
        if !transitioned {
            return false;
        }

        error!(integration = %self.integration.name, reason = %reason, "Integration failed");

        self.channel.close().await;
        self.kill().await;

        self.publish(Event::IntegrationFailed {
            integration: self.integration.name.clone(),
            reason: reason.to_string(),
        });
        true
    }

    /// Kill the OS process if it is still running. Never signals twice.
    pub async fn kill(&self) -> bool {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(integration = %self.integration.name, status = %status, "Integration already exited");
                false
            }
            _ => {
                if let Err(e) = child.kill().await {
                    warn!(integration = %self.integration.name, error = %e, "Failed to kill integration");
                }
                true
            }
        }
    }

    /// Graceful stop: notify, close stdin, wait up to `grace`, then kill.
    ///
    /// Returns whether the process had to be killed.
    pub async fn shutdown(&self, grace: Duration) -> Result<bool> {
        self.transition(IntegrationState::Stopping)?;

        if let Err(e) = self.channel.notify(SHUTDOWN_METHOD, None).await {
            debug!(integration = %self.integration.name, error = %e, "Could not deliver shutdown notification");
        }
        self.channel.close().await;

        let child = self.child.lock().await.take();
        let forced = match child {
            None => false,
            Some(mut child) => match wait_for_exit(&mut child, grace).await {
                Ok(Ok(status)) => {
                    debug!(integration = %self.integration.name, status = %status, "Integration exited");
                    false
                }
                Ok(Err(e)) => {
                    warn!(integration = %self.integration.name, error = %e, "Failed to wait for integration, killing");
                    let _ = child.kill().await;
                    true
                }
                Err(_) => {
                    warn!(
                        integration = %self.integration.name,
                        grace_ms = grace.as_millis() as u64,
                        "Integration did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(integration = %self.integration.name, error = %e, "Failed to kill integration");
                    }
                    true
                }
            },
        };

        self.transition(IntegrationState::Terminated)?;
        info!(integration = %self.integration.name, forced, "Integration stopped");
        self.publish(Event::IntegrationStopped {
            integration: self.integration.name.clone(),
            forced,
        });

        Ok(forced)
    }

    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.channel.subscribe_closed()
    }
}

async fn wait_for_exit(
    child: &mut Child,
    grace: Duration,
) -> std::result::Result<std::io::Result<std::process::ExitStatus>, tokio::time::error::Elapsed> {
    tokio::time::timeout(grace, child.wait()).await
}

impl std::fmt::Debug for IntegrationProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationProcess")
            .field("name", &self.integration.name)
            .field("executable", &self.executable)
            .field("state", &self.state())
            .field("info", &self.info.get())
            .finish()
    }
}
