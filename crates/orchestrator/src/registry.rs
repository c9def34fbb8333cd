use std::collections::BTreeMap;
use std::sync::Arc;

use integrations_core::{FailurePolicy, IntegrationState};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::process::IntegrationProcess;

/// Point-in-time view of one registered integration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IntegrationStatus {
    pub name: String,
    pub source: String,
    pub state: IntegrationState,
    pub failure_policy: FailurePolicy,
    pub version: Option<String>,
    pub subscribed_events: Vec<String>,
}

impl IntegrationStatus {
    fn of(process: &IntegrationProcess) -> Self {
        let info = process.info();
        Self {
            name: process.name().to_string(),
            source: process.integration().source.clone(),
            state: process.state(),
            failure_policy: process.failure_policy(),
            version: info.map(|i| i.version.clone()),
            subscribed_events: info
                .map(|i| i.subscribed_events.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Name-ordered set of integrations for one host operation.
///
/// Written by the supervisor during start and stop; read by every dispatch.
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    processes: Arc<RwLock<BTreeMap<String, Arc<IntegrationProcess>>>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process, returning any previous one with the same name.
    pub async fn insert(&self, process: Arc<IntegrationProcess>) -> Option<Arc<IntegrationProcess>> {
        let mut processes = self.processes.write().await;
        processes.insert(process.name().to_string(), process)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<IntegrationProcess>> {
        self.processes.read().await.get(name).cloned()
    }

    /// Ready integrations subscribed to `event`, in name order.
    pub async fn subscribers(&self, event: &str) -> Vec<Arc<IntegrationProcess>> {
        self.processes
            .read()
            .await
            .values()
            .filter(|process| process.is_subscribed(event))
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<IntegrationStatus> {
        self.processes
            .read()
            .await
            .values()
            .map(|process| IntegrationStatus::of(process))
            .collect()
    }

    /// Remove and return every registered process.
    pub async fn drain(&self) -> Vec<Arc<IntegrationProcess>> {
        let mut processes = self.processes.write().await;
        std::mem::take(&mut *processes).into_values().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        self.processes.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.processes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processes.read().await.is_empty()
    }
}

impl std::fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelOptions, ProcessChannel};
    use integrations_core::Integration;
    use tokio::io::duplex;

    fn idle_process(name: &str) -> Arc<IntegrationProcess> {
        let (host, _peer) = duplex(1024);
        let (read, write) = tokio::io::split(host);
        let channel = ProcessChannel::new(name, read, write, ChannelOptions::default());
        Arc::new(IntegrationProcess::from_channel(
            Integration::new(name, format!("/opt/{name}")),
            channel,
            None,
        ))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = IntegrationRegistry::new();
        assert!(registry.is_empty().await);

        assert!(registry.insert(idle_process("logger")).await.is_none());
        assert!(registry.insert(idle_process("logger")).await.is_some());

        assert_eq!(registry.len().await, 1);
        assert!(registry.get("logger").await.is_some());
        assert!(registry.get("cost").await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_name_ordered() {
        let registry = IntegrationRegistry::new();
        registry.insert(idle_process("policy")).await;
        registry.insert(idle_process("cost")).await;
        registry.insert(idle_process("logger")).await;

        let snapshot = registry.snapshot().await;
        let names: Vec<_> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cost", "logger", "policy"]);
        assert_eq!(snapshot[0].source, "/opt/cost");
        assert_eq!(snapshot[0].state, IntegrationState::Starting);
        assert!(snapshot[0].version.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_skip_unready() {
        let registry = IntegrationRegistry::new();
        registry.insert(idle_process("logger")).await;

        assert!(registry.subscribers("post-plan-resource").await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties() {
        let registry = IntegrationRegistry::new();
        registry.insert(idle_process("a")).await;
        registry.insert(idle_process("b")).await;

        assert_eq!(registry.drain().await.len(), 2);
        assert!(registry.drain().await.is_empty());
        assert!(registry.names().await.is_empty());
    }
}
