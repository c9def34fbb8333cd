//! Host-engine callbacks and their mapping onto integration events.

use std::time::Duration;

use async_trait::async_trait;
use integrations_core::{event_names, HookAction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::dispatcher::{AggregatedOutcome, Dispatcher, DEFAULT_HOOK_TIMEOUT};

/// Which resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub address: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub provider: String,
}

impl ResourceIdentity {
    pub fn new(
        address: impl Into<String>,
        resource_type: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            resource_type: resource_type.into(),
            provider: provider.into(),
        }
    }
}

/// Planned change to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceAction {
    NoOp,
    Create,
    Read,
    Update,
    DeleteThenCreate,
    CreateThenDelete,
    Delete,
}

impl ResourceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "NoOp",
            Self::Create => "Create",
            Self::Read => "Read",
            Self::Update => "Update",
            Self::DeleteThenCreate => "DeleteThenCreate",
            Self::CreateThenDelete => "CreateThenDelete",
            Self::Delete => "Delete",
        }
    }

    pub fn is_replace(&self) -> bool {
        matches!(self, Self::DeleteThenCreate | Self::CreateThenDelete)
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan summary. A replacement counts once as `add` and once as `remove`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub add: usize,
    pub change: usize,
    pub remove: usize,
}

impl ChangeCounts {
    pub fn record(&mut self, action: ResourceAction) {
        match action {
            ResourceAction::Create => self.add += 1,
            ResourceAction::Update => self.change += 1,
            ResourceAction::Delete => self.remove += 1,
            ResourceAction::DeleteThenCreate | ResourceAction::CreateThenDelete => {
                self.add += 1;
                self.remove += 1;
            }
            ResourceAction::NoOp | ResourceAction::Read => {}
        }
    }
}

impl FromIterator<ResourceAction> for ChangeCounts {
    fn from_iter<I: IntoIterator<Item = ResourceAction>>(iter: I) -> Self {
        let mut counts = Self::default();
        for action in iter {
            counts.record(action);
        }
        counts
    }
}

/// Callbacks the host engine fires around each resource and stage.
///
/// Every method defaults to [`HookAction::Continue`], so implementors only
/// override what they care about.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn pre_plan_resource(
        &self,
        _id: &ResourceIdentity,
        _prior: Option<&Value>,
        _proposed: Option<&Value>,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn post_plan_resource(
        &self,
        _id: &ResourceIdentity,
        _action: ResourceAction,
        _prior: Option<&Value>,
        _planned: Option<&Value>,
        _config: Option<&Value>,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn pre_apply_resource(
        &self,
        _id: &ResourceIdentity,
        _action: ResourceAction,
        _prior: Option<&Value>,
        _planned: Option<&Value>,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn post_apply_resource(
        &self,
        _id: &ResourceIdentity,
        _state: Option<&Value>,
        _error: Option<&str>,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn pre_refresh_resource(&self, _id: &ResourceIdentity, _state: Option<&Value>) -> HookAction {
        HookAction::Continue
    }

    async fn post_refresh_resource(
        &self,
        _id: &ResourceIdentity,
        _prior: Option<&Value>,
        _refreshed: Option<&Value>,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn plan_stage_complete(&self, _changes: ChangeCounts) -> HookAction {
        HookAction::Continue
    }

    async fn apply_stage_complete(
        &self,
        _resource_count: Option<usize>,
        _error: Option<&str>,
    ) -> HookAction {
        HookAction::Continue
    }
}

/// Hook that never objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl LifecycleHook for NoopHook {}

/// Forwards every callback to the integrations subscribed to it.
#[derive(Debug, Clone)]
pub struct IntegrationHook {
    dispatcher: Dispatcher,
    timeout: Duration,
}

impl IntegrationHook {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dispatch and keep the full per-integration outcome.
    pub async fn dispatch(&self, event: &str, params: Map<String, Value>) -> AggregatedOutcome {
        self.dispatcher
            .dispatch(event, Value::Object(params), self.timeout)
            .await
    }

    async fn send(&self, event: &str, params: Map<String, Value>) -> HookAction {
        self.dispatch(event, params).await.action
    }
}

fn resource_params(id: &ResourceIdentity) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("address".to_string(), json!(id.address));
    params.insert("type".to_string(), json!(id.resource_type));
    params.insert("provider".to_string(), json!(id.provider));
    params
}

/// Insert `value` unless it is absent or null.
fn insert_value(params: &mut Map<String, Value>, key: &str, value: Option<&Value>) {
    if let Some(value) = value.filter(|v| !v.is_null()) {
        params.insert(key.to_string(), value.clone());
    }
}

#[async_trait]
impl LifecycleHook for IntegrationHook {
    async fn pre_plan_resource(
        &self,
        id: &ResourceIdentity,
        prior: Option<&Value>,
        proposed: Option<&Value>,
    ) -> HookAction {
        let mut params = resource_params(id);
        insert_value(&mut params, "before", prior);
        insert_value(&mut params, "after", proposed);
        self.send(event_names::PRE_PLAN_RESOURCE, params).await
    }

    async fn post_plan_resource(
        &self,
        id: &ResourceIdentity,
        action: ResourceAction,
        prior: Option<&Value>,
        planned: Option<&Value>,
        config: Option<&Value>,
    ) -> HookAction {
        let mut params = resource_params(id);
        params.insert("action".to_string(), json!(action.as_str()));
        insert_value(&mut params, "before", prior);
        insert_value(&mut params, "after", planned);
        insert_value(&mut params, "config", config);
        self.send(event_names::POST_PLAN_RESOURCE, params).await
    }

    async fn pre_apply_resource(
        &self,
        id: &ResourceIdentity,
        action: ResourceAction,
        prior: Option<&Value>,
        planned: Option<&Value>,
    ) -> HookAction {
        let mut params = resource_params(id);
        params.insert("action".to_string(), json!(action.as_str()));
        insert_value(&mut params, "before", prior);
        insert_value(&mut params, "after", planned);
        self.send(event_names::PRE_APPLY_RESOURCE, params).await
    }

    async fn post_apply_resource(
        &self,
        id: &ResourceIdentity,
        state: Option<&Value>,
        error: Option<&str>,
    ) -> HookAction {
        let mut params = resource_params(id);
        insert_value(&mut params, "state", state);
        if let Some(error) = error {
            params.insert("error".to_string(), json!(error));
        }
        self.send(event_names::POST_APPLY_RESOURCE, params).await
    }

    async fn pre_refresh_resource(&self, id: &ResourceIdentity, state: Option<&Value>) -> HookAction {
        let mut params = resource_params(id);
        insert_value(&mut params, "state", state);
        self.send(event_names::PRE_REFRESH_RESOURCE, params).await
    }

    async fn post_refresh_resource(
        &self,
        id: &ResourceIdentity,
        prior: Option<&Value>,
        refreshed: Option<&Value>,
    ) -> HookAction {
        let mut params = resource_params(id);
        insert_value(&mut params, "before", prior);
        insert_value(&mut params, "after", refreshed);
        self.send(event_names::POST_REFRESH_RESOURCE, params).await
    }

    async fn plan_stage_complete(&self, changes: ChangeCounts) -> HookAction {
        let mut params = Map::new();
        params.insert("changes".to_string(), json!(changes));
        self.send(event_names::PLAN_STAGE_COMPLETE, params).await
    }

    async fn apply_stage_complete(&self, resource_count: Option<usize>, error: Option<&str>) -> HookAction {
        let mut params = Map::new();
        if let Some(count) = resource_count {
            params.insert("resource_count".to_string(), json!(count));
        }
        if let Some(error) = error {
            params.insert("error".to_string(), json!(error));
        }
        self.send(event_names::APPLY_STAGE_COMPLETE, params).await
    }
}
