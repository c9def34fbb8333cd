use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Well-known lifecycle events surfaced by the host engine.
pub mod event_names {
    pub const PRE_PLAN_RESOURCE: &str = "pre-plan-resource";
    pub const POST_PLAN_RESOURCE: &str = "post-plan-resource";
    pub const PRE_APPLY_RESOURCE: &str = "pre-apply-resource";
    pub const POST_APPLY_RESOURCE: &str = "post-apply-resource";
    pub const PRE_REFRESH_RESOURCE: &str = "pre-refresh-resource";
    pub const POST_REFRESH_RESOURCE: &str = "post-refresh-resource";
    pub const PLAN_STAGE_COMPLETE: &str = "plan-stage-complete";
    pub const APPLY_STAGE_COMPLETE: &str = "apply-stage-complete";

    pub const ALL: &[&str] = &[
        PRE_PLAN_RESOURCE,
        POST_PLAN_RESOURCE,
        PRE_APPLY_RESOURCE,
        POST_APPLY_RESOURCE,
        PRE_REFRESH_RESOURCE,
        POST_REFRESH_RESOURCE,
        PLAN_STAGE_COMPLETE,
        APPLY_STAGE_COMPLETE,
    ];
}

/// Status of a single integration's verdict.
///
/// Variants are ordered by precedence so that `max()` over a set of statuses
/// yields the dominant one (`Fail > Warn > Success`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    #[default]
    Success,
    Warn,
    Fail,
}

impl HookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "warn" => Some(Self::Warn),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for HookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integration's typed answer to one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HookResult {
    pub status: HookStatus,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub message: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Map::is_empty"
    )]
    pub metadata: Map<String, Value>,
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl HookResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Warn,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Fail,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_fail(&self) -> bool {
        self.status == HookStatus::Fail
    }
}

/// What the host engine should do after an event was dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    #[default]
    Continue,
    Halt,
}

impl HookAction {
    /// Reduce a set of statuses: any `Fail` halts, everything else continues.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = HookStatus>,
    {
        match statuses.into_iter().max() {
            Some(HookStatus::Fail) => Self::Halt,
            _ => Self::Continue,
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Halt => "halt",
        }
    }
}
