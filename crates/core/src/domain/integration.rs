use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::HookStatus;
use crate::error::{CoreError, Result};

/// How a timed-out, crashed or otherwise unanswered call is counted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Missing answers count as `fail` and can halt the operation.
    #[default]
    Strict,
    /// Missing answers count as `warn`.
    Lenient,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Lenient => "lenient",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(CoreError::UnknownFailurePolicy(other.to_string())),
        }
    }

    /// Status given to a result that was synthesized instead of received.
    pub fn synthesized_status(&self) -> HookStatus {
        match self {
            Self::Strict => HookStatus::Fail,
            Self::Lenient => HookStatus::Warn,
        }
    }
}

/// A configured integration. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Integration {
    pub name: String,
    /// Filesystem path or `PATH` lookup token for the executable.
    pub source: String,
    /// Forwarded verbatim as `config` in the `initialize` request.
    #[serde(default, rename = "config")]
    pub startup_config: Map<String, Value>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Integration {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            startup_config: Map::new(),
            failure_policy: FailurePolicy::default(),
            env: BTreeMap::new(),
            args: Vec::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.startup_config.insert(key.into(), value);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation(
                "each integration must have a name".to_string(),
            ));
        }

        if self.source.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "integration {:?} must have a 'source' specifying the integration executable",
                self.name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_default_is_strict() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Strict);
        assert_eq!(FailurePolicy::Strict.synthesized_status(), HookStatus::Fail);
        assert_eq!(FailurePolicy::Lenient.synthesized_status(), HookStatus::Warn);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(FailurePolicy::parse("lenient").unwrap(), FailurePolicy::Lenient);
        assert!(FailurePolicy::parse("loose").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Integration::new("logger", "/usr/bin/logger").validate().is_ok());
        assert!(Integration::new("", "/usr/bin/logger").validate().is_err());

        let err = Integration::new("cost", "  ").validate().unwrap_err();
        assert!(err.to_string().contains("cost"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let integration: Integration = serde_json::from_value(json!({
            "name": "policy",
            "source": "policy-check",
            "config": {"deny": ["delete"]}
        }))
        .unwrap();

        assert_eq!(integration.failure_policy, FailurePolicy::Strict);
        assert_eq!(integration.startup_config["deny"], json!(["delete"]));
        assert!(integration.env.is_empty());
        assert!(integration.args.is_empty());
    }
}
