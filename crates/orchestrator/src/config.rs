use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use integrations_core::Integration;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_CONFIG_FILE: &str = "integrations.toml";

/// Upper bound for every timeout setting (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Timeouts and limits shared by every integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-call deadline for event dispatch
    pub hook_timeout_secs: u64,
    /// Deadline for the `initialize` handshake
    pub handshake_timeout_secs: u64,
    /// How long a process may take to exit after `shutdown`
    pub shutdown_grace_secs: u64,
    pub max_frame_bytes: usize,
    /// Fail an integration after this many timeouts in a row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_timeouts: Option<u32>,
    /// Cap on event calls in flight at once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_calls: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hook_timeout_secs: 30,
            handshake_timeout_secs: 10,
            shutdown_grace_secs: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_consecutive_timeouts: None,
            max_concurrent_calls: None,
        }
    }
}

impl Settings {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    fn validate(&self) -> Result<()> {
        let non_zero = [
            ("hook_timeout_secs", self.hook_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            (
                "max_consecutive_timeouts",
                self.max_consecutive_timeouts.map_or(1, u64::from),
            ),
            (
                "max_concurrent_calls",
                self.max_concurrent_calls.map_or(1, |n| n as u64),
            ),
        ];

        for (key, value) in non_zero {
            if value == 0 {
                return Err(OrchestratorError::Config(format!(
                    "settings.{} must be greater than zero",
                    key
                )));
            }
        }

        let timeouts = [
            ("hook_timeout_secs", self.hook_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
        ];
        for (key, value) in timeouts {
            if value > MAX_TIMEOUT_SECS {
                return Err(OrchestratorError::Config(format!(
                    "settings.{} must be at most {}",
                    key, MAX_TIMEOUT_SECS
                )));
            }
        }
        Ok(())
    }
}

/// Contents of an `integrations.toml` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "integration")]
    pub integrations: Vec<Integration>,
}

impl IntegrationsConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %path.display(),
            integrations = config.integrations.len(),
            "Integrations config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;

        let mut names = HashSet::new();
        for integration in &self.integrations {
            integration
                .validate()
                .map_err(|e| OrchestratorError::Config(e.to_string()))?;

            if !names.insert(integration.name.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate integration name {:?}",
                    integration.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OrchestratorError::Config(e.to_string()))
    }
}
