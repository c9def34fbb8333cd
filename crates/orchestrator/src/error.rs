use std::time::Duration;

use integrations_core::CoreError;
use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to start integration {integration}: {reason}")]
    Startup { integration: String, reason: String },

    #[error("Handshake with integration {integration} failed: {reason}")]
    Handshake { integration: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Call to {method} timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Channel closed: integration process exited or its stream broke")]
    ChannelClosed,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl OrchestratorError {
    /// Create a startup error for one integration.
    pub fn startup(integration: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Startup {
            integration: integration.into(),
            reason: reason.into(),
        }
    }

    /// Create a handshake error for one integration.
    pub fn handshake(integration: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handshake {
            integration: integration.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(method: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            after,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
