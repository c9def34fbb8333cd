use serde::{Deserialize, Serialize};

/// Runtime state of an integration process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    /// Process spawned, handshake not yet sent.
    #[default]
    Starting,
    /// `initialize` request in flight.
    Initializing,
    /// Handshake complete; eligible for dispatch.
    Ready,
    /// Shutdown requested, waiting for the process to exit.
    Stopping,
    Terminated,
    Failed,
}

impl IntegrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "initializing" => Some(Self::Initializing),
            "ready" => Some(Self::Ready),
            "stopping" => Some(Self::Stopping),
            "terminated" => Some(Self::Terminated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl std::fmt::Display for IntegrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(IntegrationState::Terminated.is_terminal());
        assert!(IntegrationState::Failed.is_terminal());
        assert!(!IntegrationState::Ready.is_terminal());
        assert!(!IntegrationState::Stopping.is_terminal());
    }

    #[test]
    fn test_parse() {
        assert_eq!(IntegrationState::parse("ready"), Some(IntegrationState::Ready));
        assert_eq!(IntegrationState::parse("zombie"), None);
    }
}
