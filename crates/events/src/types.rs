//! Event types published on the diagnostic bus

use chrono::{DateTime, Utc};
use integrations_core::{HookAction, HookStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Position in the bus's publish order, starting at 0
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(sequence: u64, event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All diagnostic events emitted by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Lifecycle events
    /// Process spawned, handshake pending
    #[serde(rename = "integration.starting")]
    IntegrationStarting { integration: String, source: String },

    /// Handshake completed
    #[serde(rename = "integration.ready")]
    IntegrationReady {
        integration: String,
        version: String,
        subscribed_events: Vec<String>,
    },

    /// Integration moved to the failed state and will not be dispatched to
    #[serde(rename = "integration.failed")]
    IntegrationFailed { integration: String, reason: String },

    /// Integration process exited (or was killed) during shutdown
    #[serde(rename = "integration.stopped")]
    IntegrationStopped { integration: String, forced: bool },

    // Stream events
    /// A line the integration wrote to stderr
    #[serde(rename = "integration.stderr")]
    IntegrationStderr { integration: String, line: String },

    /// Unsolicited notification or request sent by the integration
    #[serde(rename = "integration.notification")]
    IntegrationNotification {
        integration: String,
        method: String,
        params: Option<Value>,
    },

    /// Response whose id matched no outstanding call
    #[serde(rename = "integration.unmatched_response")]
    UnmatchedResponse { integration: String, id: u64 },

    /// A frame from the integration could not be decoded
    #[serde(rename = "integration.frame_error")]
    FrameError { integration: String, message: String },

    // Dispatch events
    /// An event was fanned out to its subscribers
    #[serde(rename = "hook.dispatched")]
    HookDispatched {
        dispatch_id: Uuid,
        event: String,
        integrations: Vec<String>,
    },

    /// All subscribers answered (or were synthesized) and the outcome reduced
    #[serde(rename = "hook.completed")]
    HookCompleted {
        dispatch_id: Uuid,
        event: String,
        action: HookAction,
        results: Vec<HookResultData>,
    },
}

/// Summary of one integration's result within a dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResultData {
    /// Integration name
    pub integration: String,
    /// Effective status after applying the failure policy
    pub status: HookStatus,
    /// Verdict message, or the synthesized cause
    pub message: String,
    /// Whether the result was synthesized (timeout, crash, protocol error)
    pub synthesized: bool,
}

impl Event {
    /// Get the integration this event is about, if it concerns exactly one
    pub fn integration(&self) -> Option<&str> {
        match self {
            Event::IntegrationStarting { integration, .. }
            | Event::IntegrationReady { integration, .. }
            | Event::IntegrationFailed { integration, .. }
            | Event::IntegrationStopped { integration, .. }
            | Event::IntegrationStderr { integration, .. }
            | Event::IntegrationNotification { integration, .. }
            | Event::UnmatchedResponse { integration, .. }
            | Event::FrameError { integration, .. } => Some(integration),
            Event::HookDispatched { .. } | Event::HookCompleted { .. } => None,
        }
    }
}
