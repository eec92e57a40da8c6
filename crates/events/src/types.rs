//! Event types published while a plan runs

use chrono::{DateTime, Utc};
use install_core::PhaseState;
use installer_proto::ProgressMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Position of the event in its emitter's sequence
    pub seq: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(seq: u64, event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            timestamp: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An executor announced the start of a sub-step
    #[serde(rename = "progress.step")]
    Step {
        operation_id: String,
        message: String,
    },

    /// Phase boundary or plan-level progress
    #[serde(rename = "progress.report")]
    Progress {
        operation_id: String,
        report: ProgressReport,
    },

    /// The engine moved a phase to a new state
    #[serde(rename = "phase.state_changed")]
    PhaseStateChanged {
        operation_id: String,
        phase_id: String,
        from: PhaseState,
        to: PhaseState,
    },
}

impl Event {
    pub fn operation_id(&self) -> &str {
        match self {
            Event::Step { operation_id, .. } => operation_id,
            Event::Progress { operation_id, .. } => operation_id,
            Event::PhaseStateChanged { operation_id, .. } => operation_id,
        }
    }

    /// Whether this is the terminal report of a plan run
    pub fn is_complete(&self) -> bool {
        matches!(self, Event::Progress { report, .. } if report.complete)
    }
}

/// Serializable view of a [`ProgressMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub message: String,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl From<&ProgressMessage> for ProgressReport {
    fn from(msg: &ProgressMessage) -> Self {
        Self {
            message: msg.message.clone(),
            complete: msg.complete,
            errors: msg.errors.iter().map(|e| e.message.clone()).collect(),
        }
    }
}
