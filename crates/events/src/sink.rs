//! Progress sink consumed by the plan engine and phase executors.

use install_core::PhaseState;
use installer_proto::ProgressMessage;

use crate::bus::EventBus;
use crate::types::{Event, ProgressReport};

/// Receives progress notifications from many concurrently running phases.
///
/// Implementations must be safe to call from several tasks at once.
/// Delivery is best effort: a notification nobody receives is dropped and
/// never fails the caller.
pub trait ProgressSink: Send + Sync {
    /// Announces the start of a meaningful sub-step.
    fn next_step(&self, message: String);

    /// Phase-boundary and plan-level notifications.
    fn report(&self, progress: ProgressMessage);

    /// Called by the engine after every phase state transition.
    fn phase_changed(&self, _phase_id: &str, _from: PhaseState, _to: PhaseState) {}
}

/// Publishes progress of one operation to an [`EventBus`].
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    bus: EventBus,
    operation_id: String,
}

impl ProgressReporter {
    pub fn new(bus: EventBus, operation_id: impl Into<String>) -> Self {
        Self {
            bus,
            operation_id: operation_id.into(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

impl ProgressSink for ProgressReporter {
    fn next_step(&self, message: String) {
        self.bus.publish(Event::Step {
            operation_id: self.operation_id.clone(),
            message,
        });
    }

    fn report(&self, progress: ProgressMessage) {
        self.bus.publish(Event::Progress {
            operation_id: self.operation_id.clone(),
            report: ProgressReport::from(&progress),
        });
    }

    fn phase_changed(&self, phase_id: &str, from: PhaseState, to: PhaseState) {
        self.bus.publish(Event::PhaseStateChanged {
            operation_id: self.operation_id.clone(),
            phase_id: phase_id.to_string(),
            from,
            to,
        });
    }
}
