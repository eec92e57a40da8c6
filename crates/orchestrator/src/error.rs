use install_core::{CoreError, FailureKind, PhaseState, Server};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: PhaseState, to: PhaseState },

    #[error("Plan error: {0}")]
    Core(#[from] CoreError),

    #[error("Unknown phase kind: {0}")]
    UnknownPhaseKind(String),

    #[error("Phase {phase} is missing {field}")]
    MissingData { phase: String, field: &'static str },

    #[error("Node {server} failed remote check: {reason}")]
    RemoteCheck { server: Server, reason: String },

    #[error("{message}")]
    Command { message: String, output: String },

    #[error(transparent)]
    Agent(#[from] agent::AgentError),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// The agent could not clean up after an abort.
    #[error("Abort failed: {0}")]
    AbortFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn remote_check(server: &Server, reason: impl Into<String>) -> Self {
        Self::RemoteCheck {
            server: server.clone(),
            reason: reason.into(),
        }
    }

    pub fn missing_data(phase: impl Into<String>, field: &'static str) -> Self {
        Self::MissingData {
            phase: phase.into(),
            field,
        }
    }

    /// Whether the outcome of the failed work is unknown because the
    /// connection to the agent broke.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Agent(e) if e.is_protocol())
    }

    /// Failure kind recorded when this error ends a rollback.
    pub fn rollback_kind(&self) -> FailureKind {
        match self {
            Self::AbortFailed(_) => FailureKind::Abort,
            _ => FailureKind::Rollback,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
