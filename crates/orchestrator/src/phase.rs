//! Phase executor contract.
//!
//! Every phase kind implements [`PhaseExecutor`]. The engine builds one
//! executor per phase attempt through an [`ExecutorFactory`] keyed by the
//! phase's kind tag, and drives it through pre-check, execute and
//! post-check, calling rollback while it unwinds a failed plan.

use std::sync::Arc;

use async_trait::async_trait;
use events::ProgressSink;
use install_core::{OperationKey, Phase, Plan, Server};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::logger::PhaseLogger;

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Verifies that running the phase is safe. Must not change the target.
    async fn pre_check(&self, cancel: &CancellationToken) -> Result<()>;

    /// Applies the phase effect. Returns promptly once `cancel` fires.
    async fn execute(&self, cancel: &CancellationToken) -> Result<()>;

    /// Best-effort compensation for a prior `execute`.
    async fn rollback(&self, cancel: &CancellationToken) -> Result<()>;

    async fn post_check(&self, cancel: &CancellationToken) -> Result<()>;

    /// Whether `execute` changes its target. Phases without effect are not
    /// rolled back.
    fn has_effect(&self) -> bool {
        true
    }

    /// How many times `execute` is attempted before the phase fails.
    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Read-only inputs of one executor.
#[derive(Clone)]
pub struct ExecutorParams {
    pub phase: Phase,
    pub plan: Arc<Plan>,
    pub progress: Arc<dyn ProgressSink>,
}

impl ExecutorParams {
    pub fn new(phase: Phase, plan: Arc<Plan>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            phase,
            plan,
            progress,
        }
    }

    pub fn key(&self) -> OperationKey {
        self.plan.key()
    }

    pub fn server(&self) -> Option<&Server> {
        self.phase.data.server.as_ref()
    }

    /// The target node, for phase kinds that cannot run without one.
    pub fn require_server(&self) -> Result<&Server> {
        self.server()
            .ok_or_else(|| OrchestratorError::missing_data(&self.phase.id, "a target server"))
    }

    pub fn logger(&self) -> PhaseLogger {
        PhaseLogger::new(&self.phase, &self.key())
    }

    pub fn next_step(&self, message: impl Into<String>) {
        self.progress.next_step(message.into());
    }
}

pub trait ExecutorFactory: Send + Sync {
    fn create(&self, params: ExecutorParams) -> Result<Box<dyn PhaseExecutor>>;
}
