//! Plan engine.
//!
//! The engine walks the phase graph of a [`Plan`], running every phase
//! whose prerequisites have completed, and unwinds a failed plan by rolling
//! back the affected phases in the reverse order of their completion. The
//! run loop is the only writer of phase state; phase executors run on their
//! own tasks and report back through their join handles.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use events::ProgressSink;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use install_core::{CoreError, FailureKind, Phase, PhaseError, PhaseState, Plan, Server};
use installer_proto::{Error, ProgressMessage};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::phase::{ExecutorFactory, ExecutorParams};
use crate::state_machine::PhaseStateMachine;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound of phases executing at once
    pub max_parallel: usize,
    /// Whether a failed plan is unwound
    pub rollback_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            rollback_on_failure: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }
}

/// A terminal failure of one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase_id: String,
    pub server: Option<Server>,
    pub kind: FailureKind,
    pub message: String,
}

impl PhaseFailure {
    fn new(phase: &Phase, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            phase_id: phase.id.clone(),
            server: phase.data.server.clone(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(
                f,
                "phase {} on {}: {} failure: {}",
                self.phase_id, server, self.kind, self.message
            ),
            None => write!(
                f,
                "phase {}: {} failure: {}",
                self.phase_id, self.kind, self.message
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    /// Phase failures, including failures found when the run started
    pub failures: Vec<PhaseFailure>,
    pub rollback_failures: Vec<PhaseFailure>,
    pub cancelled: bool,
}

impl PlanOutcome {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.failures.is_empty()
            && self.rollback_failures.is_empty()
            && self.plan.is_finished()
    }

    /// Every surfaced failure, rollback failures last.
    pub fn errors(&self) -> Vec<String> {
        self.failures
            .iter()
            .chain(&self.rollback_failures)
            .map(ToString::to_string)
            .collect()
    }
}

enum PhaseResult {
    Completed,
    Failed(PhaseError),
}

type PhaseTask = BoxFuture<'static, (String, std::result::Result<PhaseResult, JoinError>)>;

pub struct Engine {
    factory: Arc<dyn ExecutorFactory>,
    progress: Arc<dyn ProgressSink>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(factory: Arc<dyn ExecutorFactory>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            factory,
            progress,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Drives `plan` to a terminal state and returns it with every failure.
    ///
    /// Phases completed by an earlier run are never executed again. Once
    /// `cancel` fires no new phase starts and in-flight phases are
    /// cancelled; rollback still runs to its end.
    pub async fn run(&self, plan: Plan, cancel: CancellationToken) -> Result<PlanOutcome> {
        plan.validate()?;

        let key = plan.key();
        info!(key = %key, phases = plan.phases.len(), "Running plan");

        let mut run = PlanRun {
            engine: self,
            plan,
            failures: Vec::new(),
            rollback_failures: Vec::new(),
        };

        run.resume()?;
        if run.has_failed() {
            info!(key = %key, "Plan has failed phases, not starting new phases");
        } else {
            run.forward(&cancel).await?;
        }

        if self.config.rollback_on_failure {
            run.rollback().await?;
        }

        Ok(run.finish(cancel.is_cancelled()))
    }
}

struct PlanRun<'a> {
    engine: &'a Engine,
    plan: Plan,
    failures: Vec<PhaseFailure>,
    rollback_failures: Vec<PhaseFailure>,
}

impl PlanRun<'_> {
    fn report(&self, progress: ProgressMessage) {
        self.engine.progress.report(progress);
    }

    fn phase(&self, id: &str) -> Result<&Phase> {
        self.plan
            .phase(id)
            .ok_or_else(|| CoreError::PhaseNotFound(id.to_string()).into())
    }

    fn transition(&mut self, id: &str, to: PhaseState, error: Option<PhaseError>) -> Result<()> {
        let from = self.phase(id)?.state;
        PhaseStateMachine::validate_transition(from, to)?;
        self.plan.record_transition(id, to, error)?;
        debug!(phase = %id, from = %from, to = %to, "Phase state changed");
        self.engine.progress.phase_changed(id, from, to);
        Ok(())
    }

    /// Picks up the state an earlier run left behind.
    fn resume(&mut self) -> Result<()> {
        let interrupted: Vec<String> = self
            .plan
            .phases
            .iter()
            .filter(|phase| phase.state == PhaseState::Running)
            .map(|phase| phase.id.clone())
            .collect();

        for id in interrupted {
            warn!(phase = %id, "Phase was interrupted while running");
            self.transition(
                &id,
                PhaseState::Failed,
                Some(PhaseError::new(
                    FailureKind::Execution,
                    "interrupted while running",
                )),
            )?;
        }

        let earlier: Vec<PhaseFailure> = self
            .plan
            .phases
            .iter()
            .filter(|phase| phase.state == PhaseState::Failed)
            .map(|phase| match &phase.error {
                Some(err) => PhaseFailure::new(phase, err.kind, err.message.clone()),
                None => PhaseFailure::new(phase, FailureKind::Execution, "failed"),
            })
            .collect();
        self.failures.extend(earlier);
        Ok(())
    }

    fn has_failed(&self) -> bool {
        self.plan
            .phases
            .iter()
            .any(|phase| matches!(phase.state, PhaseState::Failed | PhaseState::RolledBack))
    }

    async fn forward(&mut self, cancel: &CancellationToken) -> Result<()> {
        let max_parallel = self.engine.config.max_parallel.max(1);
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tasks: FuturesUnordered<PhaseTask> = FuturesUnordered::new();
        let mut halted = false;

        loop {
            if !halted && !cancel.is_cancelled() {
                for id in self.plan.runnable() {
                    if in_flight.len() >= max_parallel {
                        break;
                    }
                    if in_flight.contains(&id) {
                        continue;
                    }
                    tasks.push(self.start(&id, cancel)?);
                    in_flight.insert(id);
                }
            }

            let Some((id, joined)) = tasks.next().await else {
                break;
            };
            in_flight.remove(&id);

            let result = joined.unwrap_or_else(|e| {
                PhaseResult::Failed(PhaseError::new(
                    FailureKind::Execution,
                    format!("phase task aborted: {}", e),
                ))
            });

            match result {
                PhaseResult::Completed => {
                    info!(phase = %id, "Phase completed");
                    self.transition(&id, PhaseState::Completed, None)?;
                    self.report(ProgressMessage::step(format!("Phase {} completed", id)));
                }
                PhaseResult::Failed(err) => {
                    let failure = PhaseFailure::new(self.phase(&id)?, err.kind, err.message.clone());
                    error!(phase = %id, kind = %err.kind, error = %err.message, "Phase failed");
                    self.transition(&id, PhaseState::Failed, Some(err))?;
                    self.report(
                        ProgressMessage::step(format!("Phase {} failed", id))
                            .with_error(Error::new(failure.to_string())),
                    );
                    self.failures.push(failure);
                    if !halted {
                        info!("Not starting new phases after failure");
                        halted = true;
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            info!("Plan cancelled");
        }
        Ok(())
    }

    fn start(&mut self, id: &str, cancel: &CancellationToken) -> Result<PhaseTask> {
        self.transition(id, PhaseState::Running, None)?;
        self.report(ProgressMessage::step(format!("Starting phase {}", id)));

        let phase = self.phase(id)?.clone();
        let span = info_span!("phase_task", phase = %phase.id);
        let params = ExecutorParams::new(
            phase,
            Arc::new(self.plan.clone()),
            Arc::clone(&self.engine.progress),
        );
        let factory = Arc::clone(&self.engine.factory);
        let token = cancel.child_token();

        let handle = tokio::spawn(run_phase(factory, params, token).instrument(span));
        let id = id.to_string();
        Ok(async move { (id, handle.await) }.boxed())
    }

    /// Phases to roll back, latest completion first.
    ///
    /// The scope is every failed phase whose effect may have been applied,
    /// the completed phases it depends on, and every completed phase that
    /// depends on any of those. Phases whose rollback failed before are left
    /// alone.
    fn rollback_order(&self) -> Vec<String> {
        let plan = &self.plan;
        let completed = |id: &str| plan.state_of(id) == Some(PhaseState::Completed);

        let mut scope: BTreeSet<String> = BTreeSet::new();
        for phase in &plan.phases {
            let applied = phase.error.as_ref().map_or(true, |e| e.kind.has_effect());
            if phase.state == PhaseState::Failed && applied {
                scope.insert(phase.id.clone());
                scope.extend(
                    plan.prerequisites_of(&phase.id)
                        .into_iter()
                        .filter(|id| completed(id)),
                );
            }
        }

        let mut pending: Vec<String> = scope.iter().cloned().collect();
        while let Some(id) = pending.pop() {
            for dependent in plan.dependents_of(&id) {
                if completed(&dependent) && scope.insert(dependent.clone()) {
                    pending.push(dependent);
                }
            }
        }

        let mut order: Vec<(u64, usize, String)> = plan
            .phases
            .iter()
            .enumerate()
            .filter(|(_, phase)| scope.contains(&phase.id) && !rollback_failed(phase))
            .map(|(index, phase)| {
                let seq = plan
                    .last_change(&phase.id, &[PhaseState::Completed, PhaseState::Failed])
                    .unwrap_or(0);
                (seq, index, phase.id.clone())
            })
            .collect();
        order.sort_by(|a, b| b.cmp(a));
        order.into_iter().map(|(_, _, id)| id).collect()
    }

    async fn rollback(&mut self) -> Result<()> {
        let order = self.rollback_order();
        if order.is_empty() {
            return Ok(());
        }

        info!(phases = order.len(), "Rolling back plan");
        self.report(ProgressMessage::step("Rolling back"));

        let mut blocked: HashSet<String> = HashSet::new();
        for phase in self.plan.phases.iter().filter(|p| rollback_failed(p)) {
            blocked.extend(self.plan.prerequisites_of(&phase.id));
        }

        // Rollback must finish even when the run was cancelled.
        let cancel = CancellationToken::new();

        for id in order {
            if blocked.contains(&id) {
                warn!(phase = %id, "Skipping rollback, a dependent phase failed to roll back");
                self.report(ProgressMessage::step(format!(
                    "Skipping rollback of phase {}: a dependent phase failed to roll back",
                    id
                )));
                continue;
            }

            let params = ExecutorParams::new(
                self.phase(&id)?.clone(),
                Arc::new(self.plan.clone()),
                Arc::clone(&self.engine.progress),
            );
            let executor = match self.engine.factory.create(params) {
                Ok(executor) => executor,
                Err(e) => {
                    self.rollback_failed(&id, FailureKind::Rollback, e.to_string(), &mut blocked)?;
                    continue;
                }
            };
            if !executor.has_effect() {
                debug!(phase = %id, "Phase has no effect, nothing to roll back");
                continue;
            }

            info!(phase = %id, "Rolling back phase");
            self.report(ProgressMessage::step(format!("Rolling back phase {}", id)));
            let span = info_span!("phase_rollback", phase = %id);
            match executor.rollback(&cancel).instrument(span).await {
                Ok(()) => {
                    self.transition(&id, PhaseState::RolledBack, None)?;
                    self.report(ProgressMessage::step(format!("Phase {} rolled back", id)));
                }
                Err(e) => {
                    self.rollback_failed(&id, e.rollback_kind(), e.to_string(), &mut blocked)?
                }
            }
        }
        Ok(())
    }

    fn rollback_failed(
        &mut self,
        id: &str,
        kind: FailureKind,
        message: String,
        blocked: &mut HashSet<String>,
    ) -> Result<()> {
        error!(phase = %id, error = %message, "Rollback failed");

        let failure = PhaseFailure::new(self.phase(id)?, kind, message.clone());
        if let Some(phase) = self.plan.phases.iter_mut().find(|p| p.id == id) {
            phase.error = Some(PhaseError::new(kind, message));
        }
        blocked.extend(self.plan.prerequisites_of(id));

        self.report(
            ProgressMessage::step(format!("Failed to roll back phase {}", id))
                .with_error(Error::new(failure.to_string())),
        );
        self.rollback_failures.push(failure);
        Ok(())
    }

    fn finish(self, cancelled: bool) -> PlanOutcome {
        let outcome = PlanOutcome {
            plan: self.plan,
            failures: self.failures,
            rollback_failures: self.rollback_failures,
            cancelled,
        };

        let mut last = if outcome.is_success() {
            info!("Plan completed");
            ProgressMessage::completed("Operation completed")
        } else if outcome.failures.is_empty() && outcome.rollback_failures.is_empty() {
            warn!(cancelled, "Plan stopped before finishing");
            ProgressMessage::completed("Operation stopped")
                .with_error(Error::new(if cancelled {
                    "operation cancelled"
                } else {
                    "operation did not finish"
                }))
        } else {
            error!(
                failures = outcome.failures.len(),
                rollback_failures = outcome.rollback_failures.len(),
                "Plan failed"
            );
            ProgressMessage::completed("Operation failed")
        };
        for message in outcome.errors() {
            last = last.with_error(Error::new(message));
        }
        self.engine.progress.report(last);

        outcome
    }
}

fn rollback_failed(phase: &Phase) -> bool {
    matches!(
        &phase.error,
        Some(e) if matches!(e.kind, FailureKind::Rollback | FailureKind::Abort)
    )
}

async fn run_phase(
    factory: Arc<dyn ExecutorFactory>,
    params: ExecutorParams,
    cancel: CancellationToken,
) -> PhaseResult {
    let executor = match factory.create(params) {
        Ok(executor) => executor,
        Err(e) => return PhaseResult::Failed(PhaseError::new(FailureKind::Precondition, e.to_string())),
    };

    if let Err(e) = executor.pre_check(&cancel).await {
        return PhaseResult::Failed(PhaseError::new(FailureKind::Precondition, e.to_string()));
    }

    let attempts = executor.max_attempts().max(1);
    let mut attempt = 1;
    while let Err(e) = executor.execute(&cancel).await {
        if attempt >= attempts || cancel.is_cancelled() {
            let kind = if !executor.has_effect() {
                FailureKind::Precondition
            } else if e.is_protocol() {
                FailureKind::Protocol
            } else {
                FailureKind::Execution
            };
            return PhaseResult::Failed(PhaseError::new(kind, e.to_string()));
        }
        warn!(attempt, attempts, error = %e, "Phase execution failed, retrying");
        attempt += 1;
    }

    if let Err(e) = executor.post_check(&cancel).await {
        return PhaseResult::Failed(PhaseError::new(FailureKind::Execution, e.to_string()));
    }
    PhaseResult::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    fn plan() -> Plan {
        Plan::new("op", "example.com")
            .with_phase(Phase::new("/a", "mock"))
            .with_phase(Phase::new("/b", "mock").requires("/a"))
            .with_phase(Phase::new("/c", "mock").requires("/b"))
            .with_phase(Phase::new("/d", "mock"))
    }

    fn run(plan: Plan) -> PlanRunFixture {
        PlanRunFixture { plan }
    }

    struct PlanRunFixture {
        plan: Plan,
    }

    impl PlanRunFixture {
        fn transition(mut self, id: &str, to: PhaseState, kind: Option<FailureKind>) -> Self {
            let error = kind.map(|k| PhaseError::new(k, "boom"));
            self.plan.record_transition(id, to, error).unwrap();
            self
        }

        fn order(self) -> Vec<String> {
            struct NoFactory;
            impl ExecutorFactory for NoFactory {
                fn create(
                    &self,
                    _params: ExecutorParams,
                ) -> Result<Box<dyn crate::phase::PhaseExecutor>> {
                    Err(OrchestratorError::UnknownPhaseKind("mock".into()))
                }
            }
            struct NoSink;
            impl ProgressSink for NoSink {
                fn next_step(&self, _message: String) {}
                fn report(&self, _progress: ProgressMessage) {}
            }

            let engine = Engine::new(Arc::new(NoFactory), Arc::new(NoSink));
            let run = PlanRun {
                engine: &engine,
                plan: self.plan,
                failures: Vec::new(),
                rollback_failures: Vec::new(),
            };
            run.rollback_order()
        }
    }

    #[test]
    fn test_rollback_scope_covers_failed_chain() {
        let order = run(plan())
            .transition("/a", PhaseState::Running, None)
            .transition("/d", PhaseState::Running, None)
            .transition("/a", PhaseState::Completed, None)
            .transition("/d", PhaseState::Completed, None)
            .transition("/b", PhaseState::Running, None)
            .transition("/b", PhaseState::Completed, None)
            .transition("/c", PhaseState::Running, None)
            .transition("/c", PhaseState::Failed, Some(FailureKind::Execution))
            .order();

        // /d is unrelated to the failure and stays completed.
        assert_eq!(order, vec!["/c", "/b", "/a"]);
    }

    #[test]
    fn test_precondition_failure_has_empty_scope() {
        let order = run(plan())
            .transition("/a", PhaseState::Running, None)
            .transition("/a", PhaseState::Completed, None)
            .transition("/b", PhaseState::Running, None)
            .transition("/b", PhaseState::Failed, Some(FailureKind::Precondition))
            .order();

        assert!(order.is_empty());
    }

    #[test]
    fn test_completed_dependents_join_scope() {
        // /b depends on /a; /a's rollback scope pulls in /b even though /b
        // itself did not fail.
        let plan = Plan::new("op", "example.com")
            .with_phase(Phase::new("/a", "mock"))
            .with_phase(Phase::new("/b", "mock").requires("/a"))
            .with_phase(Phase::new("/c", "mock").requires("/a"));

        let order = run(plan)
            .transition("/a", PhaseState::Running, None)
            .transition("/a", PhaseState::Completed, None)
            .transition("/b", PhaseState::Running, None)
            .transition("/c", PhaseState::Running, None)
            .transition("/b", PhaseState::Completed, None)
            .transition("/c", PhaseState::Failed, Some(FailureKind::Protocol))
            .order();

        assert_eq!(order, vec!["/c", "/b", "/a"]);
    }

    #[test]
    fn test_failure_display_names_node() {
        let phase = Phase::new("/system", "system")
            .with_server(Server::new("10.0.0.1", "node-1"));
        let failure = PhaseFailure::new(&phase, FailureKind::Execution, "disk full");
        assert_eq!(
            failure.to_string(),
            "phase /system on node-1/10.0.0.1: execution failure: disk full"
        );
    }
}
