use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use events::ProgressSink;
use install_core::{FailureKind, Phase, PhaseError, PhaseState, Plan, Server};
use installer_proto::ProgressMessage;
use orchestrator::{
    Engine, EngineConfig, ExecutorFactory, ExecutorParams, OrchestratorError, PhaseExecutor,
    Result,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Behavior {
    fail_pre_check: bool,
    /// Number of execute calls that fail before one succeeds
    fail_executes: AtomicU32,
    fail_rollback: bool,
    fail_abort: bool,
    no_effect: bool,
    max_attempts: u32,
    delay: Duration,
    wait_for_cancel: bool,
}

impl Behavior {
    fn failing(times: u32) -> Self {
        Self {
            fail_executes: AtomicU32::new(times),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, usize>>,
    max_same_phase: AtomicUsize,
    total_running: AtomicUsize,
    max_total: AtomicUsize,
}

impl Recorder {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn enter(&self, id: &str) {
        let mut running = self.running.lock().unwrap();
        let count = running.entry(id.to_string()).or_insert(0);
        *count += 1;
        self.max_same_phase.fetch_max(*count, Ordering::SeqCst);
        let total = self.total_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);
    }

    fn exit(&self, id: &str) {
        let mut running = self.running.lock().unwrap();
        if let Some(count) = running.get_mut(id) {
            *count -= 1;
        }
        self.total_running.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockExecutor {
    id: String,
    behavior: Arc<Behavior>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl PhaseExecutor for MockExecutor {
    async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
        self.recorder.record(format!("pre_check:{}", self.id));
        if self.behavior.fail_pre_check {
            return Err(OrchestratorError::ExecutionFailed("node unreachable".into()));
        }
        Ok(())
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.record(format!("execute:{}", self.id));
        self.recorder.enter(&self.id);

        let result = async {
            if self.behavior.wait_for_cancel {
                cancel.cancelled().await;
                return Err(OrchestratorError::Cancelled);
            }
            if !self.behavior.delay.is_zero() {
                tokio::time::sleep(self.behavior.delay).await;
            }
            let failed = self
                .behavior
                .fail_executes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(OrchestratorError::ExecutionFailed(format!(
                    "{} broke",
                    self.id
                )));
            }
            Ok(())
        }
        .await;

        self.recorder.exit(&self.id);
        if result.is_ok() {
            self.recorder.record(format!("done:{}", self.id));
        }
        result
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<()> {
        self.recorder.record(format!("rollback:{}", self.id));
        if self.behavior.fail_rollback {
            return Err(OrchestratorError::RollbackFailed("cleanup failed".into()));
        }
        if self.behavior.fail_abort {
            return Err(OrchestratorError::AbortFailed("installer busy".into()));
        }
        Ok(())
    }

    async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
        self.recorder.record(format!("post_check:{}", self.id));
        Ok(())
    }

    fn has_effect(&self) -> bool {
        !self.behavior.no_effect
    }

    fn max_attempts(&self) -> u32 {
        self.behavior.max_attempts.max(1)
    }
}

#[derive(Default)]
struct MockFactory {
    behaviors: HashMap<String, Arc<Behavior>>,
    recorder: Arc<Recorder>,
}

impl MockFactory {
    fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(id.to_string(), Arc::new(behavior));
        self
    }
}

impl ExecutorFactory for MockFactory {
    fn create(&self, params: ExecutorParams) -> Result<Box<dyn PhaseExecutor>> {
        let id = params.phase.id.clone();
        let behavior = self.behaviors.get(&id).cloned().unwrap_or_default();
        Ok(Box::new(MockExecutor {
            id,
            behavior,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<ProgressMessage>>,
    changes: Mutex<Vec<(String, PhaseState, PhaseState)>>,
}

impl RecordingSink {
    fn completes(&self) -> Vec<ProgressMessage> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.complete)
            .cloned()
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn next_step(&self, _message: String) {}

    fn report(&self, progress: ProgressMessage) {
        self.reports.lock().unwrap().push(progress);
    }

    fn phase_changed(&self, phase_id: &str, from: PhaseState, to: PhaseState) {
        self.changes
            .lock()
            .unwrap()
            .push((phase_id.to_string(), from, to));
    }
}

struct Harness {
    engine: Engine,
    recorder: Arc<Recorder>,
    sink: Arc<RecordingSink>,
}

fn harness(factory: MockFactory, config: EngineConfig) -> Harness {
    let recorder = Arc::clone(&factory.recorder);
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new(Arc::new(factory), Arc::clone(&sink) as Arc<dyn ProgressSink>)
        .with_config(config);
    Harness {
        engine,
        recorder,
        sink,
    }
}

fn chain(ids: &[&str]) -> Plan {
    let mut plan = Plan::new("op-1", "example.com");
    let mut previous: Option<&str> = None;
    for id in ids {
        let mut phase = Phase::new(*id, "mock");
        if let Some(prev) = previous {
            phase = phase.requires(prev);
        }
        plan = plan.with_phase(phase);
        previous = Some(id);
    }
    plan
}

#[tokio::test]
async fn test_prerequisites_complete_before_dependents_start() {
    let slow = || Behavior {
        delay: Duration::from_millis(20),
        ..Default::default()
    };
    let plan = Plan::new("op-1", "example.com")
        .with_phase(Phase::new("/a", "mock"))
        .with_phase(Phase::new("/b", "mock").requires("/a"))
        .with_phase(Phase::new("/c", "mock").requires("/a"))
        .with_phase(Phase::new("/d", "mock").requires("/b").requires("/c"));
    let factory = MockFactory::default()
        .with("/a", slow())
        .with("/b", slow())
        .with("/c", slow())
        .with("/d", slow());
    let h = harness(factory, EngineConfig::default());

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert!(outcome.is_success());
    let rec = &h.recorder;
    for (phase, prerequisite) in [("/b", "/a"), ("/c", "/a"), ("/d", "/b"), ("/d", "/c")] {
        let done = rec.position(&format!("done:{}", prerequisite)).unwrap();
        let started = rec.position(&format!("pre_check:{}", phase)).unwrap();
        assert!(
            done < started,
            "{} started before {} finished",
            phase,
            prerequisite
        );
    }
}

#[tokio::test]
async fn test_independent_phases_respect_parallel_limit() {
    let mut plan = Plan::new("op-1", "example.com");
    let mut factory = MockFactory::default();
    for i in 0..5 {
        let id = format!("/node-{}", i);
        plan = plan.with_phase(Phase::new(id.as_str(), "mock"));
        factory = factory.with(
            &id,
            Behavior {
                delay: Duration::from_millis(30),
                ..Default::default()
            },
        );
    }
    let h = harness(factory, EngineConfig::default().with_max_parallel(2));

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(h.recorder.max_total.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retries_never_overlap() {
    let plan = chain(&["/install"]).with_phase(Phase::new("/other", "mock"));
    let factory = MockFactory::default()
        .with(
            "/install",
            Behavior {
                max_attempts: 3,
                delay: Duration::from_millis(10),
                ..Behavior::failing(2)
            },
        )
        .with(
            "/other",
            Behavior {
                delay: Duration::from_millis(10),
                ..Default::default()
            },
        );
    let h = harness(factory, EngineConfig::default());

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(h.recorder.count("execute:/install"), 3);
    assert_eq!(h.recorder.count("pre_check:/install"), 1);
    assert_eq!(h.recorder.max_same_phase.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rollback_runs_in_reverse_completion_order() {
    let factory = MockFactory::default().with("/c", Behavior::failing(1));
    let h = harness(factory, EngineConfig::default());

    let outcome = h
        .engine
        .run(chain(&["/a", "/b", "/c"]), CancellationToken::new())
        .await
        .unwrap();

    let rollbacks: Vec<String> = h
        .recorder
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("rollback:"))
        .collect();
    assert_eq!(rollbacks, vec!["rollback:/c", "rollback:/b", "rollback:/a"]);
    for id in ["/a", "/b", "/c"] {
        assert_eq!(outcome.plan.state_of(id), Some(PhaseState::RolledBack));
    }
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].phase_id, "/c");
    assert_eq!(outcome.failures[0].kind, FailureKind::Execution);
}

#[tokio::test]
async fn test_failed_service_install_rolls_back_only_itself() {
    let plan = Plan::new("op-1", "example.com")
        .with_phase(Phase::new("/checkNode", "mock"))
        .with_phase(Phase::new("/installService", "mock").requires("/checkNode"))
        .with_phase(Phase::new("/startService", "mock").requires("/installService"));
    let factory = MockFactory::default()
        .with(
            "/checkNode",
            Behavior {
                no_effect: true,
                ..Default::default()
            },
        )
        .with("/installService", Behavior::failing(1));
    let h = harness(factory, EngineConfig::default());

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    let calls = h.recorder.calls();
    let rollbacks: Vec<&String> = calls.iter().filter(|c| c.starts_with("rollback:")).collect();
    assert_eq!(rollbacks, vec!["rollback:/installService"]);
    assert!(!calls.contains(&"pre_check:/startService".to_string()));

    let changes = h.sink.changes.lock().unwrap().clone();
    assert!(changes.contains(&(
        "/installService".to_string(),
        PhaseState::Running,
        PhaseState::Failed
    )));
    assert_eq!(
        outcome.plan.state_of("/installService"),
        Some(PhaseState::RolledBack)
    );
    assert_eq!(outcome.plan.state_of("/checkNode"), Some(PhaseState::Completed));
    assert_eq!(outcome.plan.state_of("/startService"), Some(PhaseState::Unstarted));
    assert!(!outcome.is_success());
}

#[tokio::test]
async fn test_resume_does_not_repeat_completed_phases() {
    let factory = MockFactory::default();
    let h = harness(factory, EngineConfig::default());

    // A previous run completed /p1 and /p2 and stopped before /p3.
    let mut plan = chain(&["/p1", "/p2", "/p3"]);
    for id in ["/p1", "/p2"] {
        plan.record_transition(id, PhaseState::Running, None).unwrap();
        plan.record_transition(id, PhaseState::Completed, None).unwrap();
    }

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(h.recorder.count("execute:/p1"), 0);
    assert_eq!(h.recorder.count("execute:/p2"), 0);
    assert_eq!(h.recorder.count("execute:/p3"), 1);

    // Running the finished plan again does nothing.
    let again = h.engine.run(outcome.plan, CancellationToken::new()).await.unwrap();
    assert!(again.is_success());
    assert_eq!(h.recorder.count("execute:/p3"), 1);
}

#[tokio::test]
async fn test_interrupted_phase_is_failed_and_rolled_back() {
    let h = harness(MockFactory::default(), EngineConfig::default());

    let mut plan = chain(&["/a", "/b", "/c"]);
    plan.record_transition("/a", PhaseState::Running, None).unwrap();
    plan.record_transition("/a", PhaseState::Completed, None).unwrap();
    plan.record_transition("/b", PhaseState::Running, None).unwrap();

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert_eq!(h.recorder.count("execute:/b"), 0);
    assert_eq!(h.recorder.count("execute:/c"), 0);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].phase_id, "/b");
    let rollbacks: Vec<String> = h
        .recorder
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("rollback:"))
        .collect();
    assert_eq!(rollbacks, vec!["rollback:/b", "rollback:/a"]);
}

#[tokio::test]
async fn test_precondition_failure_does_not_roll_back() {
    let factory = MockFactory::default().with(
        "/b",
        Behavior {
            fail_pre_check: true,
            ..Default::default()
        },
    );
    let h = harness(factory, EngineConfig::default());

    let outcome = h
        .engine
        .run(chain(&["/a", "/b", "/c"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.recorder.count("execute:/b"), 0);
    assert!(h.recorder.calls().iter().all(|c| !c.starts_with("rollback:")));
    assert_eq!(outcome.failures[0].kind, FailureKind::Precondition);
    assert_eq!(outcome.plan.state_of("/a"), Some(PhaseState::Completed));
    assert_eq!(outcome.plan.state_of("/b"), Some(PhaseState::Failed));
}

#[tokio::test]
async fn test_failed_rollback_blocks_prerequisites() {
    let factory = MockFactory::default()
        .with(
            "/b",
            Behavior {
                fail_rollback: true,
                ..Default::default()
            },
        )
        .with("/c", Behavior::failing(1));
    let h = harness(factory, EngineConfig::default());

    let outcome = h
        .engine
        .run(chain(&["/a", "/b", "/c"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.recorder.count("rollback:/b"), 1);
    assert_eq!(h.recorder.count("rollback:/a"), 0);
    assert_eq!(outcome.rollback_failures.len(), 1);
    assert_eq!(outcome.rollback_failures[0].phase_id, "/b");
    assert_eq!(outcome.rollback_failures[0].kind, FailureKind::Rollback);
    assert_eq!(outcome.plan.state_of("/a"), Some(PhaseState::Completed));
    assert_eq!(outcome.plan.state_of("/c"), Some(PhaseState::RolledBack));
}

#[tokio::test]
async fn test_failed_abort_is_recorded_as_abort() {
    let factory = MockFactory::default()
        .with(
            "/b",
            Behavior {
                fail_abort: true,
                ..Default::default()
            },
        )
        .with("/c", Behavior::failing(1));
    let h = harness(factory, EngineConfig::default());

    let outcome = h
        .engine
        .run(chain(&["/a", "/b", "/c"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.rollback_failures.len(), 1);
    assert_eq!(outcome.rollback_failures[0].kind, FailureKind::Abort);
    assert_eq!(
        outcome.plan.phase("/b").and_then(|p| p.error.as_ref()).map(|e| e.kind),
        Some(FailureKind::Abort)
    );
    assert_eq!(h.recorder.count("rollback:/a"), 0);
}

#[tokio::test]
async fn test_earlier_abort_failure_blocks_prerequisites() {
    let h = harness(MockFactory::default(), EngineConfig::default());
    let mut plan = chain(&["/a", "/b", "/c"]);
    plan.phases[0].state = PhaseState::Completed;
    plan.phases[1].state = PhaseState::Completed;
    plan.phases[1].error = Some(PhaseError::new(FailureKind::Abort, "installer busy"));
    plan.phases[2].state = PhaseState::Failed;
    plan.phases[2].error = Some(PhaseError::new(FailureKind::Execution, "disk full"));

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert_eq!(h.recorder.count("rollback:/c"), 1);
    assert_eq!(h.recorder.count("rollback:/b"), 0);
    assert_eq!(h.recorder.count("rollback:/a"), 0);
    assert_eq!(outcome.plan.state_of("/a"), Some(PhaseState::Completed));
    assert_eq!(outcome.plan.state_of("/c"), Some(PhaseState::RolledBack));
}

#[tokio::test]
async fn test_rollback_can_be_disabled() {
    let factory = MockFactory::default().with("/b", Behavior::failing(1));
    let h = harness(
        factory,
        EngineConfig::default().with_rollback_on_failure(false),
    );

    let outcome = h
        .engine
        .run(chain(&["/a", "/b"]), CancellationToken::new())
        .await
        .unwrap();

    assert!(h.recorder.calls().iter().all(|c| !c.starts_with("rollback:")));
    assert_eq!(outcome.plan.state_of("/b"), Some(PhaseState::Failed));
}

#[tokio::test]
async fn test_complete_is_reported_exactly_once() {
    let h = harness(MockFactory::default(), EngineConfig::default());
    h.engine
        .run(chain(&["/a", "/b"]), CancellationToken::new())
        .await
        .unwrap();

    let completes = h.sink.completes();
    assert_eq!(completes.len(), 1);
    assert!(completes[0].errors.is_empty());
    assert!(h.sink.reports.lock().unwrap().last().unwrap().complete);

    let factory = MockFactory::default().with("/b", Behavior::failing(1));
    let h = harness(factory, EngineConfig::default());
    h.engine
        .run(chain(&["/a", "/b"]), CancellationToken::new())
        .await
        .unwrap();

    let completes = h.sink.completes();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].errors.len(), 1);
    assert!(completes[0].errors[0].message.contains("/b broke"));
}

#[tokio::test]
async fn test_cancel_stops_new_phases_and_unwinds() {
    let factory = MockFactory::default().with(
        "/a",
        Behavior {
            wait_for_cancel: true,
            ..Default::default()
        },
    );
    let h = harness(factory, EngineConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = h.engine.run(chain(&["/a", "/b"]), cancel).await.unwrap();

    assert!(outcome.cancelled);
    assert_eq!(h.recorder.count("pre_check:/b"), 0);
    assert_eq!(outcome.plan.state_of("/a"), Some(PhaseState::RolledBack));
    assert_eq!(outcome.plan.state_of("/b"), Some(PhaseState::Unstarted));
    assert_eq!(h.sink.completes().len(), 1);
}

#[tokio::test]
async fn test_failed_plan_makes_no_forward_progress() {
    let h = harness(MockFactory::default(), EngineConfig::default());

    let mut plan = chain(&["/a", "/b"]).with_phase(Phase::new("/c", "mock"));
    plan.record_transition("/a", PhaseState::Running, None).unwrap();
    plan.record_transition("/a", PhaseState::Failed, None).unwrap();
    plan.record_transition("/a", PhaseState::RolledBack, None).unwrap();

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    assert!(h.recorder.calls().is_empty());
    assert_eq!(outcome.plan.state_of("/c"), Some(PhaseState::Unstarted));
    assert!(!outcome.is_success());
    assert_eq!(h.sink.completes().len(), 1);
}

#[tokio::test]
async fn test_invalid_plan_is_rejected() {
    let h = harness(MockFactory::default(), EngineConfig::default());
    let plan = Plan::new("op-1", "example.com")
        .with_phase(Phase::new("/a", "mock").requires("/b"))
        .with_phase(Phase::new("/b", "mock").requires("/a"));

    let result = h.engine.run(plan, CancellationToken::new()).await;

    assert!(matches!(result, Err(OrchestratorError::Core(_))));
    assert!(h.recorder.calls().is_empty());
}

#[tokio::test]
async fn test_failures_carry_node_identity() {
    let plan = Plan::new("op-1", "example.com").with_phase(
        Phase::new("/install", "mock").with_server(Server::new("10.0.0.7", "node-7")),
    );
    let factory = MockFactory::default().with("/install", Behavior::failing(1));
    let h = harness(factory, EngineConfig::default());

    let outcome = h.engine.run(plan, CancellationToken::new()).await.unwrap();

    let failure = &outcome.failures[0];
    assert_eq!(failure.server.as_ref().unwrap().hostname, "node-7");
    assert!(failure.to_string().contains("node-7/10.0.0.7"));
}
