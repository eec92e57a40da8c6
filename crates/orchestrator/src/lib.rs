pub mod command;
pub mod engine;
pub mod error;
pub mod logger;
pub mod phase;
pub mod phases;
pub mod remote;
pub mod state_machine;

pub use command::InstallerCommand;
pub use engine::{Engine, EngineConfig, PhaseFailure, PlanOutcome};
pub use error::{OrchestratorError, Result};
pub use logger::PhaseLogger;
pub use phase::{ExecutorFactory, ExecutorParams, PhaseExecutor};
pub use phases::{DefaultFactory, SystemConfig};
pub use remote::{AgentRemote, LocalNode, Remote};
pub use state_machine::PhaseStateMachine;
