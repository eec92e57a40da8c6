//! Built-in phase kinds.
//!
//! - [`ChecksExecutor`] (`checks`) - verifies the target node, changes nothing
//! - [`SystemExecutor`] (`system`) - installs a system service with the installer binary
//! - [`AgentExecutor`] (`agent`) - drives the node's agent over the control protocol

mod agent;
mod checks;
mod system;

use std::sync::Arc;
use std::time::Duration;

use ::agent::{AgentClient, DEFAULT_AGENT_PORT};

pub use self::agent::AgentExecutor;
pub use checks::ChecksExecutor;
pub use system::{SystemConfig, SystemExecutor};

use crate::error::{OrchestratorError, Result};
use crate::phase::{ExecutorFactory, ExecutorParams, PhaseExecutor};
use crate::remote::Remote;

pub const CHECKS: &str = "checks";
pub const SYSTEM: &str = "system";
pub const AGENT: &str = "agent";

/// Builds the built-in executors from the phase kind tag.
///
/// `remote` checks nodes reached over the network, `local` checks that a
/// phase doing its work on this host targets this host.
pub struct DefaultFactory {
    remote: Arc<dyn Remote>,
    local: Arc<dyn Remote>,
    system: SystemConfig,
    agent_port: u16,
    agent_timeout: Duration,
}

impl DefaultFactory {
    pub fn new(remote: Arc<dyn Remote>, local: Arc<dyn Remote>, system: SystemConfig) -> Self {
        Self {
            remote,
            local,
            system,
            agent_port: DEFAULT_AGENT_PORT,
            agent_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    /// Timeout of unary agent calls such as abort.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }
}

impl ExecutorFactory for DefaultFactory {
    fn create(&self, params: ExecutorParams) -> Result<Box<dyn PhaseExecutor>> {
        let remote = Arc::clone(&self.remote);
        match params.phase.executor.as_str() {
            CHECKS => Ok(Box::new(ChecksExecutor::new(params, remote))),
            SYSTEM => Ok(Box::new(SystemExecutor::new(
                params,
                Arc::clone(&self.local),
                self.system.clone(),
            )?)),
            AGENT => {
                let server = params.require_server()?;
                let client = AgentClient::for_host(&server.advertise_ip, self.agent_port)
                    .with_timeout(self.agent_timeout);
                Ok(Box::new(AgentExecutor::new(params, remote, client)))
            }
            other => Err(OrchestratorError::UnknownPhaseKind(other.to_string())),
        }
    }
}
