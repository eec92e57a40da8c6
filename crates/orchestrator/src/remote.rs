//! Reachability and identity checks of target nodes.

use std::time::Duration;

use agent::{AgentClient, DEFAULT_AGENT_PORT};
use async_trait::async_trait;
use install_core::Server;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait Remote: Send + Sync {
    /// Succeeds when `server` is reachable and identifies itself as the
    /// node the descriptor names.
    async fn check_server(&self, cancel: &CancellationToken, server: &Server) -> Result<()>;
}

/// Checks that a phase targets the node this process runs on.
///
/// Used by phases that do their work locally, such as `system`, which must
/// not run when the plan addresses another node.
#[derive(Debug, Clone)]
pub struct LocalNode {
    hostname: String,
    advertise_ip: String,
}

impl LocalNode {
    pub fn new(hostname: impl Into<String>, advertise_ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_ip: advertise_ip.into(),
        }
    }
}

#[async_trait]
impl Remote for LocalNode {
    async fn check_server(&self, _cancel: &CancellationToken, server: &Server) -> Result<()> {
        if server.hostname != self.hostname || server.advertise_ip != self.advertise_ip {
            return Err(OrchestratorError::remote_check(
                server,
                format!(
                    "phase must run on that node, this is {} ({})",
                    self.hostname, self.advertise_ip
                ),
            ));
        }
        Ok(())
    }
}

/// Checks a node by asking its agent for its identity.
#[derive(Debug, Clone)]
pub struct AgentRemote {
    port: u16,
    timeout: Duration,
}

impl Default for AgentRemote {
    fn default() -> Self {
        Self {
            port: DEFAULT_AGENT_PORT,
            timeout: Duration::from_secs(10),
        }
    }
}

impl AgentRemote {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Remote for AgentRemote {
    async fn check_server(&self, cancel: &CancellationToken, server: &Server) -> Result<()> {
        let client =
            AgentClient::for_host(&server.advertise_ip, self.port).with_timeout(self.timeout);
        debug!(server = %server, url = %client.base_url(), "Checking node");

        let identity = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            identity = client.identity() => identity
                .map_err(|e| OrchestratorError::remote_check(server, format!("unreachable: {}", e)))?,
        };

        if identity.hostname != server.hostname {
            return Err(OrchestratorError::remote_check(
                server,
                format!("node reports hostname {:?}", identity.hostname),
            ));
        }
        if identity.advertise_ip != server.advertise_ip {
            return Err(OrchestratorError::remote_check(
                server,
                format!("node reports advertise address {:?}", identity.advertise_ip),
            ));
        }
        Ok(())
    }
}
