use std::sync::Arc;

use ::agent::{AgentClient, AgentError};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::logger::PhaseLogger;
use crate::phase::{ExecutorParams, PhaseExecutor};
use crate::remote::Remote;

/// Runs the installation work of a node through the agent on that node.
pub struct AgentExecutor {
    params: ExecutorParams,
    remote: Arc<dyn Remote>,
    client: AgentClient,
    logger: PhaseLogger,
}

impl AgentExecutor {
    pub fn new(params: ExecutorParams, remote: Arc<dyn Remote>, client: AgentClient) -> Self {
        let logger = params.logger();
        Self {
            params,
            remote,
            client,
            logger,
        }
    }
}

#[async_trait]
impl PhaseExecutor for AgentExecutor {
    async fn pre_check(&self, cancel: &CancellationToken) -> Result<()> {
        let server = self.params.require_server()?;
        self.remote.check_server(cancel, server).await
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let server = self.params.require_server()?;
        self.params.next_step(format!("Executing operation on {}", server));
        self.logger.info(&format!("Opening execute stream to {}", self.client.base_url()));

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            stream = self.client.execute() => stream?,
        };

        let result = stream
            .wait(cancel, |progress| {
                if !progress.message.is_empty() {
                    self.params.next_step(progress.message.clone());
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(AgentError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(e) => {
                self.logger.warn(&format!("Agent operation failed: {}", e));
                Err(e.into())
            }
        }
    }

    async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        self.logger.info("Aborting agent operation");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            response = self.client.abort() => response?,
        };

        match response {
            None => Ok(()),
            Some(error) => Err(OrchestratorError::AbortFailed(error.message)),
        }
    }

    async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
