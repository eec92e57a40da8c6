use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::logger::PhaseLogger;
use crate::phase::{ExecutorParams, PhaseExecutor};
use crate::remote::Remote;

/// Verifies that the target node is reachable and is the node the plan
/// expects.
pub struct ChecksExecutor {
    params: ExecutorParams,
    remote: Arc<dyn Remote>,
    logger: PhaseLogger,
}

impl ChecksExecutor {
    pub fn new(params: ExecutorParams, remote: Arc<dyn Remote>) -> Self {
        let logger = params.logger();
        Self {
            params,
            remote,
            logger,
        }
    }
}

#[async_trait]
impl PhaseExecutor for ChecksExecutor {
    async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
        self.params.require_server().map(|_| ())
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let server = self.params.require_server()?;
        self.params.next_step(format!("Checking node {}", server));
        self.logger.info(&format!("Checking node {}", server));
        self.remote.check_server(cancel, server).await
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn has_effect(&self) -> bool {
        false
    }
}
