use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use install_core::{format_labels, Locator};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::InstallerCommand;
use crate::error::{OrchestratorError, Result};
use crate::logger::PhaseLogger;
use crate::phase::{ExecutorParams, PhaseExecutor};
use crate::remote::Remote;

/// Installer binary and log destinations used by system phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub binary: PathBuf,
    pub system_log: PathBuf,
    pub user_log: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/bin/installer"),
            system_log: PathBuf::from("/var/log/installer-system.log"),
            user_log: PathBuf::from("/var/log/installer.log"),
        }
    }
}

/// Installs a system service package on the local node.
///
/// The installer runs on this host, so the pre-check verifies that the
/// phase targets this host.
pub struct SystemExecutor {
    params: ExecutorParams,
    local: Arc<dyn Remote>,
    config: SystemConfig,
    package: Locator,
    logger: PhaseLogger,
}

impl SystemExecutor {
    pub fn new(params: ExecutorParams, local: Arc<dyn Remote>, config: SystemConfig) -> Result<Self> {
        params.require_server()?;
        let package = params
            .phase
            .data
            .package
            .clone()
            .ok_or_else(|| OrchestratorError::missing_data(&params.phase.id, "a package"))?;
        let logger = params.logger();

        Ok(Self {
            params,
            local,
            config,
            package,
            logger,
        })
    }

    /// Arguments of the installer's `system reinstall` action.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--debug".to_string(),
            "system".to_string(),
            "reinstall".to_string(),
            self.package.to_string(),
            "--system-log-file".to_string(),
            self.config.system_log.display().to_string(),
            "--log-file".to_string(),
            self.config.user_log.display().to_string(),
        ];
        let labels = &self.params.phase.data.labels;
        if !labels.is_empty() {
            args.push("--labels".to_string());
            args.push(format_labels(labels));
        }
        args
    }
}

#[async_trait]
impl PhaseExecutor for SystemExecutor {
    async fn pre_check(&self, cancel: &CancellationToken) -> Result<()> {
        let server = self.params.require_server()?;
        self.local.check_server(cancel, server).await
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let message = format!(
            "Installing system service {}:{}",
            self.package.name, self.package.version
        );
        self.params.next_step(message.clone());
        self.logger.info(&message);

        let command = InstallerCommand::new(&self.config.binary);
        match command.run(&self.args(), cancel).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::Command { output, .. }) => {
                let output = output.trim();
                if output.is_empty() {
                    Err(OrchestratorError::ExecutionFailed(
                        "failed to install system service".to_string(),
                    ))
                } else {
                    Err(OrchestratorError::ExecutionFailed(format!(
                        "failed to install system service: {}",
                        output
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
