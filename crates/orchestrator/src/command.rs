use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Runs the installer binary on the local node.
#[derive(Debug, Clone)]
pub struct InstallerCommand {
    program: PathBuf,
}

impl InstallerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs the installer to completion and returns its combined output.
    ///
    /// On a non-zero exit the output travels with the error. The child is
    /// killed when `cancel` fires.
    pub async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<String> {
        debug!("Running {} {:?}", self.program.display(), args);

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(OrchestratorError::Command {
                message: format!("{} exited with {}", self.program.display(), output.status),
                output: combined,
            });
        }

        Ok(combined)
    }
}
