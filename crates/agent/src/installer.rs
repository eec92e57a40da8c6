//! The work an agent performs on behalf of the coordinator.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use installer_proto::ProgressMessage;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Sends progress of a running session to its Execute stream.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressMessage>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::Sender<ProgressMessage>) -> Self {
        Self { tx }
    }

    /// Returns false once the stream is gone.
    pub async fn send(&self, progress: ProgressMessage) -> bool {
        self.tx.send(progress).await.is_ok()
    }

    pub async fn step(&self, message: impl Into<String>) -> bool {
        self.send(ProgressMessage::step(message)).await
    }
}

/// Installation work driven by the agent service.
///
/// `execute` must return promptly once `cancel` fires. `abort` undoes
/// whatever a cancelled or finished `execute` left behind and is called at
/// most once per session.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn execute(&self, progress: ProgressSender, cancel: CancellationToken) -> Result<()>;

    async fn abort(&self) -> Result<()>;
}

/// Runs an external command and streams its standard output as progress.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: PathBuf,
    args: Vec<String>,
    abort_args: Option<Vec<String>>,
}

impl CommandInstaller {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            abort_args: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments the same program is invoked with to clean up after an
    /// aborted run.
    pub fn abort_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abort_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn execute(&self, progress: ProgressSender, cancel: CancellationToken) -> Result<()> {
        info!(program = %self.program.display(), args = ?self.args, "Starting installer");

        let mut child = self.command(&self.args).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::installer("installer stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::installer("installer stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut output = String::new();
            stderr.read_to_string(&mut output).await.map(|_| output)
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Installer cancelled, killing process");
                    let _ = child.kill().await;
                    return Err(AgentError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        progress.step(line).await;
                    }
                    None => break,
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(AgentError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr = match stderr_task.await {
            Ok(Ok(output)) => output,
            _ => String::new(),
        };

        if status.success() {
            debug!("Installer finished");
            Ok(())
        } else {
            let stderr = stderr.trim();
            if stderr.is_empty() {
                Err(AgentError::Installer(format!("installer exited with {}", status)))
            } else {
                Err(AgentError::Installer(format!(
                    "installer exited with {}: {}",
                    status, stderr
                )))
            }
        }
    }

    async fn abort(&self) -> Result<()> {
        let Some(args) = &self.abort_args else {
            debug!("No abort command configured");
            return Ok(());
        };

        info!(program = %self.program.display(), args = ?args, "Running abort command");
        let output = self.command(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::Installer(format!(
                "abort command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
