use std::path::{Path, PathBuf};
use std::time::Duration;

use agent::{AgentConfig, DEFAULT_AGENT_PORT};
use anyhow::{Context, Result};
use orchestrator::{EngineConfig, LocalNode, SystemConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "installer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub agent: AgentSection,
    pub installer: SystemConfig,
    pub engine: EngineSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            agent: AgentSection::default(),
            installer: SystemConfig::default(),
            engine: EngineSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub listen_addr: String,
    pub port: u16,
    pub hostname: Option<String>,
    pub advertise_ip: Option<String>,
    pub command: CommandSection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: DEFAULT_AGENT_PORT,
            hostname: None,
            advertise_ip: None,
            command: CommandSection::default(),
        }
    }
}

/// Installer invocation the agent runs for an Execute session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSection {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Cleanup invocation run on Abort; empty means nothing to clean up
    pub abort_args: Vec<String>,
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/local/bin/installer"),
            args: vec!["install".to_string()],
            abort_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_parallel: usize,
    pub rollback_on_failure: bool,
    pub check_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    /// Port the agents of target nodes listen on
    pub agent_port: u16,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_parallel: engine.max_parallel,
            rollback_on_failure: engine.rollback_on_failure,
            check_timeout_secs: 10,
            agent_timeout_secs: 30,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl EngineSection {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_parallel(self.max_parallel)
            .with_rollback_on_failure(self.rollback_on_failure)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

impl Config {
    /// Loads the configuration file.
    ///
    /// Without an explicit path a missing `installer.toml` in the working
    /// directory yields the defaults. An explicit path must exist.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Hostname and advertise address of this node, flags first.
    async fn node_identity(
        &self,
        hostname: Option<String>,
        advertise_ip: Option<String>,
    ) -> Result<(String, String)> {
        let hostname = match hostname.or_else(|| self.agent.hostname.clone()) {
            Some(hostname) => hostname,
            None => local_hostname().await?,
        };
        let advertise_ip = advertise_ip
            .or_else(|| self.agent.advertise_ip.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Ok((hostname, advertise_ip))
    }

    /// Agent settings with command line overrides applied.
    pub async fn agent_config(
        &self,
        hostname: Option<String>,
        advertise_ip: Option<String>,
    ) -> Result<AgentConfig> {
        let (hostname, advertise_ip) = self.node_identity(hostname, advertise_ip).await?;
        Ok(AgentConfig::new(hostname, advertise_ip)
            .with_listen_addr(format!("{}:{}", self.agent.listen_addr, self.agent.port)))
    }

    /// Identity of the node running a plan, checked by phases that do
    /// their work on this host.
    pub async fn local_node(&self) -> Result<LocalNode> {
        let (hostname, advertise_ip) = self.node_identity(None, None).await?;
        Ok(LocalNode::new(hostname, advertise_ip))
    }
}

async fn local_hostname() -> Result<String> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return Ok(hostname);
        }
    }
    let hostname = tokio::fs::read_to_string("/etc/hostname")
        .await
        .context("Agent hostname is not configured and /etc/hostname is unreadable")?;
    Ok(hostname.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::Remote;

    #[tokio::test]
    async fn test_defaults_without_file() {
        let config = Config::load(None).await.unwrap();
        assert_eq!(config.agent.port, DEFAULT_AGENT_PORT);
        assert_eq!(config.engine.max_parallel, 8);
        assert!(config.engine.rollback_on_failure);
        assert_eq!(config.log_level, "info");
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        tokio::fs::write(
            &path,
            r#"
log_level = "debug"

[agent]
hostname = "node-1"
advertise_ip = "10.0.0.5"
port = 4000

[agent.command]
program = "/opt/bin/setup"
abort_args = ["cleanup"]

[engine]
max_parallel = 2
rollback_on_failure = false
"#,
        )
        .await
        .unwrap();

        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.agent.command.program, PathBuf::from("/opt/bin/setup"));
        assert_eq!(config.agent.command.args, vec!["install".to_string()]);
        assert_eq!(config.engine.max_parallel, 2);
        assert_eq!(config.engine.agent_port, DEFAULT_AGENT_PORT);
        assert_eq!(
            config.installer.binary,
            PathBuf::from("/usr/local/bin/installer")
        );

        let agent = config.agent_config(None, None).await.unwrap();
        assert_eq!(agent.listen_addr, "0.0.0.0:4000");
        assert_eq!(agent.hostname, "node-1");
        assert_eq!(agent.advertise_ip, "10.0.0.5");

        let local = config.local_node().await.unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        local
            .check_server(&cancel, &install_core::Server::new("10.0.0.5", "node-1"))
            .await
            .unwrap();
        assert!(local
            .check_server(&cancel, &install_core::Server::new("10.0.0.6", "node-2"))
            .await
            .is_err());

        let engine = config.engine.engine_config();
        assert_eq!(engine.max_parallel, 2);
        assert!(!engine.rollback_on_failure);
    }

    #[tokio::test]
    async fn test_flags_override_file() {
        let config = Config::default();
        let agent = config
            .agent_config(Some("node-9".to_string()), Some("10.1.1.1".to_string()))
            .await
            .unwrap();
        assert_eq!(agent.hostname, "node-9");
        assert_eq!(agent.advertise_ip, "10.1.1.1");
    }

    #[tokio::test]
    async fn test_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installer.toml");
        tokio::fs::write(&path, "[engine\nmax_parallel = ").await.unwrap();

        let err = Config::load(Some(&path)).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
