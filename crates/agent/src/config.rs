use serde::{Deserialize, Serialize};

/// Port the agent listens on unless configured otherwise.
pub const DEFAULT_AGENT_PORT: u16 = 3012;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the control protocol is served on
    pub listen_addr: String,
    /// Node identity reported by the health endpoint
    pub hostname: String,
    pub advertise_ip: String,
    /// Capacity of the per-session progress channel
    pub progress_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_AGENT_PORT),
            hostname: String::new(),
            advertise_ip: String::new(),
            progress_buffer: 64,
        }
    }
}

impl AgentConfig {
    pub fn new(hostname: impl Into<String>, advertise_ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_ip: advertise_ip.into(),
            ..Default::default()
        }
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }
}
