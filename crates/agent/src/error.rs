use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use installer_proto::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("An operation is already running on this agent")]
    AlreadyRunning,

    #[error("Agent is shutting down")]
    ShuttingDown,

    #[error("Malformed message: {0}")]
    Codec(#[from] CodecError),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Agent returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Installer failed: {0}")]
    Installer(String),

    #[error("Operation failed: {}", errors.join("; "))]
    Execution { errors: Vec<String> },

    #[error("Operation outcome unknown: {0}")]
    Indeterminate(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn installer(message: impl Into<String>) -> Self {
        Self::Installer(message.into())
    }

    /// Whether the failure comes from the stream itself rather than from the
    /// work the agent performed. The work may or may not have finished.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Indeterminate(_) | Self::Codec(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match self {
            AgentError::AlreadyRunning => StatusCode::CONFLICT,
            AgentError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::Codec(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!(error = %self, "Agent request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, self.to_string()).into_response()
    }
}
