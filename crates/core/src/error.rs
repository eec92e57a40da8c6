use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} requires unknown phase {requires}")]
    UnknownPrerequisite { phase: String, requires: String },

    #[error("Dependency cycle detected through phase {0}")]
    DependencyCycle(String),

    #[error("Invalid package locator: {0}")]
    InvalidLocator(String),

    #[error("Plan serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
