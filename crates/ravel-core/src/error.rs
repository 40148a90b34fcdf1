//! Error types for the execution core.

use ravel_domain::ModelError;
use ravel_queue::QueueError;
use ravel_sandbox::SandboxError;

/// Errors that escape the step loop.
///
/// Tool failures and code-execution errors never show up here: they are
/// captured into the step that produced them and fed back to the model.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid agent state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether this error came from a model backend that may succeed later.
    pub fn is_retriable(&self) -> bool {
        match self {
            AgentError::Model(e) => e.is_retriable(),
            AgentError::Queue(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(AgentError::from(ModelError::Timeout { elapsed_ms: 10 }).is_retriable());
        assert!(!AgentError::from(ModelError::Security("injection".into())).is_retriable());
        assert!(!AgentError::InvalidConfig("max_steps".into()).is_retriable());
    }

    #[test]
    fn test_display_wraps_source() {
        let err = AgentError::from(ModelError::Connection("refused".into()));
        assert_eq!(err.to_string(), "model error: connection failed: refused");
    }
}
