//! Error taxonomy for the model and tool capabilities.

/// Errors surfaced by a [`Model`](crate::Model) backend.
///
/// Retriable variants (timeouts, connection failures, rate limits, 5xx) are
/// eligible for dead-letter capture and manual retry. Everything else must
/// propagate immediately and is never retried automatically.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("model request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid model configuration: {0}")]
    Configuration(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    #[error("malformed tool schema: {0}")]
    InvalidToolSchema(String),
}

impl ModelError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ModelError::Timeout { .. }
            | ModelError::Connection(_)
            | ModelError::RateLimited(_) => true,
            ModelError::Server { status, .. } => *status >= 500 || *status == 429,
            ModelError::Configuration(_)
            | ModelError::Security(_)
            | ModelError::InvalidResponse(_)
            | ModelError::InvalidToolSchema(_) => false,
        }
    }

    /// Short machine-readable kind, used for dead-letter bookkeeping and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::Timeout { .. } => "timeout",
            ModelError::Connection(_) => "connection",
            ModelError::RateLimited(_) => "rate_limited",
            ModelError::Server { .. } => "server",
            ModelError::Configuration(_) => "configuration",
            ModelError::Security(_) => "security",
            ModelError::InvalidResponse(_) => "invalid_response",
            ModelError::InvalidToolSchema(_) => "invalid_tool_schema",
        }
    }
}

/// Errors produced while executing a [`Tool`](crate::Tool).
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    NotFound { name: String },

    #[error("invalid arguments for tool {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("tool {tool} timed out after {elapsed_ms}ms")]
    Timeout { tool: String, elapsed_ms: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(ModelError::Timeout { elapsed_ms: 10 }.is_retriable());
        assert!(ModelError::Connection("reset".into()).is_retriable());
        assert!(ModelError::RateLimited("slow down".into()).is_retriable());
        assert!(ModelError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retriable());
        assert!(ModelError::Server {
            status: 429,
            message: "too many".into()
        }
        .is_retriable());

        assert!(!ModelError::Server {
            status: 400,
            message: "bad request".into()
        }
        .is_retriable());
        assert!(!ModelError::Configuration("missing key".into()).is_retriable());
        assert!(!ModelError::Security("prompt injection".into()).is_retriable());
        assert!(!ModelError::InvalidToolSchema("no name".into()).is_retriable());
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::NotFound {
            name: "web_search".into(),
        };
        assert!(err.to_string().contains("web_search"));

        let err = ToolError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.to_string(), "disk on fire");
    }
}
