//! Error types for the sandbox layer.

/// Failures raised by the embedded interpreter.
///
/// `OperationLimit` is the typed abort signal raised at the counting
/// checkpoint; it is caught at the executor boundary and converted into an
/// error result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpreterError {
    #[error("Operation limit exceeded: {limit}")]
    OperationLimit { limit: u64 },

    #[error("undefined method or variable '{name}' for sandbox")]
    NotFound { name: String },

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("{0}")]
    Runtime(String),

    #[error("execution cancelled")]
    Cancelled,
}

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unsafe code rejected: {reason}")]
    UnsafeCode { reason: String },

    #[error("InterpreterError: {0}")]
    Interpreter(#[from] InterpreterError),

    #[error("execution timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("resource violation: {reason}")]
    Violation { reason: String },

    #[error("failed to spawn {runtime}: {reason}")]
    Spawn { runtime: String, reason: String },

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
