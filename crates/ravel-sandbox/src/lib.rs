//! Ravel Sandbox - isolated code execution for agent runs
//!
//! Layer 1 crate providing:
//! - `ThreadExecutor`: dedicated-thread execution with a hard timeout
//! - `Sandbox`: capability-scoped interpreter with explicit name dispatch
//! - `LocalExecutor`: operation-limited in-process executor
//! - `ContainerExecutor`: locked-down out-of-process executor
//! - `redact_secrets`: credential scrubbing for error text

pub mod container;
pub mod error;
pub mod execution;
pub mod isolation;
pub mod limiter;
pub mod local;
pub mod redact;
pub mod safety;
pub mod sandbox;

pub use container::{sanitized_env, ContainerConfig, ContainerExecutor, HOST_RUNTIME};
pub use error::{InterpreterError, SandboxError, SandboxResult};
pub use execution::{parse_output, CodeExecutor, ExecutionResult};
pub use isolation::{
    CancelToken, IsolationMetrics, IsolationOutcome, IsolationResult, IsolationStatus,
    MeasuredOutput, ResourceLimits, ThreadExecutor,
};
pub use limiter::{Interrupt, LimitMode, Limiter};
pub use local::{LocalExecutor, LocalExecutorConfig};
pub use redact::{looks_like_secret_name, redact_secrets};
pub use safety::validate_code;
pub use sandbox::{
    Builtin, Dispatch, Evaluation, OutputBuffer, Sandbox, SandboxLimits, FUTURE_KEY,
};
