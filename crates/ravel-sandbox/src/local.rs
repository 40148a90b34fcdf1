//! In-process executor: operation-limited interpreter on an isolated thread.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use ravel_domain::{RetrievalMatcher, Toolbox};

use crate::error::{SandboxError, SandboxResult};
use crate::execution::{CodeExecutor, ExecutionResult};
use crate::isolation::{IsolationOutcome, ResourceLimits, ThreadExecutor};
use crate::limiter::{LimitMode, Limiter};
use crate::redact::redact_secrets;
use crate::safety::validate_code;
use crate::sandbox::{Evaluation, OutputBuffer, Sandbox, SandboxLimits};

/// Configuration for [`LocalExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalExecutorConfig {
    /// Ceiling for the operation limiter. `0` disables it.
    pub max_operations: u64,
    pub limit_mode: LimitMode,
    pub limits: ResourceLimits,
    pub sandbox: SandboxLimits,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            limit_mode: LimitMode::Operations,
            limits: ResourceLimits::default(),
            sandbox: SandboxLimits::default(),
        }
    }
}

/// Executes code in the capability-scoped [`Sandbox`].
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    sandbox: Sandbox,
    config: LocalExecutorConfig,
}

impl LocalExecutor {
    pub fn new(toolbox: Toolbox) -> Self {
        Self::with_config(toolbox, LocalExecutorConfig::default())
    }

    pub fn with_config(toolbox: Toolbox, config: LocalExecutorConfig) -> Self {
        let sandbox = Sandbox::new(toolbox).with_limits(config.sandbox.clone());
        Self { sandbox, config }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.sandbox.set_variable(name, value);
        self
    }

    pub fn with_retrieval_matcher(mut self, matcher: RetrievalMatcher) -> Self {
        self.sandbox = self.sandbox.with_retrieval_matcher(matcher);
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.sandbox.set_variable(name, value);
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn config(&self) -> &LocalExecutorConfig {
        &self.config
    }

    fn to_result(evaluation: Evaluation) -> ExecutionResult {
        let Evaluation {
            value,
            final_answer,
            output,
            ..
        } = evaluation;
        match (value, final_answer) {
            (Ok(answer), Some(_)) => ExecutionResult::final_answer(answer, output),
            (Ok(value), None) => ExecutionResult::success(value, output),
            (Err(e), _) => {
                ExecutionResult::failure(redact_secrets(&SandboxError::from(e).to_string()), output)
            }
        }
    }
}

#[async_trait]
impl CodeExecutor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, code: &str) -> SandboxResult<ExecutionResult> {
        validate_code(code)?;
        self.sandbox.clear_pending();

        let sandbox = self.sandbox.clone();
        let code = code.to_string();
        let config = self.config.clone();
        let runtime = Handle::try_current().ok();
        let output = OutputBuffer::new();
        let captured = output.clone();

        let isolated = tokio::task::spawn_blocking(move || {
            ThreadExecutor::new(config.limits.clone())
                .with_thread_name("ravel-local-exec")
                .execute(move |cancel| {
                    let limiter = Limiter::new(config.limit_mode, config.max_operations, cancel);
                    Ok(sandbox.instance_eval_into(&code, &limiter, runtime, output))
                })
        })
        .await
        .map_err(|e| SandboxError::Spawn {
            runtime: "local".to_string(),
            reason: e.to_string(),
        })?;

        let metrics = isolated.metrics;
        let result = match isolated.outcome {
            IsolationOutcome::Success(evaluation) => Self::to_result(evaluation),
            IsolationOutcome::Timeout { limit_ms } => {
                warn!(event = "sandbox.timeout", executor = "local", limit_ms = limit_ms);
                ExecutionResult::failure(
                    SandboxError::Timeout {
                        elapsed_ms: metrics.duration_ms,
                        limit_ms,
                    }
                    .to_string(),
                    captured.contents(),
                )
            }
            IsolationOutcome::Violation { reason } => {
                warn!(event = "sandbox.violation", executor = "local", reason = %reason);
                ExecutionResult::failure(
                    SandboxError::Violation { reason }.to_string(),
                    captured.contents(),
                )
            }
            IsolationOutcome::Error { message } => {
                ExecutionResult::failure(redact_secrets(&message), captured.contents())
            }
        };

        if let Some(error) = &result.error {
            debug!(executor = "local", error = %error, "code execution failed");
        }
        info!(
            event = "sandbox.executed",
            executor = "local",
            duration_ms = metrics.duration_ms,
            output_bytes = metrics.output_bytes,
            success = !result.is_error(),
            is_final_answer = result.is_final_answer,
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let cfg = LocalExecutorConfig::default();
        assert_eq!(cfg.max_operations, 100_000);
        assert_eq!(cfg.limit_mode, LimitMode::Operations);
        assert_eq!(cfg.limits.timeout_ms, 30_000);
    }

    #[test]
    fn test_config_partial_deserialize() {
        let cfg: LocalExecutorConfig =
            serde_json::from_value(json!({"max_operations": 50, "limit_mode": "calls"})).unwrap();
        assert_eq!(cfg.max_operations, 50);
        assert_eq!(cfg.limit_mode, LimitMode::Calls);
        assert_eq!(cfg.sandbox, SandboxLimits::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsafe_code_rejected_before_execution() {
        let exec = LocalExecutor::new(Toolbox::new());
        let err = exec.execute("eval(\"1\")").await.unwrap_err();
        assert!(matches!(err, SandboxError::UnsafeCode { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_simple_expression() {
        let exec = LocalExecutor::new(Toolbox::new()).with_variable("base", json!(40));
        let result = exec.execute("puts(\"adding\"); base + 2").await.unwrap();
        assert_eq!(result.output, json!(42));
        assert_eq!(result.logs, "adding\n");
        assert!(result.error.is_none());
        assert!(!result.is_final_answer);
    }
}
