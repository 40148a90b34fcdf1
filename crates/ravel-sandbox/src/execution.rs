//! The code-executor seam and its result type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxResult;

/// Outcome of one code-execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Parsed (JSON-detected) or raw text output.
    pub output: Value,
    /// Captured stdout/print output.
    pub logs: String,
    /// Redacted error text, if the attempt failed.
    pub error: Option<String>,
    pub is_final_answer: bool,
}

impl ExecutionResult {
    pub fn success(output: Value, logs: impl Into<String>) -> Self {
        Self {
            output,
            logs: logs.into(),
            error: None,
            is_final_answer: false,
        }
    }

    pub fn failure(error: impl Into<String>, logs: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            logs: logs.into(),
            error: Some(error.into()),
            is_final_answer: false,
        }
    }

    pub fn final_answer(output: Value, logs: impl Into<String>) -> Self {
        Self {
            is_final_answer: true,
            ..Self::success(output, logs)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Observation text fed back to the model.
    pub fn observation(&self) -> String {
        let mut text = String::new();
        if !self.logs.trim().is_empty() {
            text.push_str("Execution logs:\n");
            text.push_str(self.logs.trim_end());
            text.push('\n');
        }
        match &self.error {
            Some(error) => {
                text.push_str("Error: ");
                text.push_str(error);
            }
            None => {
                text.push_str("Last output from code snippet:\n");
                match &self.output {
                    Value::String(s) => text.push_str(s),
                    other => text.push_str(&other.to_string()),
                }
            }
        }
        text
    }
}

/// Runs model-generated code and reports a structured result.
///
/// Errors returned through `Err` are reserved for refusals before execution
/// (unsafe code, a spawn failure or a timeout). Everything that goes wrong
/// while the code runs is reported in `ExecutionResult::error`.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, code: &str) -> SandboxResult<ExecutionResult>;
}

/// Parse executor stdout: JSON when it looks like JSON, trimmed text otherwise.
pub fn parse_output(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(trimmed.to_string())
}
