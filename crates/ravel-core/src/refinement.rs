//! Bounded self-refinement.
//!
//! [`refine`] asks a [`Refiner`] for feedback on the current output and, when
//! the feedback is actionable, for a revised output. The loop ends when the
//! feedback has nothing to fix, when a revision is identical to its input, or
//! after `max_iterations`.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ravel_domain::{GenerateOptions, Model, TokenUsage};
use ravel_sandbox::{redact_secrets, CodeExecutor};

use crate::config::FeedbackSource;
use crate::error::Result;
use crate::evaluation::{parse_evaluation, EvaluationStatus};
use crate::prompts;

/// Feedback on one candidate output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub source: FeedbackSource,
    /// False when there is nothing to fix.
    pub actionable: bool,
    pub issue: Option<String>,
    pub fix: Option<String>,
    pub confidence: f32,
}

impl Feedback {
    pub fn approved(source: FeedbackSource, confidence: f32) -> Self {
        Self {
            source,
            actionable: false,
            issue: None,
            fix: None,
            confidence,
        }
    }

    pub fn issue(
        source: FeedbackSource,
        issue: impl Into<String>,
        fix: Option<String>,
        confidence: f32,
    ) -> Self {
        Self {
            source,
            actionable: true,
            issue: Some(issue.into()),
            fix,
            confidence,
        }
    }
}

/// Immutable outcome of a refine loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementResult {
    pub original: String,
    pub refined: String,
    pub iterations: u32,
    pub feedback_history: Vec<Feedback>,
    pub improved: bool,
    pub confidence: f32,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

/// Supplies feedback and revisions for the refine loop.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn feedback(&self, task: &str, output: &str) -> Result<(Feedback, Option<TokenUsage>)>;

    async fn revise(
        &self,
        task: &str,
        output: &str,
        feedback: &Feedback,
    ) -> Result<(String, Option<TokenUsage>)>;
}

/// Run the refine loop on `original`.
pub async fn refine(
    refiner: &dyn Refiner,
    task: &str,
    original: &str,
    max_iterations: u32,
) -> Result<RefinementResult> {
    // Local accumulator; only the immutable result leaves this function.
    struct State {
        current: String,
        feedback_history: Vec<Feedback>,
        iterations: u32,
        usage: TokenUsage,
    }
    let mut state = State {
        current: original.to_string(),
        feedback_history: Vec::new(),
        iterations: 0,
        usage: TokenUsage::default(),
    };

    while state.iterations < max_iterations {
        state.iterations += 1;
        let (feedback, usage) = refiner.feedback(task, &state.current).await?;
        state.usage += usage.unwrap_or_default();
        let actionable = feedback.actionable;
        state.feedback_history.push(feedback);
        if !actionable {
            debug!(iteration = state.iterations, "refinement: nothing to fix");
            break;
        }
        let Some(feedback) = state.feedback_history.last() else {
            break;
        };
        let (revised, usage) = refiner.revise(task, &state.current, feedback).await?;
        state.usage += usage.unwrap_or_default();
        if revised.trim() == state.current.trim() {
            debug!(iteration = state.iterations, "refinement: no progress");
            break;
        }
        state.current = revised;
    }

    let confidence = state
        .feedback_history
        .last()
        .map_or(1.0, |f| f.confidence);
    Ok(RefinementResult {
        improved: state.current != original,
        original: original.to_string(),
        refined: state.current,
        iterations: state.iterations,
        feedback_history: state.feedback_history,
        confidence,
        token_usage: state.usage,
    })
}

fn critique_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?is)ISSUE:\s*(.*?)\s*(?:\|\s*FIX:\s*(.*))?$").ok())
        .as_ref()
}

/// Parse a self-critique reply: `LGTM` or `ISSUE: ... | FIX: ...`.
///
/// Replies in neither form are treated as approval with low confidence.
pub fn parse_critique(text: &str) -> Feedback {
    let trimmed = text.trim();
    if trimmed.to_uppercase().starts_with("LGTM") {
        return Feedback::approved(FeedbackSource::SelfCritique, 0.9);
    }
    if let Some(caps) = critique_pattern().and_then(|re| re.captures(trimmed)) {
        let issue = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if !issue.is_empty() {
            let fix = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty());
            return Feedback::issue(FeedbackSource::SelfCritique, issue, fix, 0.7);
        }
    }
    Feedback::approved(FeedbackSource::SelfCritique, 0.5)
}

/// Model-backed refiner using the configured feedback source.
pub struct ModelRefiner {
    model: Arc<dyn Model>,
    source: FeedbackSource,
    executor: Option<Arc<dyn CodeExecutor>>,
    known_error: Option<String>,
}

impl ModelRefiner {
    pub fn new(model: Arc<dyn Model>, source: FeedbackSource) -> Self {
        Self {
            model,
            source,
            executor: None,
            known_error: None,
        }
    }

    /// Executor used as the oracle for `execution` feedback.
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Error already observed for the original output.
    pub fn with_known_error(mut self, error: Option<String>) -> Self {
        self.known_error = error;
        self
    }

    async fn execution_feedback(&self, output: &str) -> Result<Feedback> {
        let source = FeedbackSource::Execution;
        let Some(executor) = &self.executor else {
            // Without an oracle only the recorded error can be reported.
            return Ok(match &self.known_error {
                Some(error) => Feedback::issue(source, error.clone(), None, 0.6),
                None => Feedback::approved(source, 1.0),
            });
        };
        let result = match executor.execute(output).await {
            Ok(result) => result,
            Err(e) => return Ok(Feedback::issue(source, redact_secrets(&e.to_string()), None, 0.8)),
        };
        Ok(match result.error {
            Some(error) => Feedback::issue(source, error, None, 0.8),
            None => Feedback::approved(source, 1.0),
        })
    }
}

impl std::fmt::Debug for ModelRefiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRefiner")
            .field("model", &self.model.model_id())
            .field("source", &self.source)
            .field("executor", &self.executor.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

#[async_trait]
impl Refiner for ModelRefiner {
    async fn feedback(&self, task: &str, output: &str) -> Result<(Feedback, Option<TokenUsage>)> {
        let options = GenerateOptions::default();
        match self.source {
            FeedbackSource::Execution => Ok((self.execution_feedback(output).await?, None)),
            FeedbackSource::SelfCritique => {
                let reply = self
                    .model
                    .generate(&prompts::critique_messages(task, output), &options)
                    .await?;
                Ok((parse_critique(&reply.content), reply.token_usage))
            }
            FeedbackSource::Evaluation => {
                let reply = self
                    .model
                    .generate(&prompts::output_evaluation_messages(task, output), &options)
                    .await?;
                let verdict = parse_evaluation(&reply.content);
                let confidence = verdict.confidence.unwrap_or(0.5);
                let source = FeedbackSource::Evaluation;
                let feedback = match verdict.status {
                    EvaluationStatus::Done => Feedback::approved(source, confidence),
                    EvaluationStatus::Continue | EvaluationStatus::Stuck => Feedback::issue(
                        source,
                        verdict.reason.unwrap_or_else(|| "output is incomplete".into()),
                        None,
                        confidence,
                    ),
                };
                Ok((feedback, reply.token_usage))
            }
        }
    }

    async fn revise(
        &self,
        task: &str,
        output: &str,
        feedback: &Feedback,
    ) -> Result<(String, Option<TokenUsage>)> {
        let issue = feedback.issue.as_deref().unwrap_or("unspecified issue");
        let messages = prompts::refine_messages(task, output, issue, feedback.fix.as_deref());
        let reply = self.model.generate(&messages, &GenerateOptions::default()).await?;
        Ok((reply.content.trim().to_string(), reply.token_usage))
    }
}
