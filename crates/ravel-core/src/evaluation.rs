//! Periodic progress evaluation.
//!
//! The model answers with `DONE:`, `CONTINUE:` or `STUCK:` and an optional
//! `CONFIDENCE:` line. Anything unrecognized is read as `CONTINUE` with a low
//! confidence so that a confused evaluator never ends a run by accident.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ravel_domain::{ChatMessage, GenerateOptions, Model, ModelError, TokenUsage};

use crate::prompts;

/// Confidence assigned to output that matched no status line.
pub const UNPARSEABLE_CONFIDENCE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Done,
    Continue,
    Stuck,
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationStatus::Done => write!(f, "done"),
            EvaluationStatus::Continue => write!(f, "continue"),
            EvaluationStatus::Stuck => write!(f, "stuck"),
        }
    }
}

/// Parsed evaluator reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub status: EvaluationStatus,
    /// Answer text for `DONE`.
    pub answer: Option<String>,
    /// Reason text for `CONTINUE` and `STUCK`.
    pub reason: Option<String>,
    /// Left unset for well-formed replies without a `CONFIDENCE:` line.
    pub confidence: Option<f32>,
}

impl EvaluationVerdict {
    pub fn is_done(&self) -> bool {
        self.status == EvaluationStatus::Done
    }
}

struct Patterns {
    done: Regex,
    cont: Regex,
    stuck: Regex,
    confidence: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                done: Regex::new(r"(?mi)^[ \t]*DONE:[ \t]*(.*)$").ok()?,
                cont: Regex::new(r"(?mi)^[ \t]*CONTINUE:[ \t]*(.*)$").ok()?,
                stuck: Regex::new(r"(?mi)^[ \t]*STUCK:[ \t]*(.*)$").ok()?,
                confidence: Regex::new(r"(?mi)^[ \t]*CONFIDENCE:[ \t]*(-?[0-9]*\.?[0-9]+)").ok()?,
            })
        })
        .as_ref()
}

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Parse an evaluator reply.
pub fn parse_evaluation(text: &str) -> EvaluationVerdict {
    let fallback = EvaluationVerdict {
        status: EvaluationStatus::Continue,
        answer: None,
        reason: None,
        confidence: Some(UNPARSEABLE_CONFIDENCE),
    };
    let Some(p) = patterns() else {
        return fallback;
    };
    let confidence = p
        .confidence
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .map(|c| c.clamp(0.0, 1.0));

    if let Some(answer) = capture(&p.done, text) {
        return EvaluationVerdict {
            status: EvaluationStatus::Done,
            answer: Some(answer),
            reason: None,
            confidence,
        };
    }
    if let Some(reason) = capture(&p.stuck, text) {
        return EvaluationVerdict {
            status: EvaluationStatus::Stuck,
            answer: None,
            reason: Some(reason),
            confidence,
        };
    }
    if let Some(reason) = capture(&p.cont, text) {
        return EvaluationVerdict {
            status: EvaluationStatus::Continue,
            answer: None,
            reason: Some(reason),
            confidence,
        };
    }
    fallback
}

/// Runs evaluation checkpoints for the step loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluator {
    interval: usize,
    done_confidence: f32,
}

impl Evaluator {
    pub fn new(interval: usize, done_confidence: f32) -> Self {
        Self {
            interval: interval.max(1),
            done_confidence,
        }
    }

    pub fn is_checkpoint(&self, step_number: usize) -> bool {
        step_number % self.interval == 0
    }

    /// Whether a verdict is strong enough to end the run.
    pub fn accepts_done(&self, verdict: &EvaluationVerdict) -> bool {
        verdict.is_done()
            && verdict
                .confidence
                .map_or(true, |c| c >= self.done_confidence)
    }

    pub async fn evaluate(
        &self,
        model: &dyn Model,
        task: &str,
        history: Vec<ChatMessage>,
    ) -> Result<(EvaluationVerdict, Option<TokenUsage>), ModelError> {
        let messages = prompts::evaluation_messages(task, history);
        let reply = model.generate(&messages, &GenerateOptions::default()).await?;
        let verdict = parse_evaluation(&reply.content);
        debug!(status = %verdict.status, confidence = ?verdict.confidence, "evaluation parsed");
        Ok((verdict, reply.token_usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_domain::fakes::ScriptedModel;
    use ravel_domain::AssistantMessage;

    #[test]
    fn test_done_with_confidence() {
        let v = parse_evaluation("DONE: Paris\nCONFIDENCE: 0.8");
        assert_eq!(v.status, EvaluationStatus::Done);
        assert_eq!(v.answer.as_deref(), Some("Paris"));
        assert_eq!(v.confidence, Some(0.8));
    }

    #[test]
    fn test_well_formed_continue_leaves_confidence_unset() {
        let v = parse_evaluation("CONTINUE: need more data");
        assert_eq!(v.status, EvaluationStatus::Continue);
        assert_eq!(v.reason.as_deref(), Some("need more data"));
        assert_eq!(v.confidence, None);
    }

    #[test]
    fn test_garbage_defaults_to_low_confidence_continue() {
        let v = parse_evaluation("garbage output");
        assert_eq!(v.status, EvaluationStatus::Continue);
        assert_eq!(v.confidence, Some(UNPARSEABLE_CONFIDENCE));
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(parse_evaluation("STUCK: loop\nCONFIDENCE: 1.7").confidence, Some(1.0));
        assert_eq!(parse_evaluation("STUCK: loop\nconfidence: -2").confidence, Some(0.0));
    }

    #[test]
    fn test_prefix_must_start_a_line() {
        let v = parse_evaluation("I am not DONE: yet");
        assert_eq!(v.confidence, Some(UNPARSEABLE_CONFIDENCE));
    }

    #[test]
    fn test_accepts_done_threshold() {
        let evaluator = Evaluator::new(1, 0.7);
        assert!(evaluator.accepts_done(&parse_evaluation("DONE: x")));
        assert!(evaluator.accepts_done(&parse_evaluation("DONE: x\nCONFIDENCE: 0.9")));
        assert!(!evaluator.accepts_done(&parse_evaluation("DONE: x\nCONFIDENCE: 0.2")));
        assert!(!evaluator.accepts_done(&parse_evaluation("CONTINUE: x")));
    }

    #[test]
    fn test_checkpoints() {
        let evaluator = Evaluator::new(2, 0.5);
        assert!(!evaluator.is_checkpoint(1));
        assert!(evaluator.is_checkpoint(2));
        assert!(Evaluator::new(0, 0.5).is_checkpoint(3));
    }

    #[tokio::test]
    async fn test_evaluate_calls_model() {
        let model = ScriptedModel::new(vec![AssistantMessage::text("STUCK: repeating searches")]);
        let (verdict, _) = Evaluator::new(1, 0.7)
            .evaluate(&model, "t", vec![ChatMessage::user("New task:\nt")])
            .await
            .unwrap();
        assert_eq!(verdict.status, EvaluationStatus::Stuck);
        assert_eq!(model.call_count(), 1);
    }
}
