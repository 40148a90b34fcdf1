//! Plan divergence tracking.
//!
//! Each action step gets an alignment score against the current plan. Scores
//! below 0.5 bump an off-topic counter; anything else decays it by one. The
//! divergence level is a pure function of that counter.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::planning::mentioned_tools;
use crate::step::ActionStep;

const OFF_TOPIC_THRESHOLD: f32 = 0.5;
const MAX_KEYWORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceLevel {
    None,
    Mild,
    Moderate,
    Severe,
}

impl DivergenceLevel {
    pub fn from_count(off_topic: u32) -> Self {
        match off_topic {
            0 => DivergenceLevel::None,
            1..=2 => DivergenceLevel::Mild,
            3..=4 => DivergenceLevel::Moderate,
            _ => DivergenceLevel::Severe,
        }
    }
}

impl std::fmt::Display for DivergenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergenceLevel::None => write!(f, "none"),
            DivergenceLevel::Mild => write!(f, "mild"),
            DivergenceLevel::Moderate => write!(f, "moderate"),
            DivergenceLevel::Severe => write!(f, "severe"),
        }
    }
}

/// Counter state owned by the step loop.
#[derive(Debug, Clone, Default)]
pub struct DivergenceTracker {
    off_topic: u32,
    planned_tools: BTreeSet<String>,
    keywords: Vec<String>,
    has_plan: bool,
}

impl DivergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a new plan. The counter is kept across re-plans.
    pub fn set_plan(&mut self, plan: &str, tool_names: &[String]) {
        self.planned_tools = mentioned_tools(plan, tool_names).into_iter().collect();
        self.keywords = keywords(plan);
        self.has_plan = true;
    }

    pub fn off_topic_count(&self) -> u32 {
        self.off_topic
    }

    pub fn level(&self) -> DivergenceLevel {
        DivergenceLevel::from_count(self.off_topic)
    }

    /// Score in `[0, 1]` of how well a step follows the current plan.
    pub fn alignment_score(&self, step: &ActionStep) -> f32 {
        if step.is_final_answer || !self.has_plan {
            return 1.0;
        }
        let tool_score = (!step.tool_calls.is_empty() && !self.planned_tools.is_empty()).then(|| {
            let aligned = step
                .tool_names()
                .filter(|n| self.planned_tools.contains(*n))
                .count();
            aligned as f32 / step.tool_calls.len() as f32
        });
        let content_score = (!self.keywords.is_empty()).then(|| {
            let content = step_text(step).to_lowercase();
            let matched = self
                .keywords
                .iter()
                .filter(|k| content.contains(k.as_str()))
                .count();
            (matched as f32 / self.keywords.len().min(MAX_KEYWORDS) as f32).min(1.0)
        });
        match (tool_score, content_score) {
            (Some(t), Some(c)) => 0.7 * t + 0.3 * c,
            (Some(t), None) => t,
            (None, Some(c)) => c,
            (None, None) => 1.0,
        }
    }

    /// Fold in a score; returns the new level when it crosses into a
    /// different non-`None` level.
    pub fn record(&mut self, score: f32) -> Option<DivergenceLevel> {
        let before = self.level();
        if score < OFF_TOPIC_THRESHOLD {
            self.off_topic = self.off_topic.saturating_add(1);
        } else {
            self.off_topic = self.off_topic.saturating_sub(1);
        }
        let after = self.level();
        (after != before && after != DivergenceLevel::None).then_some(after)
    }
}

fn step_text(step: &ActionStep) -> String {
    let mut text = String::new();
    if let Some(message) = &step.output_message {
        text.push_str(&message.content);
    }
    for call in &step.tool_calls {
        text.push(' ');
        text.push_str(&call.name);
        text.push(' ');
        text.push_str(&call.arguments.to_string());
    }
    if let Some(code) = &step.code_action {
        text.push(' ');
        text.push_str(code);
    }
    text
}

const STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "then", "will", "have", "into", "what", "when",
    "step", "steps", "find", "answer", "final", "task", "using", "about", "each", "their",
];

/// Distinct lowercase words of four or more letters, in plan order.
fn keywords(plan: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    plan.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|w| w.len() >= 4 && !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_domain::{AssistantMessage, ToolCall};
    use serde_json::json;

    fn step_with(tool: &str, content: &str) -> ActionStep {
        let mut step = ActionStep::new(1, None);
        step.output_message = Some(AssistantMessage::text(content));
        step.tool_calls = vec![ToolCall::new("c1", tool, json!({}))];
        step
    }

    #[test]
    fn test_level_thresholds() {
        let levels: Vec<DivergenceLevel> = (0..7).map(DivergenceLevel::from_count).collect();
        assert_eq!(
            levels,
            vec![
                DivergenceLevel::None,
                DivergenceLevel::Mild,
                DivergenceLevel::Mild,
                DivergenceLevel::Moderate,
                DivergenceLevel::Moderate,
                DivergenceLevel::Severe,
                DivergenceLevel::Severe,
            ]
        );
    }

    #[test]
    fn test_counter_never_negative_and_signals_once_per_crossing() {
        let mut tracker = DivergenceTracker::new();
        assert_eq!(tracker.record(0.9), None);
        assert_eq!(tracker.off_topic_count(), 0);

        assert_eq!(tracker.record(0.1), Some(DivergenceLevel::Mild));
        assert_eq!(tracker.record(0.1), None);
        assert_eq!(tracker.record(0.1), Some(DivergenceLevel::Moderate));
        assert_eq!(tracker.record(0.1), None);
        assert_eq!(tracker.record(0.1), Some(DivergenceLevel::Severe));
        assert_eq!(tracker.record(0.0), None);
        assert_eq!(tracker.off_topic_count(), 6);

        for _ in 0..10 {
            tracker.record(1.0);
        }
        assert_eq!(tracker.off_topic_count(), 0);
        assert_eq!(tracker.level(), DivergenceLevel::None);
    }

    #[test]
    fn test_decay_back_into_mild_signals() {
        let mut tracker = DivergenceTracker::new();
        for _ in 0..3 {
            tracker.record(0.0);
        }
        assert_eq!(tracker.level(), DivergenceLevel::Moderate);
        assert_eq!(tracker.record(0.8), Some(DivergenceLevel::Mild));
    }

    #[test]
    fn test_alignment_with_plan() {
        let mut tracker = DivergenceTracker::new();
        let tools = vec!["web_search".to_string(), "calculator".to_string()];
        tracker.set_plan("1. Use web_search for the population of Paris", &tools);

        let on_plan = step_with("web_search", "Searching population of Paris");
        assert!(tracker.alignment_score(&on_plan) >= 0.5);

        let off_plan = step_with("calculator", "Computing something unrelated");
        assert!(tracker.alignment_score(&off_plan) < 0.5);

        let mut final_step = step_with("final_answer", "");
        final_step.is_final_answer = true;
        assert_eq!(tracker.alignment_score(&final_step), 1.0);
    }

    #[test]
    fn test_no_plan_is_always_aligned() {
        let tracker = DivergenceTracker::new();
        assert_eq!(tracker.alignment_score(&step_with("anything", "x")), 1.0);
    }
}
