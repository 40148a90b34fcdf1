//! Ordered step history of a run.

use ravel_domain::{ChatMessage, TokenUsage};

use crate::error::{AgentError, Result};
use crate::step::{ActionStep, PlanningStep, Step, SystemPromptStep, TaskStep};

/// Agent memory: always a system prompt, then the task, then recorded steps.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMemory {
    steps: Vec<Step>,
}

impl AgentMemory {
    pub fn new(system_prompt: impl Into<String>, task: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            steps: vec![
                Step::SystemPrompt(SystemPromptStep {
                    prompt: system_prompt.into(),
                }),
                Step::Task(TaskStep {
                    task: task.into(),
                    images,
                }),
            ],
        }
    }

    /// Record a step. The leading system prompt and task are fixed.
    pub fn push(&mut self, step: Step) -> Result<()> {
        match step {
            Step::SystemPrompt(_) | Step::Task(_) => Err(AgentError::InvalidState(format!(
                "cannot record a second {} step",
                step.kind()
            ))),
            step => {
                self.steps.push(step);
                Ok(())
            }
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    pub fn task(&self) -> &str {
        match self.steps.get(1) {
            Some(Step::Task(t)) => &t.task,
            _ => "",
        }
    }

    pub fn system_prompt(&self) -> &str {
        match self.steps.first() {
            Some(Step::SystemPrompt(s)) => &s.prompt,
            _ => "",
        }
    }

    /// Full model context: every step's messages in order.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.steps.iter().flat_map(Step::to_messages).collect()
    }

    /// Context without the system prompt, for auxiliary prompts.
    pub fn history_messages(&self) -> Vec<ChatMessage> {
        self.steps.iter().skip(1).flat_map(Step::to_messages).collect()
    }

    pub fn action_steps(&self) -> impl Iterator<Item = &ActionStep> {
        self.steps.iter().filter_map(|s| match s {
            Step::Action(a) => Some(a),
            _ => None,
        })
    }

    pub fn last_action(&self) -> Option<&ActionStep> {
        self.action_steps().last()
    }

    /// The most recent plan, if any planning step ran.
    pub fn current_plan(&self) -> Option<&PlanningStep> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::Planning(p) => Some(p),
            _ => None,
        })
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.steps
            .iter()
            .filter_map(Step::token_usage)
            .fold(TokenUsage::default(), |acc, u| acc + u)
    }

    /// Short text rendering of the action history, for planning prompts.
    pub fn summary(&self, max_chars: usize) -> String {
        let mut out = String::new();
        for step in self.action_steps() {
            let tools: Vec<&str> = step.tool_names().collect();
            out.push_str(&format!("Step {}:", step.step_number));
            if !tools.is_empty() {
                out.push_str(&format!(" called {}.", tools.join(", ")));
            }
            if let Some(obs) = &step.observations {
                out.push_str(&format!(" Observed: {}", truncate(obs, 200)));
            }
            if let Some(err) = &step.error {
                out.push_str(&format!(" Error: {}", truncate(err, 200)));
            }
            out.push('\n');
        }
        truncate(&out, max_chars)
    }
}

/// Truncate on a char boundary, appending an ellipsis marker when cut.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
