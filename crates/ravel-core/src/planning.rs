//! Periodic planning sub-calls.

use ravel_domain::{GenerateOptions, Model, ModelError};
use tracing::debug;

use crate::memory::AgentMemory;
use crate::prompts;
use crate::step::{PlanningStep, Timing};

const END_PLAN: &str = "<end_plan>";

/// Decides when to plan and produces planning steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Planner {
    interval: Option<usize>,
}

impl Planner {
    pub fn new(interval: Option<usize>) -> Self {
        Self { interval }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Plan on the first step and on every multiple of the interval.
    pub fn should_plan(&self, step_number: usize) -> bool {
        match self.interval {
            Some(interval) if interval > 0 => step_number == 1 || step_number % interval == 0,
            _ => false,
        }
    }

    pub async fn plan(
        &self,
        model: &dyn Model,
        memory: &AgentMemory,
        tool_names: &[String],
        step_number: usize,
    ) -> Result<PlanningStep, ModelError> {
        let timing = Timing::start();
        let progress = (step_number > 1).then(|| memory.summary(4_000));
        let input_messages = prompts::planning_messages(memory.task(), tool_names, progress.as_deref());
        let options = GenerateOptions::default().with_stop_sequences(vec![END_PLAN.to_string()]);
        let output_message = model.generate(&input_messages, &options).await?;
        let plan = clean_plan(&output_message.content);
        debug!(step = step_number, plan_chars = plan.len(), "plan generated");
        Ok(PlanningStep {
            input_messages,
            token_usage: output_message.token_usage,
            output_message,
            plan,
            timing: timing.finish(),
        })
    }
}

fn clean_plan(raw: &str) -> String {
    raw.split(END_PLAN).next().unwrap_or_default().trim().to_string()
}

/// Tools from `tool_names` that the plan text mentions.
pub fn mentioned_tools(plan: &str, tool_names: &[String]) -> Vec<String> {
    let lower = plan.to_lowercase();
    tool_names
        .iter()
        .filter(|name| lower.contains(&name.to_lowercase()))
        .cloned()
        .collect()
}
