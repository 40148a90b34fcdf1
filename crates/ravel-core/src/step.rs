//! Steps recorded during a run and their conversion back into chat history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ravel_domain::{AssistantMessage, ChatMessage, TokenUsage, ToolCall};

/// Guidance attached to every error fed back to the model.
pub const RETRY_GUIDANCE: &str = "Now let's retry: take care not to repeat previous errors! \
If you have retried several times, try a completely different approach.";

/// Wall-clock bounds of a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl Timing {
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            ended_at: now,
        }
    }

    pub fn finish(mut self) -> Self {
        self.ended_at = Utc::now();
        self
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub task: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptStep {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningStep {
    pub input_messages: Vec<ChatMessage>,
    pub output_message: AssistantMessage,
    pub plan: String,
    pub timing: Timing,
    pub token_usage: Option<TokenUsage>,
}

/// One think-act-observe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub step_number: usize,
    pub timing: Timing,
    pub output_message: Option<AssistantMessage>,
    pub tool_calls: Vec<ToolCall>,
    /// Redacted error text; never raised to the caller.
    pub error: Option<String>,
    pub code_action: Option<String>,
    pub observations: Option<String>,
    #[serde(default)]
    pub observation_images: Vec<String>,
    pub action_output: Option<Value>,
    pub token_usage: Option<TokenUsage>,
    pub is_final_answer: bool,
    pub trace_id: String,
    pub parent_trace_id: Option<String>,
}

impl ActionStep {
    pub(crate) fn new(step_number: usize, parent_trace_id: Option<String>) -> Self {
        Self {
            step_number,
            timing: Timing::start(),
            output_message: None,
            tool_calls: Vec::new(),
            error: None,
            code_action: None,
            observations: None,
            observation_images: Vec::new(),
            action_output: None,
            token_usage: None,
            is_final_answer: false,
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_trace_id,
        }
    }

    pub(crate) fn push_observation(&mut self, text: &str) {
        match &mut self.observations {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => self.observations = Some(text.to_string()),
        }
    }

    pub(crate) fn push_error(&mut self, text: &str) {
        match &mut self.error {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => self.error = Some(text.to_string()),
        }
    }

    /// Names of the tools requested in this step.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tool_calls.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswerStep {
    pub output: Value,
}

/// Placeholder for something that could not be parsed into a real step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullStep {
    pub reason: String,
    pub step_number: usize,
}

/// A single entry of agent memory. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Task(TaskStep),
    SystemPrompt(SystemPromptStep),
    Planning(PlanningStep),
    Action(ActionStep),
    FinalAnswer(FinalAnswerStep),
    Null(NullStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Task(_) => "task",
            Step::SystemPrompt(_) => "system_prompt",
            Step::Planning(_) => "planning",
            Step::Action(_) => "action",
            Step::FinalAnswer(_) => "final_answer",
            Step::Null(_) => "null",
        }
    }

    pub fn token_usage(&self) -> Option<TokenUsage> {
        match self {
            Step::Planning(p) => p.token_usage,
            Step::Action(a) => a.token_usage,
            _ => None,
        }
    }

    /// Messages re-injected into the model context for this step.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            Step::SystemPrompt(s) => vec![ChatMessage::system(s.prompt.clone())],
            Step::Task(t) => vec![ChatMessage::user(format!("New task:\n{}", t.task))
                .with_images(t.images.clone())],
            Step::Planning(p) => vec![
                ChatMessage::assistant(p.plan.clone()),
                ChatMessage::user("Now proceed and carry out this plan."),
            ],
            Step::Action(a) => action_messages(a),
            Step::FinalAnswer(_) | Step::Null(_) => Vec::new(),
        }
    }

    /// Parse one recorded step. Malformed input becomes a [`NullStep`].
    pub fn parse(raw: &str, step_number: usize) -> Step {
        match serde_json::from_str::<Step>(raw) {
            Ok(step) => step,
            Err(e) => Step::Null(NullStep {
                reason: format!("unparseable step: {e}"),
                step_number,
            }),
        }
    }
}

/// Render steps as JSON lines, one step per line.
pub fn write_transcript(steps: &[Step]) -> serde_json::Result<String> {
    let mut out = String::new();
    for step in steps {
        out.push_str(&serde_json::to_string(step)?);
        out.push('\n');
    }
    Ok(out)
}

/// Read a JSON-lines transcript. Blank lines are skipped; a line that does
/// not parse is kept as a [`NullStep`] numbered by its line.
pub fn read_transcript(text: &str) -> Vec<Step> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| Step::parse(line, index + 1))
        .collect()
}

fn action_messages(step: &ActionStep) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(output) = &step.output_message {
        messages.push(output.to_chat_message());
    }
    if let Some(observations) = &step.observations {
        messages.push(
            ChatMessage::tool_response(format!("Observation:\n{observations}"))
                .with_images(step.observation_images.clone()),
        );
    }
    if let Some(error) = &step.error {
        messages.push(ChatMessage::tool_response(format!(
            "Error:\n{error}\n{RETRY_GUIDANCE}"
        )));
    }
    messages
}
