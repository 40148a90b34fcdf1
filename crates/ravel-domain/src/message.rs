//! Chat messages, tool calls and token accounting.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResponse,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::ToolCall => write!(f, "tool_call"),
            MessageRole::ToolResponse => write!(f, "tool_response"),
        }
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Keyword arguments, always a JSON object after normalization.
    pub arguments: Value,
}

impl ToolCall {
    /// Build a tool call, normalizing string-encoded JSON arguments into an object.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: normalize_arguments(arguments),
        }
    }

    /// Look up a single argument by parameter name.
    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }
}

/// Providers sometimes hand back arguments as a JSON string, sometimes as a
/// bare scalar. Everything is coerced to an object keyed by parameter name.
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Object(_) => arguments,
        Value::Null => Value::Object(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw.trim()) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(Value::Null) => Value::Object(Map::new()),
            Ok(other) => wrap_input(other),
            Err(_) => wrap_input(Value::String(raw)),
        },
        other => wrap_input(other),
    }
}

fn wrap_input(value: Value) -> Value {
    let mut map = Map::new();
    map.insert("input".to_string(), value);
    Value::Object(map)
}

/// A message in the conversation history sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool_response(content: impl Into<String>) -> Self {
        Self::new(MessageRole::ToolResponse, content)
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

/// Token usage reported by a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// The model's reply: free text, optional tool calls, usage and reasoning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl AssistantMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    /// Convert into a history message for re-injection.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::assistant(self.content.clone()).with_tool_calls(self.tool_calls.clone())
    }
}

/// Per-call generation knobs passed through to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Provider-specific passthrough values.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl GenerateOptions {
    pub fn with_stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.stop_sequences = stops;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_parses_string_encoded_arguments() {
        let call = ToolCall::new("c1", "web_search", json!("{\"query\": \"rust\"}"));
        assert_eq!(call.argument("query"), Some(&json!("rust")));
    }

    #[test]
    fn test_tool_call_wraps_plain_string() {
        let call = ToolCall::new("c1", "echo", json!("hello there"));
        assert_eq!(call.arguments, json!({"input": "hello there"}));
    }

    #[test]
    fn test_tool_call_null_becomes_empty_object() {
        let call = ToolCall::new("c1", "now", Value::Null);
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_tool_call_scalar_json_string_is_wrapped() {
        let call = ToolCall::new("c1", "square", json!("7"));
        assert_eq!(call.arguments, json!({"input": 7}));
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage::new(10, 5);
        usage += TokenUsage::new(3, 2);
        assert_eq!(usage, TokenUsage::new(13, 7));
        assert_eq!(usage.total(), 20);
    }

    #[test]
    fn test_assistant_message_to_chat_message_keeps_tool_calls() {
        let msg = AssistantMessage::text("calling")
            .with_tool_call(ToolCall::new("1", "web_search", json!({"query": "x"})));
        let chat = msg.to_chat_message();
        assert_eq!(chat.role, MessageRole::Assistant);
        assert_eq!(chat.tool_calls.len(), 1);
    }
}
