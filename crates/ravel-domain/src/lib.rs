//! Ravel domain model (Layer 0)
//!
//! Shared vocabulary for the execution core:
//! - Chat messages, tool calls and token accounting
//! - The `Model` capability (generate an assistant message from a history)
//! - The `Tool` capability (execute with JSON keyword arguments)
//! - Runtime events and an optional, zero-cost-when-unset emitter
//! - In-memory fakes for tests

pub mod error;
pub mod events;
pub mod fakes;
pub mod message;
pub mod model;
pub mod tool;

pub use error::{ModelError, ToolError};
pub use events::{EventSink, Emitter, RuntimeEvent};
pub use message::{
    AssistantMessage, ChatMessage, GenerateOptions, MessageRole, TokenUsage, ToolCall,
};
pub use model::Model;
pub use tool::{FinalAnswerTool, RetrievalMatcher, Tool, Toolbox, FINAL_ANSWER_TOOL};

/// Ravel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
