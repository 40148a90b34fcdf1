//! In-memory fakes for the model, tool and event capabilities (testing only)
//!
//! Provides `ScriptedModel`, `FnModel`, `StaticTool` and `CollectingSink`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ModelError, ToolError};
use crate::events::{EventSink, RuntimeEvent};
use crate::message::{AssistantMessage, ChatMessage, GenerateOptions};
use crate::model::Model;
use crate::tool::Tool;

// ---------------------------------------------------------------------------
// ScriptedModel
// ---------------------------------------------------------------------------

/// Model that replays a fixed script of responses in call order.
///
/// Once the script is exhausted the fallback response (if any) is repeated,
/// otherwise `ModelError::InvalidResponse` is returned.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<AssistantMessage, ModelError>>>,
    fallback: Option<AssistantMessage>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<AssistantMessage>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script mixing successes and failures.
    pub fn with_results(results: Vec<Result<AssistantMessage, ModelError>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: AssistantMessage) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Number of `generate` calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Message histories received, in call order.
    pub fn received(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ModelError::InvalidResponse("script exhausted".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// FnModel
// ---------------------------------------------------------------------------

type Responder = dyn Fn(&[ChatMessage]) -> Result<AssistantMessage, ModelError> + Send + Sync;

/// Model backed by a closure, for tests that answer based on the prompt.
pub struct FnModel {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl FnModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<AssistantMessage, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Model for FnModel {
    fn model_id(&self) -> &str {
        "fn"
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        _options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(messages)
    }
}

// ---------------------------------------------------------------------------
// StaticTool
// ---------------------------------------------------------------------------

/// Tool returning a fixed value (or a fixed failure), optionally after a delay.
#[derive(Debug)]
pub struct StaticTool {
    name: String,
    output: Result<Value, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_arguments: Mutex<Option<Value>>,
}

impl StaticTool {
    pub fn new(name: &str, output: Value) -> Self {
        Self {
            name: name.to_string(),
            output: Ok(output),
            delay: None,
            calls: AtomicUsize::new(0),
            last_arguments: Mutex::new(None),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            output: Err(message.to_string()),
            ..Self::new(name, Value::Null)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_arguments(&self) -> Option<Value> {
        self.last_arguments.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "static test tool"
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_arguments.lock().unwrap() = Some(arguments);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.output {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(ToolError::failed(&self.name, message)),
        }
    }
}

// ---------------------------------------------------------------------------
// CollectingSink
// ---------------------------------------------------------------------------

/// Event sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RuntimeEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events whose dotted name equals `name`.
    pub fn named(&self, name: &str) -> Vec<RuntimeEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn handle(&self, event: &RuntimeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
