//! A `Model` that routes every call through a [`RequestQueue`].

use std::sync::Arc;

use async_trait::async_trait;

use ravel_domain::{AssistantMessage, ChatMessage, GenerateOptions, Model, ModelError};

use crate::queue::RequestQueue;
use crate::request::Priority;

/// Wraps a shared queue so the agent loop can use it as a plain model.
#[derive(Debug, Clone)]
pub struct QueuedModel {
    queue: Arc<RequestQueue>,
    priority: Priority,
    model_id: String,
}

impl QueuedModel {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        Self {
            queue,
            priority: Priority::Normal,
            model_id: "queued".to_string(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }
}

#[async_trait]
impl Model for QueuedModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError> {
        self.queue
            .queued_generate(messages, options, self.priority)
            .await
            .map_err(ModelError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use ravel_domain::fakes::ScriptedModel;

    #[tokio::test]
    async fn test_queued_model_delegates() {
        let backend = Arc::new(ScriptedModel::new(vec![AssistantMessage::text("hello")]));
        let queue = Arc::new(RequestQueue::new(backend, QueueConfig::default()));
        let model = QueuedModel::new(queue.clone())
            .with_priority(Priority::High)
            .with_model_id("local-llm");

        let reply = model
            .generate(&[ChatMessage::user("hi")], &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.content, "hello");
        assert_eq!(model.model_id(), "local-llm");
        assert_eq!(queue.stats().high_priority, 1);
    }
}
