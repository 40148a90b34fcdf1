//! The `Model` capability consumed by the execution core.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ModelError;
use crate::message::{AssistantMessage, ChatMessage, GenerateOptions};

/// Generate an assistant message from a conversation history.
///
/// Implementations must be safe to call repeatedly. Backends that can only
/// serve one request at a time should be wrapped in a request queue rather
/// than serializing internally.
#[async_trait]
pub trait Model: Send + Sync {
    /// Identifier used in logs and events.
    fn model_id(&self) -> &str {
        "model"
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError>;
}

#[async_trait]
impl<M: Model + ?Sized> Model for Arc<M> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<AssistantMessage, ModelError> {
        (**self).generate(messages, options).await
    }
}
