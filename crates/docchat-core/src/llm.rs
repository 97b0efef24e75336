//! Model provider trait.
//!
//! Generation is a lazy, finite stream of text fragments. The consumer
//! pulls fragments as it forwards them, so backpressure is automatic, and
//! dropping the stream cancels the underlying request.
//!
//! Concrete providers (OpenAI, Anthropic) live in the `docchat` app crate.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::prompt::Prompt;

/// Fragments of model output in generation order.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Start generating. Errors before the first fragment are returned
    /// here; errors after it arrive as items of the stream.
    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream>;
}
