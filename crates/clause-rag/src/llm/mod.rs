//! LLM Module - generation capability and hosted provider support

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::types::TokenUsage;

pub mod gemini;
pub mod retry;

pub use gemini::GeminiClient;
pub use retry::{with_retry, RetryPolicy};

/// Raw model output plus token accounting, when the provider reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// Text generation capability.
///
/// When `schema` is given the provider is asked for JSON conforming to it.
/// Callers still validate the output; a provider may ignore the hint.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, schema: Option<&JsonValue>) -> Result<Generation>;

    fn model_id(&self) -> &str;
}
