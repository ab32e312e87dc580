//! Generation gateway: the black box that turns a prompt into text.
//!
//! The engine only depends on the `GenerationGateway` trait. The HTTP
//! implementation for OpenAI-compatible servers lives in `openai_compat`.

pub mod openai_compat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

pub use openai_compat::OpenAiCompatGateway;

/// Speaker of a context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Everything one generation call needs.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub system_prompt: String,
    /// Ordered conversation context, oldest first.
    pub context: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A backend able to generate text.
///
/// Implementations make exactly one attempt per call. Retry policy belongs to
/// the phase executor.
#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GatewayError>;
}
