// Gateway for OpenAI-compatible chat-completions servers.
//
// Works against Ollama, vLLM, llama.cpp server and the hosted OpenAI API,
// which all accept the same `/v1/chat/completions` request shape.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, ChatRole, GenerationGateway, GenerationRequest};
use crate::errors::GatewayError;

/// Longest slice of an error body kept in `Unavailable` messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// HTTP gateway for OpenAI-compatible servers.
#[derive(Clone)]
pub struct OpenAiCompatGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiCompatGateway {
    /// Create a gateway for `base_url` (e.g. `http://localhost:11434`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout,
        }
    }

    /// Send `Authorization: Bearer <key>` with every call.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }

    fn to_wire_request<'a>(&self, request: &'a GenerationRequest) -> WireRequest<'a> {
        let mut messages = Vec::with_capacity(request.context.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(WireMessage {
                role: ChatRole::System,
                content: &request.system_prompt,
            });
        }
        messages.extend(request.context.iter().map(|m: &ChatMessage| WireMessage {
            role: m.role,
            content: &m.content,
        }));

        WireRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        }
    }

    async fn send(&self, request: &GenerationRequest) -> Result<String, GatewayError> {
        let mut http = self.client.post(self.endpoint()).json(&self.to_wire_request(request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(GatewayError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed response body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(GatewayError::EmptyResponse);
        }
        Ok(content)
    }
}

#[async_trait]
impl GenerationGateway for OpenAiCompatGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GatewayError> {
        tracing::debug!(
            model = %request.model,
            messages = request.context.len(),
            "Sending chat completion request"
        );

        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: ChatRole,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
