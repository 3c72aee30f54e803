//! Response generation: user text in, assistant text out.
//!
//! The pipeline only depends on the [`ResponseGenerator`] trait. The bundled
//! [`ChatCompletionGenerator`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint (GLM by default).

use crate::config::GeneratorConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::{Message, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub session_id: String,
    pub user_text: String,
    /// Conversation before this turn, oldest first. Does not include `user_text`.
    pub recent_history: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedResponse {
    pub assistant_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion_tag: Option<String>,
}

impl GeneratedResponse {
    pub fn text(assistant_text: impl Into<String>) -> Self {
        Self {
            assistant_text: assistant_text.into(),
            emotion_tag: None,
        }
    }
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// An unusable reply is an error, never an empty string.
    async fn generate(&self, request: ResponseRequest) -> VoiceResult<GeneratedResponse>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionGenerator {
    config: GeneratorConfig,
    client: reqwest::Client,
}

fn fail(reason: impl Into<String>) -> VoiceError {
    VoiceError::ResponseGeneration(reason.into())
}

impl ChatCompletionGenerator {
    pub fn new(config: GeneratorConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("generator client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn messages(&self, request: &ResponseRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.recent_history.len() + 2);
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: self.config.system_prompt.clone(),
            });
        }
        messages.extend(request.recent_history.iter().map(|m| ChatMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        }));
        messages.push(ChatMessage {
            role: "user",
            content: request.user_text.clone(),
        });
        messages
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionGenerator {
    async fn generate(&self, request: ResponseRequest) -> VoiceResult<GeneratedResponse> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| fail("generator API key not configured"))?;
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: self.messages(&request),
            temperature: Some(0.7),
        };
        debug!(
            "generating reply for session {} ({} history messages)",
            request.session_id,
            request.recent_history.len()
        );

        let res = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| fail(format!("request failed: {}", e)))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(fail(format!("API error {}: {}", status, body)));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| fail(format!("response parse failed: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| fail("empty reply"))?;
        Ok(GeneratedResponse::text(text))
    }
}
