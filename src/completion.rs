//! Chat-completions client for OpenRouter-compatible endpoints.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use ubcore::completion::{Completion, CompletionError, CompletionProvider};
use ubcore::conversation::{ContinuationRef, HistoryEntry};
use ubcore::net::{HttpClient, HttpRequest};

pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openrouter/auto";

const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub reasoning: bool,
    pub timeout_secs: u64,
    pub referer: Option<String>,
    pub title: Option<String>,
    pub fallback_replies: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.9,
            max_tokens: 150,
            reasoning: true,
            timeout_secs: 30,
            referer: None,
            title: Some("userbot".to_string()),
            fallback_replies: Vec::new(),
        }
    }
}

impl fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("reasoning", &self.reasoning)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningToggle>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_details: Option<&'a ContinuationRef>,
}

#[derive(Serialize)]
struct ReasoningToggle {
    enabled: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_details: Option<ContinuationRef>,
}

pub struct OpenRouterClient {
    http: Arc<dyn HttpClient>,
    config: CompletionConfig,
}

impl OpenRouterClient {
    pub fn new(http: Arc<dyn HttpClient>, config: CompletionConfig) -> Self {
        Self { http, config }
    }

    fn request_body(&self, history: &[HistoryEntry]) -> Result<Vec<u8>, CompletionError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: history
                .iter()
                .map(|entry| WireMessage {
                    role: entry.role.as_str(),
                    content: &entry.content,
                    reasoning_details: entry.continuation.as_ref(),
                })
                .collect(),
            reasoning: self
                .config
                .reasoning
                .then_some(ReasoningToggle { enabled: true }),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        serde_json::to_vec(&request).map_err(|e| CompletionError::ProviderUnavailable(e.to_string()))
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterClient {
    async fn generate_reply(&self, history: &[HistoryEntry]) -> Result<Completion, CompletionError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(CompletionError::ProviderUnavailable(
                "no API key configured".to_string(),
            ));
        };

        let mut request = HttpRequest::post(&self.config.endpoint)
            .with_header("Authorization", format!("Bearer {api_key}"))
            .with_header("Content-Type", "application/json")
            .with_body(self.request_body(history)?)
            .with_timeout(Duration::from_secs(self.config.timeout_secs));
        if let Some(referer) = &self.config.referer {
            request = request.with_header("HTTP-Referer", referer.as_str());
        }
        if let Some(title) = &self.config.title {
            request = request.with_header("X-Title", title.as_str());
        }

        debug!(target: "Completion", "Requesting completion with {} history entries", history.len());
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| CompletionError::ProviderUnavailable(e.to_string()))?;

        if response.status_code == 429 {
            return Err(CompletionError::RateLimited);
        }
        if !response.is_success() {
            let body = response.body_string();
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            warn!(target: "Completion", "API error {}: {}", response.status_code, preview);
            return Err(CompletionError::ProviderUnavailable(format!(
                "HTTP {}",
                response.status_code
            )));
        }

        let parsed: ChatResponse = serde_json::from_slice(&response.body)
            .map_err(|e| CompletionError::ProviderUnavailable(format!("malformed response: {e}")))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(CompletionError::EmptyResponse)?;
        let text = message.content.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }

        Ok(Completion {
            text,
            continuation: message.reasoning_details.filter(|v| !v.is_null()),
        })
    }
}
