//! Generative Text Service Client
//!
//! Provider-agnostic interface to the external text generation service, plus an
//! OpenAI-compatible HTTP client that covers hosted OpenAI, Ollama and self-hosted servers
//! speaking the same chat-completions protocol. Both one-shot and streaming completions are
//! supported; streaming decodes Server-Sent Events into text deltas.

use crate::error::ProviderError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub mod sse;

use sse::{SseDecoder, SseFrame};

/// Provider flavour. All speak the chat-completions protocol; they differ in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "local")]
    LocalCustom,
}

/// Provider configuration (`[provider]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_type")]
    pub provider_type: ProviderType,

    #[serde(default = "default_model")]
    pub model: String,

    /// Falls back to OPENAI_API_KEY for the openai type
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL ending before `/chat/completions`
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_provider_type() -> ProviderType {
    ProviderType::OpenAI
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            model: default_model(),
            api_key: None,
            endpoint: None,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!("Invalid endpoint URL: {}", endpoint));
            }
        }
        if self.provider_type == ProviderType::LocalCustom && self.endpoint.is_none() {
            return Err("Local providers require an endpoint".to_string());
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<String, ProviderError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        match self.provider_type {
            ProviderType::OpenAI => Ok("https://api.openai.com/v1".to_string()),
            ProviderType::Ollama => Ok("http://localhost:11434/v1".to_string()),
            ProviderType::LocalCustom => Err(ProviderError::NotConfigured(
                "local provider has no endpoint".to_string(),
            )),
        }
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        match self.provider_type {
            ProviderType::OpenAI => std::env::var("OPENAI_API_KEY").ok(),
            ProviderType::Ollama | ProviderType::LocalCustom => None,
        }
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Completion options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Ask the service for a single JSON object
    #[serde(default)]
    pub json_response: bool,
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Streaming completion: text deltas in arrival order. An `Err` item ends the stream.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Generative text service client
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    /// One round trip; the system instructions travel as the first message.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Open a streaming completion.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ProviderError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

// OpenAI-compatible API request/response structures
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Extract the text delta from one SSE data payload.
pub(crate) fn delta_content(payload: &str) -> Result<Option<String>, ProviderError> {
    let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| {
        ProviderError::InvalidResponse(format!("Malformed stream chunk: {}", e))
    })?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content))
}

// Map transport-level reqwest errors to ProviderError
fn map_http_error(error: reqwest::Error) -> ProviderError {
    if let Some(status) = error.status() {
        map_status(status, error.to_string())
    } else if error.is_timeout() {
        ProviderError::RequestFailed(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ProviderError::RequestFailed(format!("Connection error: {}", error))
    } else {
        ProviderError::RequestFailed(format!("HTTP error: {}", error))
    }
}

fn map_status(status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::AuthFailed(format!("Authentication failed: {}", body)),
        429 => ProviderError::RateLimit(format!("Rate limit exceeded: {}", body)),
        404 => ProviderError::ModelNotFound(format!("Model not found: {}", body)),
        _ => ProviderError::RequestFailed(format!(
            "Request failed with status {}: {}",
            status, body
        )),
    }
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn build_provider_http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(PROVIDER_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e)))
}

/// Chat-completions client for OpenAI and compatible servers
pub struct OpenAiCompatibleClient {
    client: Client,
    provider_name: &'static str,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatibleClient {
    pub fn new(
        provider_type: ProviderType,
        model: String,
        api_key: Option<String>,
        base_url: String,
    ) -> Result<Self, ProviderError> {
        let provider_name = match provider_type {
            ProviderType::OpenAI => "openai",
            ProviderType::Ollama => "ollama",
            ProviderType::LocalCustom => "local",
        };
        Ok(Self {
            client: build_provider_http_client()?,
            provider_name,
            model,
            api_key,
            base_url,
        })
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        options: &CompletionOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages
                .into_iter()
                .map(|msg| WireMessage {
                    role: msg.role.as_str().to_string(),
                    content: Some(msg.content),
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options
                .json_response
                .then(|| json!({ "type": "json_object" })),
            stream,
        }
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_http_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerativeClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ProviderError> {
        let request = self.build_request(messages, &options, false);
        let response = self.send(&request).await?;

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

        let usage = completion.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        debug!(
            provider = self.provider_name,
            model = %completion.model,
            finish_reason = ?choice.finish_reason,
            "completion received"
        );

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: completion.model,
            usage: usage.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ProviderError> {
        let request = self.build_request(messages, &options, true);
        let response = self.send(&request).await?;
        let bytes = Box::pin(response.bytes_stream());

        let pending: VecDeque<Result<String, ProviderError>> = VecDeque::new();
        let stream = futures::stream::unfold(
            (bytes, SseDecoder::default(), pending, false),
            |(mut bytes, mut decoder, mut pending, mut finished)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, decoder, pending, finished)));
                    }
                    if finished {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            for frame in decoder.push(&chunk) {
                                match frame {
                                    SseFrame::Data(payload) => match delta_content(&payload) {
                                        Ok(Some(text)) if !text.is_empty() => {
                                            pending.push_back(Ok(text))
                                        }
                                        Ok(_) => {}
                                        Err(e) => {
                                            pending.push_back(Err(e));
                                            finished = true;
                                            break;
                                        }
                                    },
                                    SseFrame::Done => {
                                        finished = true;
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            pending.push_back(Err(map_http_error(e)));
                            finished = true;
                        }
                        None => finished = true,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    fn provider_name(&self) -> &str {
        self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Provider factory for creating provider clients
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn GenerativeClient>, ProviderError> {
        config.validate().map_err(ProviderError::NotConfigured)?;
        let api_key = config.resolve_api_key();
        if config.provider_type == ProviderType::OpenAI && api_key.is_none() {
            return Err(ProviderError::NotConfigured(
                "OpenAI provider requires api_key or OPENAI_API_KEY".to_string(),
            ));
        }
        Ok(Arc::new(OpenAiCompatibleClient::new(
            config.provider_type,
            config.model.clone(),
            api_key,
            config.base_url()?,
        )?))
    }
}
