//! Client for OpenAI-compatible chat completion endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::completion::{Completion, CompletionError, CompletionOptions, CompletionService, Prompt};
use crate::config::CompletionConfig;

pub struct HttpCompletionClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl HttpCompletionClient {
    /// Reads the API key from the environment variable the config names.
    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} is not set", config.api_key_env))?;
        Ok(Self::new(&config.endpoint, &config.model, api_key))
    }

    pub fn new(endpoint: &str, model: &str, api_key: String) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl CompletionService for HttpCompletionClient {
    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<Completion, CompletionError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(transport_error)?;
        debug!(model = ?parsed.model, choices = parsed.choices.len(), "completion received");
        into_completion(parsed)
    }
}

fn transport_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout
    } else if err.is_decode() {
        CompletionError::Rejected(format!("unreadable response: {err}"))
    } else {
        CompletionError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let message = format!("{status}: {}", body.trim());
    match status.as_u16() {
        401 | 403 => CompletionError::Authentication(message),
        429 if is_quota_message(body) => CompletionError::Quota(message),
        429 => CompletionError::Transient(message),
        code if code >= 500 => CompletionError::Transient(message),
        _ => CompletionError::Rejected(message),
    }
}

fn is_quota_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("insufficient_quota") || lower.contains("quota")
}

fn into_completion(response: ChatResponse) -> Result<Completion, CompletionError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::Rejected("response has no choices".into()))?;
    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        finish_reason: choice.finish_reason,
        model: response.model,
    })
}
