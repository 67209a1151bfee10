use std::env;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ChatSettings;

/// Free-form prompt answering backed by a chat-completion API.
#[async_trait]
pub trait ChatResponder: Send + Sync {
    async fn reply(&self, prompt: &str) -> Result<String>;
}

/// OpenRouter (OpenAI-compatible) chat-completion client.
pub struct OpenRouterClient {
    client: Client,
    settings: ChatSettings,
}

impl OpenRouterClient {
    pub fn new(settings: &ChatSettings) -> Result<Self> {
        let mut builder = Client::builder().user_agent("Sidekick/0.1 (chat)");
        if let Some(timeout) = settings.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build chat HTTP client")?;
        Ok(Self {
            client,
            settings: settings.clone(),
        })
    }

    fn url(&self) -> String {
        join_endpoint(&self.settings.endpoint, &self.settings.chat_path)
    }

    fn api_key(&self) -> Result<String> {
        let env_key = &self.settings.api_key_env;
        let value = env::var(env_key)
            .with_context(|| format!("Environment variable {env_key} not found for chat"))?;
        if value.trim().is_empty() {
            bail!("Environment variable {env_key} for chat is empty");
        }
        Ok(value)
    }
}

#[async_trait]
impl ChatResponder for OpenRouterClient {
    async fn reply(&self, prompt: &str) -> Result<String> {
        if prompt.trim().is_empty() {
            bail!("prompt must not be empty");
        }
        let api_key = self.api_key()?;
        let url = self.url();
        let payload = request_body(&self.settings.model, prompt);

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Failed to post chat request to {url}"))?;
        if !response.status().is_success() {
            bail!("Chat endpoint {url} returned status {}", response.status());
        }
        let body: Value = response
            .json()
            .await
            .context("Chat endpoint returned non-JSON payload")?;
        debug!(
            model = %self.settings.model,
            latency_ms = started.elapsed().as_millis() as u64,
            "chat completion received"
        );
        extract_reply(body)
    }
}

pub fn request_body(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}]
    })
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First choice's message content.
pub fn extract_reply(body: Value) -> Result<String> {
    let parsed: CompletionResponse = serde_json::from_value(body)
        .context("Malformed response from chat completion endpoint")?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .context("Chat completion response contained no message")
}

fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
