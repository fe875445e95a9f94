//! Chat-completion providers
//!
//! Stateless: every call carries the full bounded history.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::{ChatBackend, Config};
use crate::session::{Role, Turn};
use crate::{Error, Result};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Produces one assistant utterance for a history
#[async_trait]
pub trait Chatter: Send + Sync {
    /// Get the next assistant reply
    ///
    /// # Errors
    ///
    /// Returns error if the provider request fails
    async fn reply(&self, history: &[Turn]) -> Result<String>;

    /// Best-effort request to wake the provider connection up
    ///
    /// # Errors
    ///
    /// Returns error if the request fails; callers ignore it
    async fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// OpenAI-compatible chat completion request
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [Turn],
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Anthropic message request
#[derive(Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<&'a Turn>,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Vec<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    text: Option<String>,
}

/// Chat client for the configured provider
pub struct ChatClient {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    backend: ChatBackend,
}

impl ChatClient {
    /// Create a chat client
    #[must_use]
    pub fn new(backend: ChatBackend, api_key: SecretString, model: String, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            max_tokens,
            backend,
        }
    }

    /// Create the configured chat backend
    ///
    /// # Errors
    ///
    /// Returns error if the backend's API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let keys = &config.api_keys;
        let (key, name) = match config.providers.chat {
            ChatBackend::OpenAi => (keys.openai.clone(), "OpenAI"),
            ChatBackend::OpenRouter => (keys.openrouter.clone(), "OpenRouter"),
            ChatBackend::Anthropic => (keys.anthropic.clone(), "Anthropic"),
        };
        let key = key.ok_or_else(|| Error::Config(format!("{name} API key required for chat")))?;

        Ok(Self::new(
            config.providers.chat,
            key,
            config.providers.chat_model.clone(),
            config.providers.chat_max_tokens,
        ))
    }

    async fn complete_openai(&self, url: &str, history: &[Turn], max_tokens: u32) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            max_tokens,
            messages: history,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Chat(format!("API error {status}: {body}")));
        }

        let result: CompletionResponse = response.json().await?;
        Ok(result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn complete_anthropic(&self, history: &[Turn], max_tokens: u32) -> Result<String> {
        let system = history
            .iter()
            .find(|t| t.role == Role::System)
            .map(|t| t.text.as_str());

        let request = MessageRequest {
            model: &self.model,
            max_tokens,
            system,
            messages: history.iter().filter(|t| t.role != Role::System).collect(),
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Chat(format!("API error {status}: {body}")));
        }

        let result: MessageResponse = response.json().await?;
        Ok(result
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn complete(&self, history: &[Turn], max_tokens: u32) -> Result<String> {
        match self.backend {
            ChatBackend::OpenAi => self.complete_openai(OPENAI_API_URL, history, max_tokens).await,
            ChatBackend::OpenRouter => {
                self.complete_openai(OPENROUTER_API_URL, history, max_tokens)
                    .await
            }
            ChatBackend::Anthropic => self.complete_anthropic(history, max_tokens).await,
        }
    }
}

#[async_trait]
impl Chatter for ChatClient {
    async fn reply(&self, history: &[Turn]) -> Result<String> {
        let started = std::time::Instant::now();
        let text = self.complete(history, self.max_tokens).await?;
        let text = text.trim().to_string();

        tracing::info!(
            reply = %text,
            turns = history.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "reply received"
        );
        Ok(text)
    }

    async fn warm_up(&self) -> Result<()> {
        let ping = [Turn::user("hi")];
        self.complete(&ping, 1).await.map(|_| ())
    }
}
