//! HTTP chat-completion clients
//!
//! Two wire shapes cover every hosted provider: the OpenAI
//! chat-completions schema (also spoken by Mistral's platform) and the
//! Anthropic Messages schema. Credentials come from the environment; a
//! missing key surfaces as a clear configuration error at lookup time,
//! not as a 401 mid-run.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, ChatBackend, ChatRequest};
use crate::error::{DecodeError, Result};
use crate::template::ChatMessage;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Hosted inference providers with first-class support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Mistral,
    Anthropic,
}

impl Provider {
    /// Environment variable holding the provider's API key
    pub fn env_key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Mistral => "MISTRAL_API_KEY",
            Provider::Anthropic => "ANTHROPIC_KEY",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Mistral => "https://api.mistral.ai/v1",
            Provider::Anthropic => "https://api.anthropic.com",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Mistral => "mistral",
            Provider::Anthropic => "anthropic",
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// OpenAI chat-completions request body
#[derive(Serialize)]
struct CompletionsBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Client for OpenAI-compatible chat-completion endpoints.
///
/// Mistral's platform speaks the same schema, so one client serves both.
#[derive(Debug)]
pub struct OpenAiCompatClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env(provider: Provider) -> Option<Self> {
        let api_key = std::env::var(provider.env_key()).ok()?;
        if api_key.is_empty() {
            return None;
        }
        Some(Self::new(api_key, provider.base_url()))
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatClient {
    async fn complete(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<Vec<String>, BackendError> {
        let body = CompletionsBody {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            n: request.n,
            stop: (!request.stop.is_empty()).then_some(&request.stop),
            response_format: request
                .json_object
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Api { status, message });
        }

        let parsed: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Http(format!("Failed to parse response: {}", e)))?;

        tracing::debug!("Received {} completion choices", parsed.choices.len());
        Ok(parsed
            .choices
            .into_iter()
            .map(|c| c.message.content)
            .collect())
    }
}

/// Anthropic Messages request body
#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a Vec<String>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Client for the Anthropic Messages API.
///
/// The Messages schema has no choice count; callers needing several
/// completions issue several requests.
#[derive(Debug)]
pub struct AnthropicMessagesClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicMessagesClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var(Provider::Anthropic.env_key()).ok()?;
        if api_key.is_empty() {
            return None;
        }
        Some(Self::new(api_key, Provider::Anthropic.base_url()))
    }
}

#[async_trait]
impl ChatBackend for AnthropicMessagesClient {
    async fn complete(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<Vec<String>, BackendError> {
        let body = MessagesBody {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: (!request.stop.is_empty()).then_some(&request.stop),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Api { status, message });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Http(format!("Failed to parse response: {}", e)))?;

        let text = parsed
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .unwrap_or_default();
        Ok(vec![text])
    }
}

/// Registry of configured provider clients
pub struct ProviderCatalog {
    clients: DashMap<Provider, Arc<dyn ChatBackend>>,
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from whatever API keys the environment holds.
    /// Providers without credentials are simply absent.
    pub fn from_env() -> Self {
        let catalog = Self::new();
        if let Some(client) = OpenAiCompatClient::from_env(Provider::OpenAi) {
            catalog.register(Provider::OpenAi, Arc::new(client));
        }
        if let Some(client) = OpenAiCompatClient::from_env(Provider::Mistral) {
            catalog.register(Provider::Mistral, Arc::new(client));
        }
        if let Some(client) = AnthropicMessagesClient::from_env() {
            catalog.register(Provider::Anthropic, Arc::new(client));
        }
        tracing::info!("Configured {} remote providers", catalog.clients.len());
        catalog
    }

    pub fn register(&self, provider: Provider, client: Arc<dyn ChatBackend>) {
        self.clients.insert(provider, client);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ChatBackend>> {
        self.clients.get(&provider).map(|entry| entry.value().clone())
    }

    /// Like `get`, but a missing client is a configuration error naming
    /// the environment variable to set
    pub fn require(&self, provider: Provider) -> Result<Arc<dyn ChatBackend>> {
        self.get(provider).ok_or_else(|| {
            DecodeError::invalid(format!(
                "No {} client configured. Set {} to enable it.",
                provider.name(),
                provider.env_key()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_env_keys() {
        assert_eq!(Provider::OpenAi.env_key(), "OPENAI_API_KEY");
        assert_eq!(Provider::Mistral.env_key(), "MISTRAL_API_KEY");
        assert_eq!(Provider::Anthropic.env_key(), "ANTHROPIC_KEY");
    }

    #[test]
    fn test_completions_body_omits_empty_fields() {
        let body = CompletionsBody {
            model: "gpt-4-turbo",
            messages: &[],
            max_tokens: 1024,
            temperature: 0.8,
            top_p: None,
            n: 2,
            stop: None,
            response_format: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("top_p").is_none());
        assert!(json.get("stop").is_none());
        assert!(json.get("response_format").is_none());
        assert_eq!(json["n"], 2);
    }

    #[test]
    fn test_completions_body_json_mode() {
        let body = CompletionsBody {
            model: "gpt-4-1106-preview",
            messages: &[],
            max_tokens: 1024,
            temperature: 0.8,
            top_p: Some(0.95),
            n: 1,
            stop: None,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["top_p"], 0.95);
    }

    #[test]
    fn test_messages_body_carries_stop_sequences() {
        let stop = vec!["\n```\n".to_string(), "\nif ".to_string()];
        let body = MessagesBody {
            model: "claude-3-opus-20240229",
            messages: &[],
            max_tokens: 1024,
            temperature: 0.8,
            top_p: None,
            stop_sequences: Some(&stop),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stop_sequences"][0], "\n```\n");
        assert_eq!(json["stop_sequences"][1], "\nif ");
    }

    #[test]
    fn test_completions_response_choice_order() {
        let raw = r#"{"choices":[
            {"message":{"role":"assistant","content":"first"}},
            {"message":{"role":"assistant","content":"second"}}
        ]}"#;
        let parsed: CompletionsResponse = serde_json::from_str(raw).unwrap();
        let texts: Vec<String> = parsed
            .choices
            .into_iter()
            .map(|c| c.message.content)
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_messages_response_first_block() {
        let raw = r#"{"content":[{"type":"text","text":"    return 1"}]}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content[0].text, "    return 1");
    }

    #[test]
    fn test_catalog_require_names_env_var() {
        let catalog = ProviderCatalog::new();
        let err = catalog.require(Provider::Anthropic).unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_KEY"));
    }
}
