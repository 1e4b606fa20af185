//! Remote-per-call decoder
//!
//! Remote APIs have no shared batch: each completion is its own request
//! (except OpenAI-compatible endpoints, which accept a choice count).
//! Responses still pass through the stop-marker trimmer, since chat models
//! routinely append fence closers and continuation prose after the code.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{ChatBackend, ChatRequest, Provider};
use crate::config::ModelConfig;
use crate::decoder::{check_sampling, effective_batch, Decoder};
use crate::error::{DecodeError, Result};
use crate::registry::ModelSpec;
use crate::stop::StopMarkerSet;
use crate::template::TemplateFamily;

/// Provider-shaped request behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStyle {
    /// One request carrying `n` choices; supports JSON-object responses on
    /// selected models
    OpenAi,
    /// One request per completion
    Mistral,
    /// One request per completion, with stop sequences forwarded
    Anthropic,
}

impl RemoteStyle {
    /// Whether one request can carry the whole batch as choices
    fn multi_choice(&self) -> bool {
        matches!(self, RemoteStyle::OpenAi)
    }
}

impl From<Provider> for RemoteStyle {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi => RemoteStyle::OpenAi,
            Provider::Mistral => RemoteStyle::Mistral,
            Provider::Anthropic => RemoteStyle::Anthropic,
        }
    }
}

pub struct RemoteDecoder {
    config: ModelConfig,
    family: TemplateFamily,
    markers: StopMarkerSet,
    style: RemoteStyle,
    client: Arc<dyn ChatBackend>,
}

impl RemoteDecoder {
    pub fn new(
        config: ModelConfig,
        family: TemplateFamily,
        markers: StopMarkerSet,
        style: RemoteStyle,
        client: Arc<dyn ChatBackend>,
    ) -> Self {
        tracing::info!("Initializing a remote decoder session: {}", config.name);
        Self {
            config,
            family,
            markers,
            style,
            client,
        }
    }

    /// Builds a session from a resolved registry entry
    pub fn from_spec(
        spec: &ModelSpec,
        batch_size: usize,
        temperature: f32,
        style: RemoteStyle,
        client: Arc<dyn ChatBackend>,
    ) -> Self {
        Self::new(
            spec.to_config(batch_size, temperature),
            spec.family,
            spec.stop_markers(),
            style,
            client,
        )
    }

    /// JSON-object response mode: only the preview GPT-4 endpoint honors
    /// the structured `{"code": ...}` contract
    fn json_object(&self) -> bool {
        self.style == RemoteStyle::OpenAi && self.config.name == "gpt-4-1106-preview"
    }

    /// Extracts the `code` field from a structured response, falling back
    /// to the raw text when the field is absent or the body is not JSON.
    /// The fallback preserves the output count rather than failing the
    /// batch.
    fn extract_code(&self, prompt: &str, content: &str) -> String {
        match serde_json::from_str::<serde_json::Value>(content) {
            Ok(value) => {
                if let Some(code) = value.get("code").and_then(|c| c.as_str()) {
                    return format!("{prompt}\n{code}");
                }
                tracing::warn!("'code' field not found in structured response: {}", value);
                content.to_string()
            }
            Err(e) => {
                tracing::warn!("Structured response is not valid JSON: {}", e);
                content.to_string()
            }
        }
    }

    fn build_request(&self, prompt: &str, sample: bool, n: usize) -> ChatRequest {
        let stop = if self.style == RemoteStyle::Anthropic {
            self.family
                .extra_stop_markers()
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        };

        ChatRequest {
            model: self.config.name.clone(),
            messages: self.family.chat_messages(prompt, self.json_object()),
            max_tokens: self.config.effective_max_new_tokens(),
            temperature: self.config.temperature,
            top_p: sample.then_some(0.95),
            n,
            stop,
            json_object: self.json_object(),
        }
    }
}

#[async_trait]
impl Decoder for RemoteDecoder {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    async fn generate(
        &self,
        prompt: &str,
        sample: bool,
        num_samples: usize,
    ) -> Result<Vec<String>> {
        check_sampling(&self.config, sample, num_samples)?;
        let batch = effective_batch(&self.config, num_samples);

        // Deterministic remote endpoints do not support multiple choices
        if !sample && batch != 1 {
            return Err(DecodeError::invalid(
                "Deterministic remote decoding supports batch size 1 only",
            ));
        }

        let raw = if self.style.multi_choice() {
            let request = self.build_request(prompt, sample, batch);
            self.client.complete(&request).await?
        } else {
            let request = self.build_request(prompt, sample, 1);
            let mut collected = Vec::with_capacity(batch);
            for _ in 0..batch {
                let mut choices = self.client.complete(&request).await?;
                collected.append(&mut choices);
            }
            collected
        };

        let json_object = self.json_object();
        let outputs = raw
            .iter()
            .map(|content| {
                let text = if json_object {
                    self.extract_code(prompt, content)
                } else {
                    content.clone()
                };
                self.markers.trim(&text).to_string()
            })
            .collect();

        Ok(outputs)
    }
}
