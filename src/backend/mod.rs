//! Backend capability boundary
//!
//! The decoding core never loads weights or speaks HTTP itself; it asks a
//! backend for three things: turn text into tokens, run generation, turn
//! tokens back into text. Local backends expose the token-level contract
//! (`CausalBackend`, `Seq2SeqBackend`), remote chat APIs expose a
//! message-level one (`ChatBackend`).

use async_trait::async_trait;
use thiserror::Error;

use crate::stop::StopWatcher;
use crate::template::ChatMessage;

pub mod llama;
pub mod remote;

pub use remote::{OpenAiCompatClient, AnthropicMessagesClient, Provider, ProviderCatalog};

/// Token identifier, matching llama.cpp's vocabulary indexing
pub type TokenId = i32;

/// Errors reported by a backend implementation
#[derive(Debug, Error)]
pub enum BackendError {
    /// Accelerator allocation failed during generation. The retry decoder
    /// reacts to this variant; everything else propagates.
    #[error("Out of accelerator memory: {0}")]
    OutOfMemory(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Remote API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl BackendError {
    /// Returns true if this failure is retryable by shrinking the output
    /// budget
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, BackendError::OutOfMemory(_))
    }
}

/// Sampling policy for one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Whether to sample at all; false means greedy decoding
    pub do_sample: bool,
    /// Softmax temperature; must be 0.0 when `do_sample` is false
    pub temperature: f32,
    /// Nucleus sampling cutoff
    pub top_p: f32,
    /// Random seed (0 = derive from system entropy)
    pub seed: u32,
}

impl SamplingParams {
    /// Greedy decoding: temperature 0, no sampling
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
        }
    }

    /// Nucleus sampling at the given temperature with the reference
    /// top-p of 0.95
    pub fn nucleus(temperature: f32) -> Self {
        Self {
            do_sample: true,
            temperature,
            top_p: 0.95,
            seed: 0,
        }
    }
}

/// Tokenizer surface shared by all local backends.
///
/// `encode` never adds special tokens; the stop watcher relies on that to
/// re-encode matched markers without a BOS prefix. Deliberately not
/// `Send`: generation loops hand a model-borrowing codec to the stop
/// watcher on whatever thread owns the weights.
pub trait TokenCodec {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;
    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError>;
}

/// A local autoregressive model running batched generation.
///
/// Implementations replicate `input` across `batch` sequences, advance all
/// of them one token per step inside a single shared loop, and call
/// `watcher.step` with the decoded suffixes after every advance. The loop
/// ends when the watcher reports all sequences done or `max_new_tokens` is
/// exhausted. Returned sequences contain only newly generated tokens, one
/// entry per batch slot, in slot order.
pub trait CausalBackend: TokenCodec + Send + Sync {
    fn generate(
        &self,
        input: &[TokenId],
        batch: usize,
        max_new_tokens: usize,
        params: &SamplingParams,
        watcher: &mut StopWatcher,
    ) -> Result<Vec<Vec<TokenId>>, BackendError>;
}

/// An encoder-decoder model with the same generation contract as
/// `CausalBackend`, but which may fail with `OutOfMemory` mid-call on
/// constrained accelerators. The retry decoder handles that case.
pub trait Seq2SeqBackend: TokenCodec + Send + Sync {
    fn generate(
        &self,
        input: &[TokenId],
        batch: usize,
        max_new_tokens: usize,
        params: &SamplingParams,
        watcher: &mut StopWatcher,
    ) -> Result<Vec<Vec<TokenId>>, BackendError>;
}

/// One request to a remote chat-completion API
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider-side model identifier
    pub model: String,
    /// Ordered role/content turns
    pub messages: Vec<ChatMessage>,
    /// Output token budget
    pub max_tokens: usize,
    pub temperature: f32,
    /// Nucleus cutoff; omitted from the wire request when None
    pub top_p: Option<f32>,
    /// Number of choices requested; providers without multi-choice support
    /// are always called with 1
    pub n: usize,
    /// Stop sequences forwarded to the provider
    pub stop: Vec<String>,
    /// Request a JSON-object response body (OpenAI response_format)
    pub json_object: bool,
}

/// Remote chat client boundary.
///
/// Returns exactly `request.n` completion texts in choice order. Whatever
/// rate-limit or backoff policy the provider needs lives behind this trait.
#[async_trait]
pub trait ChatBackend: Send + Sync + std::fmt::Debug {
    async fn complete(&self, request: &ChatRequest) -> Result<Vec<String>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_params_greedy() {
        let params = SamplingParams::greedy();
        assert!(!params.do_sample);
        assert_eq!(params.temperature, 0.0);
    }

    #[test]
    fn test_sampling_params_nucleus() {
        let params = SamplingParams::nucleus(0.8);
        assert!(params.do_sample);
        assert!((params.top_p - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_oom_detection() {
        assert!(BackendError::OutOfMemory("cuda".to_string()).is_out_of_memory());
        assert!(!BackendError::Inference("other".to_string()).is_out_of_memory());
    }
}
