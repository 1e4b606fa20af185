//! Polymorphic decoder core
//!
//! One operation — generate `num_samples` completions for a prompt —
//! implemented by three algorithms parameterized by template data:
//! batched-local (`LocalDecoder`), remote-per-call (`RemoteDecoder`) and
//! OOM-retrying seq2seq (`RetryDecoder`). Family differences live entirely
//! in `TemplateFamily` and the stop-marker set, not in subtypes.

use async_trait::async_trait;

use crate::backend::{SamplingParams, TokenCodec, TokenId};
use crate::config::ModelConfig;
use crate::error::{DecodeError, Result};
use crate::stop::{StopMarkerSet, StopWatcher};
use crate::template::TemplateFamily;

pub mod local;
pub mod remote;
pub mod retry;

pub use local::LocalDecoder;
pub use remote::{RemoteDecoder, RemoteStyle};
pub use retry::RetryDecoder;

/// A configured decoding session bound to one model backend.
///
/// `generate` returns at most `min(batch_size, num_samples)` completions
/// per call; callers wanting more issue further calls. Each call is
/// independent: a failure never rolls back earlier results.
#[async_trait]
pub trait Decoder: Send + Sync {
    fn config(&self) -> &ModelConfig;

    async fn generate(
        &self,
        prompt: &str,
        sample: bool,
        num_samples: usize,
    ) -> Result<Vec<String>>;
}

/// Validates the sampling preconditions shared by every variant.
///
/// Deterministic decoding (`sample == false`) requires temperature 0 and
/// exactly one sample; sampling requires a strictly positive temperature.
/// Violations fail fast, never coerce.
pub(crate) fn check_sampling(
    config: &ModelConfig,
    sample: bool,
    num_samples: usize,
) -> Result<()> {
    if config.batch_size == 0 {
        return Err(DecodeError::invalid("batch_size must be at least 1"));
    }
    if num_samples == 0 {
        return Err(DecodeError::invalid("num_samples must be at least 1"));
    }
    if sample {
        if config.temperature <= 0.0 {
            return Err(DecodeError::invalid(
                "Temperature must be greater than 0 when sampling",
            ));
        }
    } else {
        if config.temperature != 0.0 {
            return Err(DecodeError::invalid(
                "Deterministic decoding requires temperature 0",
            ));
        }
        if num_samples != 1 {
            return Err(DecodeError::invalid(
                "Deterministic decoding requires exactly one sample",
            ));
        }
    }
    Ok(())
}

/// Samples produced by one call: never more than the configured batch,
/// never more than requested
pub(crate) fn effective_batch(config: &ModelConfig, num_samples: usize) -> usize {
    config.batch_size.min(num_samples)
}

pub(crate) fn sampling_params(config: &ModelConfig, sample: bool) -> SamplingParams {
    if sample {
        SamplingParams::nucleus(config.temperature)
    } else {
        SamplingParams::greedy()
    }
}

/// Shared post-processing for local variants: truncate each sequence at
/// its recorded completion length (falling back to the full sequence when
/// the budget ran out first), decode, trim at the earliest marker, and
/// restore the family's canonical whitespace.
pub(crate) fn finalize_sequences<C: TokenCodec + ?Sized>(
    codec: &C,
    family: TemplateFamily,
    markers: &StopMarkerSet,
    watcher: &StopWatcher,
    sequences: &[Vec<TokenId>],
) -> Result<Vec<String>> {
    let mut outputs = Vec::with_capacity(sequences.len());
    for (index, sequence) in sequences.iter().enumerate() {
        let cut = watcher
            .end_length(index)
            .map(|n| n.min(sequence.len()))
            .unwrap_or(sequence.len());
        let text = codec.decode(&sequence[..cut])?;
        let trimmed = markers.trim(&text);
        outputs.push(family.restore(trimmed));
    }
    Ok(outputs)
}
