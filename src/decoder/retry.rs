//! OOM-retrying seq2seq decoder
//!
//! Encoder-decoder checkpoints on constrained accelerators can run out of
//! memory mid-generation. This variant shrinks the output budget by a
//! fixed ratio and retries until generation succeeds or the budget reaches
//! zero, which is fatal. Only out-of-memory failures are retried;
//! everything else propagates unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::Seq2SeqBackend;
use crate::config::ModelConfig;
use crate::decoder::{
    check_sampling, effective_batch, finalize_sequences, sampling_params, Decoder,
};
use crate::error::{DecodeError, Result};
use crate::registry::ModelSpec;
use crate::stop::{StopMarkerSet, StopWatcher};
use crate::template::TemplateFamily;

/// Budget multiplier applied after each out-of-memory failure
pub const OOM_SHRINK_RATIO: f64 = 0.8;

pub struct RetryDecoder {
    config: ModelConfig,
    family: TemplateFamily,
    markers: StopMarkerSet,
    backend: Arc<dyn Seq2SeqBackend>,
}

impl RetryDecoder {
    pub fn new(
        config: ModelConfig,
        family: TemplateFamily,
        markers: StopMarkerSet,
        backend: Arc<dyn Seq2SeqBackend>,
    ) -> Self {
        tracing::info!("Initializing a seq2seq decoder session: {}", config.name);
        Self {
            config,
            family,
            markers,
            backend,
        }
    }

    /// Builds a session from a resolved registry entry
    pub fn from_spec(
        spec: &ModelSpec,
        batch_size: usize,
        temperature: f32,
        backend: Arc<dyn Seq2SeqBackend>,
    ) -> Self {
        Self::new(
            spec.to_config(batch_size, temperature),
            spec.family,
            spec.stop_markers(),
            backend,
        )
    }
}

#[async_trait]
impl Decoder for RetryDecoder {
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

        let input = self.family.render(prompt);
        let tokens = self.backend.encode(&input)?;
        let params = sampling_params(&self.config, sample);

        let mut budget = self.config.effective_max_new_tokens();
        loop {
            if budget == 0 {
                return Err(DecodeError::ResourceExhausted(format!(
                    "Output budget exhausted by repeated OOM failures for {}",
                    self.config.name
                )));
            }

            let mut watcher = StopWatcher::new(batch, self.markers.clone());
            match self
                .backend
                .generate(&tokens, batch, budget, &params, &mut watcher)
            {
                Ok(sequences) => {
                    return finalize_sequences(
                        self.backend.as_ref(),
                        self.family,
                        &self.markers,
                        &watcher,
                        &sequences,
                    );
                }
                Err(e) if e.is_out_of_memory() => {
                    // Integer floor guarantees a strict decrease for any
                    // positive budget, so the loop terminates
                    let reduced = (budget as f64 * OOM_SHRINK_RATIO) as usize;
                    tracing::warn!(
                        "OOM, reducing max_new_tokens from {} to {}",
                        budget,
                        reduced
                    );
                    budget = reduced;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, SamplingParams, TokenCodec, TokenId};
    use std::sync::Mutex;

    /// Fails with OOM until the budget drops to `fits_within`, then
    /// generates a fixed completion
    struct FlakyBackend {
        fits_within: usize,
        completion: String,
        budgets_seen: Mutex<Vec<usize>>,
    }

    impl FlakyBackend {
        fn new(fits_within: usize, completion: &str) -> Self {
            Self {
                fits_within,
                completion: completion.to_string(),
                budgets_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl TokenCodec for FlakyBackend {
        fn encode(&self, text: &str) -> std::result::Result<Vec<TokenId>, BackendError> {
            Ok(text.chars().map(|c| c as TokenId).collect())
        }

        fn decode(&self, tokens: &[TokenId]) -> std::result::Result<String, BackendError> {
            Ok(tokens
                .iter()
                .filter_map(|&t| char::from_u32(t as u32))
                .collect())
        }
    }

    impl Seq2SeqBackend for FlakyBackend {
        fn generate(
            &self,
            _input: &[TokenId],
            batch: usize,
            max_new_tokens: usize,
            _params: &SamplingParams,
            watcher: &mut StopWatcher,
        ) -> std::result::Result<Vec<Vec<TokenId>>, BackendError> {
            self.budgets_seen.lock().unwrap().push(max_new_tokens);
            if max_new_tokens > self.fits_within {
                return Err(BackendError::OutOfMemory("CUDA out of memory".to_string()));
            }
            let chars: Vec<char> = self.completion.chars().collect();
            let generated = chars.len().min(max_new_tokens);
            let decode: String = chars.iter().take(generated).collect();
            watcher.step(&vec![decode; batch], generated, self);
            Ok(vec![
                chars[..generated].iter().map(|&c| c as TokenId).collect();
                batch
            ])
        }
    }

    fn config(max_new_tokens: usize) -> ModelConfig {
        let mut config = ModelConfig::new("Salesforce/codet5p-2b", 1, 0.8);
        config.max_new_tokens = max_new_tokens;
        config
    }

    #[tokio::test]
    async fn test_budget_shrinks_until_success() {
        let backend = Arc::new(FlakyBackend::new(300, "pass</s>"));
        let decoder = RetryDecoder::new(
            config(512),
            TemplateFamily::CodeT5,
            TemplateFamily::CodeT5.stop_markers(),
            backend.clone(),
        );

        let outputs = decoder.generate("def f():\n    ", true, 1).await.unwrap();
        assert_eq!(outputs, vec!["pass".to_string()]);

        // 512 -> 409 -> 327 -> 261: strictly decreasing, stops at success
        let budgets = backend.budgets_seen.lock().unwrap().clone();
        assert_eq!(budgets, vec![512, 409, 327, 261]);
        assert!(budgets.windows(2).all(|w| w[1] < w[0]));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_fatal() {
        let backend = Arc::new(FlakyBackend::new(0, "unreachable"));
        let decoder = RetryDecoder::new(
            config(8),
            TemplateFamily::CodeT5,
            TemplateFamily::CodeT5.stop_markers(),
            backend,
        );

        let err = decoder.generate("def f():\n    ", true, 1).await.unwrap_err();
        assert!(matches!(err, DecodeError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_non_oom_failure_not_retried() {
        struct BrokenBackend;

        impl TokenCodec for BrokenBackend {
            fn encode(&self, text: &str) -> std::result::Result<Vec<TokenId>, BackendError> {
                Ok(text.chars().map(|c| c as TokenId).collect())
            }
            fn decode(&self, _: &[TokenId]) -> std::result::Result<String, BackendError> {
                Ok(String::new())
            }
        }

        impl Seq2SeqBackend for BrokenBackend {
            fn generate(
                &self,
                _: &[TokenId],
                _: usize,
                _: usize,
                _: &SamplingParams,
                _: &mut StopWatcher,
            ) -> std::result::Result<Vec<Vec<TokenId>>, BackendError> {
                Err(BackendError::Inference("kernel launch failed".to_string()))
            }
        }

        let decoder = RetryDecoder::new(
            config(512),
            TemplateFamily::CodeT5,
            TemplateFamily::CodeT5.stop_markers(),
            Arc::new(BrokenBackend),
        );

        let err = decoder.generate("def f():\n    ", true, 1).await.unwrap_err();
        assert!(matches!(err, DecodeError::Backend(_)));
    }

    #[tokio::test]
    async fn test_whitespace_restored_after_decode() {
        // CodeT5 substitutes four spaces for tabs on input and inverts it
        // on output
        let backend = Arc::new(FlakyBackend::new(512, "\treturn 1</s>"));
        let decoder = RetryDecoder::new(
            config(512),
            TemplateFamily::CodeT5,
            TemplateFamily::CodeT5.stop_markers(),
            backend,
        );

        let outputs = decoder.generate("def f():\n    ", true, 1).await.unwrap();
        assert_eq!(outputs, vec!["    return 1".to_string()]);
    }
}
