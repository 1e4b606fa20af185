//! Batched-local decoder
//!
//! Renders the prompt once, replicates it across the batch, and runs one
//! shared generation loop in the backend with a `StopWatcher` tracking
//! per-sequence completion. The batch cannot stop a single sequence early
//! without abandoning the shared forward pass, so sequences that finish
//! first keep generating and are truncated afterwards from the watcher's
//! records.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::CausalBackend;
use crate::config::ModelConfig;
use crate::decoder::{
    check_sampling, effective_batch, finalize_sequences, sampling_params, Decoder,
};
use crate::error::Result;
use crate::registry::ModelSpec;
use crate::stop::{StopMarkerSet, StopWatcher};
use crate::template::TemplateFamily;

pub struct LocalDecoder {
    config: ModelConfig,
    family: TemplateFamily,
    markers: StopMarkerSet,
    backend: Arc<dyn CausalBackend>,
}

impl LocalDecoder {
    pub fn new(
        config: ModelConfig,
        family: TemplateFamily,
        markers: StopMarkerSet,
        backend: Arc<dyn CausalBackend>,
    ) -> Self {
        tracing::info!("Initializing a local decoder session: {}", config.name);
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
        backend: Arc<dyn CausalBackend>,
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
impl Decoder for LocalDecoder {
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
        tracing::debug!(
            "Rendered prompt to {} tokens, batch {}",
            tokens.len(),
            batch
        );

        let mut watcher = StopWatcher::new(batch, self.markers.clone());
        let params = sampling_params(&self.config, sample);
        let sequences = self.backend.generate(
            &tokens,
            batch,
            self.config.effective_max_new_tokens(),
            &params,
            &mut watcher,
        )?;

        finalize_sequences(
            self.backend.as_ref(),
            self.family,
            &self.markers,
            &watcher,
            &sequences,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, SamplingParams, TokenCodec, TokenId};

    /// Char-level fake backend replaying a scripted generation per slot
    struct ScriptedBackend {
        scripts: Vec<String>,
    }

    impl ScriptedBackend {
        fn new(scripts: &[&str]) -> Self {
            Self {
                scripts: scripts.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl TokenCodec for ScriptedBackend {
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

    impl CausalBackend for ScriptedBackend {
        fn generate(
            &self,
            _input: &[TokenId],
            batch: usize,
            max_new_tokens: usize,
            _params: &SamplingParams,
            watcher: &mut StopWatcher,
        ) -> std::result::Result<Vec<Vec<TokenId>>, BackendError> {
            // Replay each script one char per step, batched in lockstep
            let scripts: Vec<Vec<char>> = (0..batch)
                .map(|i| {
                    self.scripts[i % self.scripts.len()]
                        .chars()
                        .collect()
                })
                .collect();
            let longest = scripts.iter().map(|s| s.len()).max().unwrap_or(0);

            let mut generated = 0;
            while generated < max_new_tokens.min(longest) {
                generated += 1;
                let decodes: Vec<String> = scripts
                    .iter()
                    .map(|s| s.iter().take(generated).collect())
                    .collect();
                if watcher.step(&decodes, generated, self) {
                    break;
                }
            }

            Ok(scripts
                .into_iter()
                .map(|s| {
                    s.into_iter()
                        .take(generated)
                        .map(|c| c as TokenId)
                        .collect()
                })
                .collect())
        }
    }

    fn decoder(
        scripts: &[&str],
        batch_size: usize,
        temperature: f32,
        family: TemplateFamily,
    ) -> LocalDecoder {
        let config = ModelConfig::new("scripted", batch_size, temperature);
        LocalDecoder::new(
            config,
            family,
            family.stop_markers(),
            Arc::new(ScriptedBackend::new(scripts)),
        )
    }

    #[tokio::test]
    async fn test_completion_trimmed_at_endoftext() {
        let decoder = decoder(
            &["return a + b\n<|endoftext|>extra"],
            1,
            0.8,
            TemplateFamily::Completion,
        );
        let outputs = decoder
            .generate("def add(a, b):\n    ", true, 1)
            .await
            .unwrap();
        assert_eq!(outputs, vec!["return a + b\n".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_capped_at_configured_size() {
        let decoder = decoder(
            &["pass</s>"],
            4,
            0.8,
            TemplateFamily::Completion,
        );
        // 200 requested, 4 configured: exactly 4 returned by this call
        let outputs = decoder.generate("def f():\n    ", true, 200).await.unwrap();
        assert_eq!(outputs.len(), 4);
        for output in outputs {
            assert_eq!(output, "pass");
        }
    }

    #[tokio::test]
    async fn test_zero_temperature_multi_sample_rejected() {
        let decoder = decoder(&["pass"], 8, 0.0, TemplateFamily::Completion);
        let err = decoder.generate("def f():\n    ", false, 5).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::DecodeError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_full_text() {
        // No marker ever appears; the trimmer falls back to everything
        // generated within the budget
        let mut config = ModelConfig::new("scripted", 1, 0.8);
        config.max_new_tokens = 4;
        let decoder = LocalDecoder::new(
            config,
            TemplateFamily::Completion,
            TemplateFamily::Completion.stop_markers(),
            Arc::new(ScriptedBackend::new(&["abcdefgh"])),
        );
        let outputs = decoder.generate("x", true, 1).await.unwrap();
        assert_eq!(outputs, vec!["abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_mixed_batch_truncates_each_sequence() {
        // Slot 0 finishes early, slot 1 later; both keep generating until
        // the whole batch is done, then each is cut at its own record
        let decoder = decoder(
            &["a</s>xxxxxxxx", "longer one</s>"],
            2,
            0.8,
            TemplateFamily::Completion,
        );
        let outputs = decoder.generate("x", true, 2).await.unwrap();
        assert_eq!(outputs, vec!["a".to_string(), "longer one".to_string()]);
    }

    #[tokio::test]
    async fn test_conversational_family_trims_fence() {
        let decoder = decoder(
            &["    return a + b\n```\nHope this helps!"],
            1,
            0.8,
            TemplateFamily::ChatMl,
        );
        let outputs = decoder
            .generate("def add(a, b):\n    ", true, 1)
            .await
            .unwrap();
        assert_eq!(outputs, vec!["    return a + b".to_string()]);
    }
}
