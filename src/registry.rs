//! Backend selector
//!
//! Maps a logical model identifier to a concrete decoder configuration:
//! backend kind, weight repository, template family, stop-marker
//! augmentation and budget overrides. Pure lookup over a closed catalog
//! plus a few numeric-suffix patterns; unknown identifiers fail fast.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::backend::remote::Provider;
use crate::config::{ModelConfig, Precision};
use crate::error::DecodeError;
use crate::stop::StopMarkerSet;
use crate::template::TemplateFamily;

/// Which decoder algorithm serves this model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local batched autoregressive generation
    Causal,
    /// Local encoder-decoder generation with OOM retry
    Seq2Seq,
    /// Remote chat API, one request per completion
    Remote(Provider),
}

/// Resolved decoder configuration for one logical model
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Weight repository or provider-side model id
    pub repo: String,
    pub kind: BackendKind,
    pub family: TemplateFamily,
    /// Selects the conversational output budget
    pub conversational: bool,
    pub precision: Precision,
    pub trust_remote_code: bool,
    /// Numeric size parameter parsed out of pattern identifiers
    pub size_billions: Option<f32>,
    /// Completion-budget override, where the catalog specifies one
    pub max_new_tokens: Option<usize>,
    /// Checkpoint-specific sentinel markers beyond the family's own
    pub extra_stop_markers: Vec<String>,
}

impl ModelSpec {
    fn new(repo: impl Into<String>, kind: BackendKind, family: TemplateFamily) -> Self {
        Self {
            repo: repo.into(),
            kind,
            family,
            conversational: family.is_conversational(),
            precision: Precision::default(),
            trust_remote_code: false,
            size_billions: None,
            max_new_tokens: None,
            extra_stop_markers: Vec::new(),
        }
    }

    fn causal(repo: impl Into<String>, family: TemplateFamily) -> Self {
        Self::new(repo, BackendKind::Causal, family)
    }

    fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    fn trust_remote_code(mut self) -> Self {
        self.trust_remote_code = true;
        self
    }

    fn size(mut self, billions: f32) -> Self {
        self.size_billions = Some(billions);
        self
    }

    fn conversational(mut self) -> Self {
        self.conversational = true;
        self
    }

    fn max_new_tokens(mut self, budget: usize) -> Self {
        self.max_new_tokens = Some(budget);
        self
    }

    fn extra_markers(mut self, markers: &[&str]) -> Self {
        self.extra_stop_markers = markers.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Union of the base set, the family's additions, and any
    /// checkpoint-specific markers
    pub fn stop_markers(&self) -> StopMarkerSet {
        let mut markers = self.family.stop_markers();
        markers.extend(self.extra_stop_markers.iter().cloned());
        markers
    }

    /// Builds the per-session configuration for this spec
    pub fn to_config(&self, batch_size: usize, temperature: f32) -> ModelConfig {
        let mut config = ModelConfig::new(self.repo.clone(), batch_size, temperature);
        config.conversational = self.conversational;
        config.precision = self.precision;
        config.trust_remote_code = self.trust_remote_code;
        if let Some(budget) = self.max_new_tokens {
            config.max_new_tokens = budget;
        }
        config
    }
}

static STARCODER2_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^starcoder2-(\d+)b$").expect("static pattern"));
static DEEPSEEK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^deepseek-coder-(\d+\.?\d*)b(.*)$").expect("static pattern"));
static CODEGEMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"codegemma-(\d+)b").expect("static pattern"));

/// Formats a parsed size the way weight repositories spell it: integral
/// values without the decimal point
fn format_size(billions: f32) -> String {
    if billions.fract() == 0.0 {
        format!("{}", billions as i64)
    } else {
        format!("{billions}")
    }
}

fn invalid(name: &str) -> DecodeError {
    DecodeError::InvalidArgument(format!("Invalid model name: {name}"))
}

/// Resolves a logical model identifier to a decoder configuration.
///
/// Fails with `InvalidArgument` when the identifier matches neither the
/// flat catalog nor any pattern family.
pub fn resolve(name: &str) -> Result<ModelSpec, DecodeError> {
    use Precision::*;
    use TemplateFamily::*;

    let spec = match name {
        "codegen-2b" => ModelSpec::causal("Salesforce/codegen-2B-mono", Completion)
            .precision(Float16)
            .size(2.0),
        "codegen-6b" => ModelSpec::causal("Salesforce/codegen-6B-mono", Completion)
            .precision(Float16)
            .size(6.0),
        "codegen-16b" => ModelSpec::causal("Salesforce/codegen-16B-mono", Completion)
            .precision(Float16)
            .size(16.0),
        "codegen2-1b" => ModelSpec::causal("Salesforce/codegen2-1B", Codegen2)
            .trust_remote_code()
            .size(1.0),
        "codegen2-3b" => ModelSpec::causal("Salesforce/codegen2-3_7B", Codegen2)
            .trust_remote_code()
            .size(3.7),
        "codegen2-7b" => ModelSpec::causal("Salesforce/codegen2-7B", Codegen2)
            .trust_remote_code()
            .size(7.0),
        "codegen2-16b" => {
            tracing::warn!(
                "codegen2-16b checkpoint is `unfinished` according to its paper; \
                 results may not be meaningful"
            );
            ModelSpec::causal("Salesforce/codegen2-16B", Codegen2)
                .trust_remote_code()
                .size(16.0)
        }
        "polycoder" => ModelSpec::causal("NinedayWang/PolyCoder-2.7B", Completion),
        "santacoder" => {
            ModelSpec::causal("bigcode/santacoder", SantaCoder).trust_remote_code()
        }
        "incoder-1b" => ModelSpec::causal("facebook/incoder-1B", Incoder).size(1.0),
        "incoder-6b" => ModelSpec::causal("facebook/incoder-6B", Incoder).size(6.0),
        "stablelm-7b" => {
            ModelSpec::causal("StabilityAI/stablelm-base-alpha-7b", Completion).size(7.0)
        }
        "gptneo-2b" => ModelSpec::causal("EleutherAI/gpt-neo-2.7B", Completion),
        "gpt-j" => ModelSpec::causal("EleutherAI/gpt-j-6B", Completion),
        "codet5p-2b" => {
            ModelSpec::new("Salesforce/codet5p-2b", BackendKind::Seq2Seq, CodeT5).size(2.0)
        }
        "codet5p-6b" => {
            ModelSpec::new("Salesforce/codet5p-6b", BackendKind::Seq2Seq, CodeT5).size(6.0)
        }
        "codet5p-16b" => {
            ModelSpec::new("Salesforce/codet5p-16b", BackendKind::Seq2Seq, CodeT5).size(16.0)
        }
        "magicoder-s-ds-6.7b" => {
            ModelSpec::causal("ise-uiuc/Magicoder-S-DS-6.7B", Magicoder).size(6.7)
        }
        "magicoder-s-cl-7b" => {
            ModelSpec::causal("ise-uiuc/Magicoder-S-CL-7B", Magicoder).size(7.0)
        }
        "wizardcoder-33b-v1.1" => ModelSpec::causal("WizardLM/WizardCoder-33B-V1.1", Alpaca)
            .precision(Float16)
            .size(33.0),
        "wizardcoder-34b" => {
            ModelSpec::causal("WizardLM/WizardCoder-Python-34B-V1.0", Alpaca)
                .precision(Float16)
                .size(34.0)
        }
        "wizardcoder-15b" => ModelSpec::causal("WizardLM/WizardCoder-15B-V1.0", Alpaca)
            .precision(Float16)
            .size(15.0),
        "wizardcoder-7b" => {
            ModelSpec::causal("WizardLM/WizardCoder-Python-7B-V1.0", Alpaca)
                .precision(Float16)
                .size(7.0)
        }
        "mistral-7b-codealpaca" => {
            ModelSpec::causal("Nondzu/Mistral-7B-codealpaca-lora", Completion)
                .precision(Float16)
        }
        "zephyr-7b" => ModelSpec::causal("HuggingFaceH4/zephyr-7b-beta", Completion),
        "codebooga-34b" => {
            ModelSpec::causal("oobabooga/CodeBooga-34B-v0.1", Completion).precision(Float16)
        }
        "code-13b" => ModelSpec::causal("ajibawa-2023/Code-13B", AjibawaCode).size(13.0),
        "code-33b" => ModelSpec::causal("ajibawa-2023/Code-33B", AjibawaCode).size(33.0),
        "python-code-13b" => {
            ModelSpec::causal("ajibawa-2023/Python-Code-13B", AjibawaCode).size(13.0)
        }
        "python-code-33b" => {
            ModelSpec::causal("ajibawa-2023/Python-Code-33B", AjibawaCode).size(33.0)
        }
        "phind-code-llama-34b-v2" => {
            ModelSpec::causal("Phind/Phind-CodeLlama-34B-v2", Completion).size(34.0)
        }
        "mistral-7b" => ModelSpec::causal("mistralai/Mistral-7B-v0.1", Completion),
        "dolphin-2.6" => {
            ModelSpec::causal("cognitivecomputations/dolphin-2.6-mixtral-8x7b", ChatMl)
                .max_new_tokens(512 + 256)
        }
        "solar-10.7b-instruct" => {
            ModelSpec::causal("upstage/SOLAR-10.7B-Instruct-v1.0", Solar)
                .precision(Float16)
                .size(10.7)
        }
        "mistral-hermes-codepro-7b" => {
            ModelSpec::causal("beowolx/MistralHermes-CodePro-7B-v1", ChatMl)
                .max_new_tokens(512 + 256)
        }
        "phi-2" => ModelSpec::causal("microsoft/phi-2", Completion)
            .precision(Float16)
            .trust_remote_code(),
        "openchat" => ModelSpec::causal("openchat/openchat-3.5-0106", OpenChat),
        "speechless-codellama-34b" => {
            ModelSpec::causal("uukuguy/speechless-codellama-34b-v2.0", Alpaca)
                .precision(Float16)
                .size(34.0)
        }
        "speechless-mistral-7b" => {
            ModelSpec::causal("uukuguy/speechless-code-mistral-7b-v1.0", Alpaca)
                .precision(Float16)
                .size(7.0)
        }
        "speechless-coder-ds-6.7b" => {
            ModelSpec::causal("uukuguy/speechless-coder-ds-6.7b", Completion)
                .precision(Float16)
                .size(6.7)
                .conversational()
                .extra_markers(&["<｜end▁of▁sentence｜>"])
        }
        "speechless-coding-7b-16k-tora" => {
            ModelSpec::causal("uukuguy/speechless-coding-7b-16k-tora", Completion)
                .size(7.0)
                .conversational()
                .extra_markers(&["</s>"])
        }
        "code-millenials-34b" => {
            ModelSpec::causal("budecosystem/code-millenials-34b", Alpaca)
                .precision(Float16)
                .size(34.0)
        }
        "xdan-l1-chat" => ModelSpec::causal("xDAN-AI/xDAN-L1-Chat-dpo-qlora-v1", Alpaca),
        "stable-code-3b" => ModelSpec::causal("stabilityai/stable-code-3b", Completion)
            .trust_remote_code()
            .size(3.0),
        "xwincoder-34b" => ModelSpec::causal("Xwin-LM/XwinCoder-34B", XwinCoder).size(34.0),
        "zyte-1b" => ModelSpec::causal("aihub-app/zyte-1B", Zyte).size(1.0),
        "white-rabbit-neo-33b-v1" => {
            ModelSpec::causal("whiterabbitneo/WhiteRabbitNeo-33B-v-1", WhiteRabbitNeo)
                .precision(Float16)
                .size(33.0)
        }
        "opencodeinterpreter-ds-6.7b" => {
            ModelSpec::causal("m-a-p/OpenCodeInterpreter-DS-6.7B", OpenCodeInterpreter)
                .size(6.7)
        }
        "opencodeinterpreter-ds-33b" => {
            ModelSpec::causal("m-a-p/OpenCodeInterpreter-DS-33B", OpenCodeInterpreter)
                .size(33.0)
        }
        "mistral-large-latest" => ModelSpec::new(
            "mistral-large-latest",
            BackendKind::Remote(Provider::Mistral),
            MistralChat,
        ),
        _ => return resolve_pattern(name),
    };

    Ok(spec)
}

/// Pattern-based identifiers: a family name followed by a numeric size
/// suffix parsed out of the string
fn resolve_pattern(name: &str) -> Result<ModelSpec, DecodeError> {
    use TemplateFamily::*;

    if name.starts_with("gpt-3.5-") || name.starts_with("gpt-4-") {
        return Ok(ModelSpec::new(
            name,
            BackendKind::Remote(Provider::OpenAi),
            OpenAiChat,
        ));
    }

    if name.starts_with("claude") {
        return Ok(ModelSpec::new(
            name,
            BackendKind::Remote(Provider::Anthropic),
            AnthropicChat,
        ));
    }

    if let Some(captures) = STARCODER2_RE.captures(name) {
        let billions: f32 = captures[1].parse().map_err(|_| invalid(name))?;
        return Ok(ModelSpec::causal(
            format!("bigcode/starcoder2-{}b", format_size(billions)),
            Completion,
        )
        .size(billions));
    }

    // Older starcoder checkpoints use fill-in-the-middle sentinels
    if name.starts_with("starcoder") {
        return Ok(ModelSpec::causal(format!("bigcode/{name}"), StarCoder));
    }

    if name.starts_with("code-llama-") {
        return resolve_code_llama(name);
    }

    if let Some(captures) = DEEPSEEK_RE.captures(name) {
        let billions: f32 = captures[1].parse().map_err(|_| invalid(name))?;
        let remainder = &captures[2];
        // An explicit version suffix rides along on the repo name
        let version = remainder.rsplit('-').next().unwrap_or("");
        let version_suffix = if version.starts_with('v') {
            format!("-{version}")
        } else {
            String::new()
        };

        let spec = if name.contains("instruct") {
            ModelSpec::causal(
                format!(
                    "deepseek-ai/deepseek-coder-{}b-instruct{version_suffix}",
                    format_size(billions)
                ),
                DeepSeekInstruct,
            )
        } else {
            ModelSpec::causal(
                format!(
                    "deepseek-ai/deepseek-coder-{}b-base{version_suffix}",
                    format_size(billions)
                ),
                Completion,
            )
        };
        return Ok(spec.size(billions));
    }

    if name.contains("codegemma") {
        let captures = CODEGEMMA_RE.captures(name).ok_or_else(|| invalid(name))?;
        let billions: f32 = captures[1].parse().map_err(|_| invalid(name))?;
        return Ok(ModelSpec::causal(
            format!("TechxGenus/CodeGemma-{}b", format_size(billions)),
            CodeGemma,
        )
        .size(billions));
    }

    Err(invalid(name))
}

fn resolve_code_llama(name: &str) -> Result<ModelSpec, DecodeError> {
    use TemplateFamily::*;

    if name.ends_with("instruct") {
        // code-llama-{nb}b-instruct
        let nb = name.split('-').nth(2).ok_or_else(|| invalid(name))?;
        if !nb.ends_with('b') {
            return Err(invalid(name));
        }
        let billions: f32 = nb[..nb.len() - 1].parse().map_err(|_| invalid(name))?;

        let spec = if nb == "70b" {
            ModelSpec::causal("codellama/CodeLlama-70B-Instruct-hf", CodeLlama70bInstruct)
        } else {
            ModelSpec::causal(
                format!("codellama/CodeLlama-{nb}-Instruct-hf"),
                CodeLlamaInstruct,
            )
        };
        return Ok(spec.size(billions));
    }

    let nb = name.rsplit('-').next().ok_or_else(|| invalid(name))?;
    if !nb.ends_with('b') {
        return Err(invalid(name));
    }
    let billions: f32 = nb[..nb.len() - 1].parse().map_err(|_| invalid(name))?;

    // Multi-lingual checkpoints, otherwise Python-only
    let repo = if name.starts_with("code-llama-multi") {
        format!("codellama/CodeLlama-{nb}-hf")
    } else {
        format!("codellama/CodeLlama-{nb}-Python-hf")
    };

    Ok(ModelSpec::causal(repo, TemplateFamily::Completion).size(billions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_catalog_entry() {
        let spec = resolve("codegen-2b").unwrap();
        assert_eq!(spec.repo, "Salesforce/codegen-2B-mono");
        assert_eq!(spec.kind, BackendKind::Causal);
        assert_eq!(spec.family, TemplateFamily::Completion);
        assert_eq!(spec.precision, Precision::Float16);
        assert!(!spec.conversational);
    }

    #[test]
    fn test_unknown_identifier_fails_fast() {
        let err = resolve("definitely-not-a-model").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidArgument(_)));
    }

    #[test]
    fn test_deepseek_instruct_pattern() {
        let spec = resolve("deepseek-coder-6.7b-instruct").unwrap();
        assert_eq!(spec.repo, "deepseek-ai/deepseek-coder-6.7b-instruct");
        assert_eq!(spec.family, TemplateFamily::DeepSeekInstruct);
        assert_eq!(spec.size_billions, Some(6.7));
        // Instruct sessions use the conversational budget
        assert!(spec.conversational);
        let config = spec.to_config(1, 0.8);
        assert_eq!(config.effective_max_new_tokens(), 1024);
    }

    #[test]
    fn test_deepseek_base_pattern_with_version() {
        let spec = resolve("deepseek-coder-7b-base-v1.5").unwrap();
        assert_eq!(spec.repo, "deepseek-ai/deepseek-coder-7b-base-v1.5");
        assert_eq!(spec.family, TemplateFamily::Completion);
        assert!(!spec.conversational);
    }

    #[test]
    fn test_deepseek_integral_size_collapses() {
        let spec = resolve("deepseek-coder-33b-instruct").unwrap();
        assert_eq!(spec.repo, "deepseek-ai/deepseek-coder-33b-instruct");
        assert_eq!(spec.size_billions, Some(33.0));
    }

    #[test]
    fn test_starcoder2_pattern() {
        let spec = resolve("starcoder2-15b").unwrap();
        assert_eq!(spec.repo, "bigcode/starcoder2-15b");
        assert_eq!(spec.size_billions, Some(15.0));
        assert_eq!(spec.family, TemplateFamily::Completion);
    }

    #[test]
    fn test_starcoder_infill_fallback() {
        let spec = resolve("starcoderbase").unwrap();
        assert_eq!(spec.repo, "bigcode/starcoderbase");
        assert_eq!(spec.family, TemplateFamily::StarCoder);
    }

    #[test]
    fn test_code_llama_variants() {
        let spec = resolve("code-llama-7b").unwrap();
        assert_eq!(spec.repo, "codellama/CodeLlama-7b-Python-hf");

        let spec = resolve("code-llama-multi-13b").unwrap();
        assert_eq!(spec.repo, "codellama/CodeLlama-13b-hf");

        let spec = resolve("code-llama-7b-instruct").unwrap();
        assert_eq!(spec.repo, "codellama/CodeLlama-7b-Instruct-hf");
        assert_eq!(spec.family, TemplateFamily::CodeLlamaInstruct);

        let spec = resolve("code-llama-70b-instruct").unwrap();
        assert_eq!(spec.family, TemplateFamily::CodeLlama70bInstruct);
    }

    #[test]
    fn test_codegemma_pattern() {
        let spec = resolve("codegemma-7b").unwrap();
        assert_eq!(spec.repo, "TechxGenus/CodeGemma-7b");
        assert_eq!(spec.size_billions, Some(7.0));
        assert!(spec.conversational);
    }

    #[test]
    fn test_remote_prefixes() {
        let spec = resolve("gpt-4-1106-preview").unwrap();
        assert_eq!(spec.kind, BackendKind::Remote(Provider::OpenAi));
        assert_eq!(spec.repo, "gpt-4-1106-preview");
        assert!(spec.conversational);

        let spec = resolve("claude-3-opus-20240229").unwrap();
        assert_eq!(spec.kind, BackendKind::Remote(Provider::Anthropic));

        let spec = resolve("mistral-large-latest").unwrap();
        assert_eq!(spec.kind, BackendKind::Remote(Provider::Mistral));
    }

    #[test]
    fn test_seq2seq_kind() {
        let spec = resolve("codet5p-2b").unwrap();
        assert_eq!(spec.kind, BackendKind::Seq2Seq);
        assert_eq!(spec.family, TemplateFamily::CodeT5);
    }

    #[test]
    fn test_speechless_checkpoint_markers() {
        let spec = resolve("speechless-coder-ds-6.7b").unwrap();
        let markers = spec.stop_markers();
        assert!(markers
            .markers()
            .contains(&"<｜end▁of▁sentence｜>".to_string()));
        // Base set still present: augmented, never replaced
        assert!(markers.markers().contains(&"<|endoftext|>".to_string()));
        assert!(spec.conversational);
    }

    #[test]
    fn test_budget_override() {
        let spec = resolve("dolphin-2.6").unwrap();
        let config = spec.to_config(1, 0.8);
        assert_eq!(config.max_new_tokens, 768);
        // ChatML sessions still select the conversational budget
        assert!(config.conversational);
    }
}
