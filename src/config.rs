//! Decoding configuration
//!
//! Two layers: `RuntimeConfig` captures what used to be ambient process
//! state (GPU split, cache directory) as an explicit struct handed to
//! construction, and `ModelConfig` holds the per-session decoding
//! parameters. Both are immutable once a session starts.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Completion-mode output budget (tokens)
pub const DEFAULT_MAX_NEW_TOKENS: usize = 512;
/// Conversational-mode output budget (tokens)
pub const DEFAULT_MAX_CONVERSATIONAL_NEW_TOKENS: usize = 1024;
/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.8;

/// Errors from loading or persisting a runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access cache directory: {0}")]
    CacheDir(String),
    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Numeric precision preference for local weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    BFloat16,
    Float16,
    Float32,
}

/// Process-wide runtime settings, replacing environment-variable globals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of GPUs to split local models across
    pub gpu_count: usize,
    /// Number of layers to offload to the accelerator (0 = CPU only)
    pub gpu_layers: u32,
    /// Directory for downloaded model weights
    pub cache_dir: PathBuf,
    /// Context window cap for local generation
    pub max_context_size: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            gpu_layers: 99, // Offload all layers by default
            cache_dir: default_cache_dir()
                .unwrap_or_else(|_| PathBuf::from("./models")),
            max_context_size: 2048,
        }
    }
}

impl RuntimeConfig {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        if self.gpu_count == 0 {
            self.gpu_count = 1;
        }
        if self.max_context_size < 2048 {
            self.max_context_size = 2048;
        }
    }

    /// Load a runtime configuration from a JSON file, falling back to
    /// defaults when the file is missing or corrupted
    pub fn load(path: &PathBuf) -> Self {
        match Self::load_internal(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load runtime config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    fn load_internal(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Runtime config not found, using defaults");
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&json)?;
        config.validate();
        Ok(config)
    }

    /// Persist this configuration as JSON
    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Platform cache directory for model weights
fn default_cache_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("dev", "genbench", "genbench")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .ok_or_else(|| ConfigError::CacheDir("Could not determine cache directory".to_string()))
}

/// Per-session decoding configuration.
///
/// One instance per decoding session, created at startup and immutable
/// afterwards. The output budget depends on whether the session renders
/// prompts conversationally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Logical model name (the identifier handed to the registry)
    pub name: String,
    /// Upper bound on samples produced by one generate call
    pub batch_size: usize,
    /// Sampling temperature; 0.0 means deterministic decoding
    pub temperature: f32,
    /// Output budget for raw-completion sessions
    pub max_new_tokens: usize,
    /// Output budget for conversational sessions
    pub max_conversational_new_tokens: usize,
    /// Selects which budget applies
    pub conversational: bool,
    /// Weight precision preference
    pub precision: Precision,
    /// Permit backends to run non-sandboxed remote code
    pub trust_remote_code: bool,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, batch_size: usize, temperature: f32) -> Self {
        Self {
            name: name.into(),
            batch_size,
            temperature,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            max_conversational_new_tokens: DEFAULT_MAX_CONVERSATIONAL_NEW_TOKENS,
            conversational: false,
            precision: Precision::default(),
            trust_remote_code: false,
        }
    }

    /// The output budget in effect for this session
    pub fn effective_max_new_tokens(&self) -> usize {
        if self.conversational {
            self.max_conversational_new_tokens
        } else {
            self.max_new_tokens
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_validate_clamps() {
        let mut config = RuntimeConfig {
            gpu_count: 0,
            gpu_layers: 0,
            cache_dir: PathBuf::from("/tmp"),
            max_context_size: 128,
        };
        config.validate();
        assert_eq!(config.gpu_count, 1);
        assert_eq!(config.max_context_size, 2048);
    }

    #[test]
    fn test_runtime_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");

        let mut config = RuntimeConfig::default();
        config.gpu_count = 4;
        config.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path);
        assert_eq!(loaded.gpu_count, 4);
    }

    #[test]
    fn test_runtime_config_missing_file_defaults() {
        let loaded = RuntimeConfig::load(&PathBuf::from("/nonexistent/runtime.json"));
        assert_eq!(loaded.gpu_count, 1);
    }

    #[test]
    fn test_budget_selection() {
        let mut config = ModelConfig::new("codegen-2b", 4, 0.8);
        assert_eq!(config.effective_max_new_tokens(), DEFAULT_MAX_NEW_TOKENS);

        config.conversational = true;
        assert_eq!(
            config.effective_max_new_tokens(),
            DEFAULT_MAX_CONVERSATIONAL_NEW_TOKENS
        );
    }
}
