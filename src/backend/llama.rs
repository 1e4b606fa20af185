//! llama.cpp local backend
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`)
//! contain raw pointers that are not `Send`, all model operations run on a
//! dedicated worker thread. Callers communicate via channels; the stop
//! watcher travels into the worker for the duration of one generation call
//! and comes back with its per-sequence records filled in.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::backend::{
    BackendError, CausalBackend, SamplingParams, Seq2SeqBackend, TokenCodec, TokenId,
};
use crate::stop::StopWatcher;

/// GGUF magic bytes (little-endian: "GGUF")
const GGUF_MAGIC: u32 = 0x46554747;

/// Checks the GGUF header before handing the file to llama.cpp, so a
/// truncated download fails with a readable message instead of a native
/// abort. Versions 2 and 3 are accepted.
fn validate_gguf(path: &Path) -> Result<(), BackendError> {
    let mut file = File::open(path)
        .map_err(|e| BackendError::Worker(format!("Failed to open model file: {}", e)))?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file
        .seek(SeekFrom::End(0))
        .map_err(|e| BackendError::Worker(e.to_string()))?;
    if file_size < 24 {
        return Err(BackendError::Worker(
            "File too small to be valid GGUF".to_string(),
        ));
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| BackendError::Worker(e.to_string()))?;

    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(|e| BackendError::Worker(e.to_string()))?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(BackendError::Worker(format!(
            "Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})",
            GGUF_MAGIC, magic
        )));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(BackendError::Worker(format!(
            "Unsupported GGUF version: {}",
            version
        )));
    }
    Ok(())
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Encode {
        text: String,
        response_tx: Sender<Result<Vec<TokenId>, BackendError>>,
    },
    Decode {
        tokens: Vec<TokenId>,
        response_tx: Sender<Result<String, BackendError>>,
    },
    Generate {
        input: Vec<TokenId>,
        batch: usize,
        max_new_tokens: usize,
        params: SamplingParams,
        watcher: StopWatcher,
        response_tx: Sender<(Result<Vec<Vec<TokenId>>, BackendError>, StopWatcher)>,
    },
    Shutdown,
}

/// A GGUF model served from a dedicated worker thread.
///
/// One instance owns one loaded model. Calls are serialized: the model has
/// a single context and generation is batched inside a call, not across
/// calls.
pub struct LlamaLocalBackend {
    command_tx: Mutex<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    max_context_size: u32,
}

impl LlamaLocalBackend {
    /// Loads a GGUF model and spawns its worker thread.
    ///
    /// `gpu_layers` is the number of layers offloaded to the accelerator
    /// (0 = CPU only); `max_context_size` caps the context window below
    /// the model's trained length.
    pub fn load<P: AsRef<Path>>(
        path: P,
        gpu_layers: u32,
        max_context_size: u32,
    ) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        validate_gguf(&path)?;
        tracing::debug!("GGUF validation passed for {:?}", path);

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), BackendError>>();

        let handle = thread::spawn(move || {
            worker_thread_main(path, gpu_layers, max_context_size, ready_tx, command_rx);
        });

        ready_rx
            .recv()
            .map_err(|e| BackendError::Worker(e.to_string()))??;

        tracing::info!("llama.cpp worker thread started");
        Ok(Self {
            command_tx: Mutex::new(command_tx),
            worker_handle: Some(handle),
            max_context_size,
        })
    }

    pub fn max_context_size(&self) -> u32 {
        self.max_context_size
    }

    fn send(&self, command: WorkerCommand) -> Result<(), BackendError> {
        let tx = self
            .command_tx
            .lock()
            .map_err(|e| BackendError::Worker(e.to_string()))?;
        tx.send(command)
            .map_err(|e| BackendError::Worker(e.to_string()))
    }

    fn generate_inner(
        &self,
        input: &[TokenId],
        batch: usize,
        max_new_tokens: usize,
        params: &SamplingParams,
        watcher: &mut StopWatcher,
    ) -> Result<Vec<Vec<TokenId>>, BackendError> {
        let (response_tx, response_rx) = mpsc::channel();

        // The watcher travels to the worker and back so its records
        // survive the call
        let placeholder = StopWatcher::new(0, watcher.markers().clone());
        let moved = std::mem::replace(watcher, placeholder);

        self.send(WorkerCommand::Generate {
            input: input.to_vec(),
            batch,
            max_new_tokens,
            params: params.clone(),
            watcher: moved,
            response_tx,
        })?;

        let (result, returned) = response_rx
            .recv()
            .map_err(|e| BackendError::Worker(e.to_string()))?;
        *watcher = returned;
        result
    }
}

impl Drop for LlamaLocalBackend {
    fn drop(&mut self) {
        if let Ok(tx) = self.command_tx.lock() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl TokenCodec for LlamaLocalBackend {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Encode {
            text: text.to_string(),
            response_tx,
        })?;
        response_rx
            .recv()
            .map_err(|e| BackendError::Worker(e.to_string()))?
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Decode {
            tokens: tokens.to_vec(),
            response_tx,
        })?;
        response_rx
            .recv()
            .map_err(|e| BackendError::Worker(e.to_string()))?
    }
}

impl CausalBackend for LlamaLocalBackend {
    fn generate(
        &self,
        input: &[TokenId],
        batch: usize,
        max_new_tokens: usize,
        params: &SamplingParams,
        watcher: &mut StopWatcher,
    ) -> Result<Vec<Vec<TokenId>>, BackendError> {
        self.generate_inner(input, batch, max_new_tokens, params, watcher)
    }
}

// llama.cpp serves encoder-decoder GGUF checkpoints through the same
// decode loop, so the retryable contract is the same call
impl Seq2SeqBackend for LlamaLocalBackend {
    fn generate(
        &self,
        input: &[TokenId],
        batch: usize,
        max_new_tokens: usize,
        params: &SamplingParams,
        watcher: &mut StopWatcher,
    ) -> Result<Vec<Vec<TokenId>>, BackendError> {
        self.generate_inner(input, batch, max_new_tokens, params, watcher)
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands from the
/// calling thread.
fn worker_thread_main(
    path: PathBuf,
    gpu_layers: u32,
    max_context_size: u32,
    ready_tx: Sender<Result<(), BackendError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let (backend, model) = match load_model(&path, gpu_layers) {
        Ok(loaded) => {
            let _ = ready_tx.send(Ok(()));
            loaded
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Encode { text, response_tx }) => {
                let _ = response_tx.send(encode_text(&model, &text));
            }
            Ok(WorkerCommand::Decode {
                tokens,
                response_tx,
            }) => {
                let _ = response_tx.send(decode_tokens(&model, &tokens));
            }
            Ok(WorkerCommand::Generate {
                input,
                batch,
                max_new_tokens,
                params,
                mut watcher,
                response_tx,
            }) => {
                let result = run_generation(
                    &backend,
                    &model,
                    &input,
                    batch,
                    max_new_tokens,
                    &params,
                    &mut watcher,
                    max_context_size,
                );
                let _ = response_tx.send((result, watcher));
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn load_model(path: &Path, gpu_layers: u32) -> Result<(LlamaBackend, LlamaModel), BackendError> {
    let backend =
        LlamaBackend::init().map_err(|e| BackendError::Worker(e.to_string()))?;

    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = LlamaModel::load_from_file(&backend, path, &model_params)
        .map_err(|e| BackendError::Inference(e.to_string()))?;

    tracing::info!(
        "Model loaded: {:?} ({} params, {} vocab, {} ctx)",
        path,
        model.n_params(),
        model.n_vocab(),
        model.n_ctx_train()
    );
    Ok((backend, model))
}

fn encode_text(model: &LlamaModel, text: &str) -> Result<Vec<TokenId>, BackendError> {
    // Never add BOS: marker re-encoding must see the marker alone
    let tokens = model
        .str_to_token(text, AddBos::Never)
        .map_err(|e| BackendError::Tokenization(e.to_string()))?;
    Ok(tokens.into_iter().map(|t| t.0).collect())
}

fn decode_tokens(model: &LlamaModel, tokens: &[TokenId]) -> Result<String, BackendError> {
    let mut bytes = Vec::new();
    for &token in tokens {
        let piece = model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        bytes.extend_from_slice(&piece);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Model-borrowing codec handed to the stop watcher inside the worker
struct ModelCodec<'a> {
    model: &'a LlamaModel,
}

impl TokenCodec for ModelCodec<'_> {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        encode_text(self.model, text)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError> {
        decode_tokens(self.model, tokens)
    }
}

/// Classifies llama.cpp failures so allocation pressure is retryable
fn decode_error(message: String) -> BackendError {
    let lower = message.to_lowercase();
    if lower.contains("out of memory") || lower.contains("failed to allocate") {
        BackendError::OutOfMemory(message)
    } else {
        BackendError::Inference(message)
    }
}

/// Runs batched generation (called from worker thread).
///
/// The prompt is processed once with its KV entries shared across all
/// sequences; afterwards every sequence advances one token per step until
/// the watcher reports the whole batch done or the budget is exhausted.
#[allow(clippy::too_many_arguments)]
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    input: &[TokenId],
    batch: usize,
    max_new_tokens: usize,
    params: &SamplingParams,
    watcher: &mut StopWatcher,
    max_context_size: u32,
) -> Result<Vec<Vec<TokenId>>, BackendError> {
    if input.is_empty() {
        return Err(BackendError::Tokenization(
            "Prompt tokenized to nothing".to_string(),
        ));
    }

    let n_ctx = std::cmp::min(max_context_size, model.n_ctx_train());
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch((input.len() + batch) as u32);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| decode_error(e.to_string()))?;

    let mut llama_batch = LlamaBatch::new(input.len() + batch, batch as i32);

    // Prompt phase: one pass, KV shared by every sequence
    let all_seqs: Vec<i32> = (0..batch as i32).collect();
    for (i, &token) in input.iter().enumerate() {
        let is_last = i == input.len() - 1;
        llama_batch
            .add(LlamaToken(token), i as i32, &all_seqs, is_last)
            .map_err(|e| BackendError::Inference(e.to_string()))?;
    }
    ctx.decode(&mut llama_batch)
        .map_err(|e| decode_error(e.to_string()))?;

    let mut samplers = build_samplers(batch, params);
    let mut sequences: Vec<Vec<TokenId>> = vec![Vec::new(); batch];
    let mut byte_buffers: Vec<Vec<u8>> = vec![Vec::new(); batch];
    let mut n_past = input.len() as i32;
    let codec = ModelCodec { model };

    for step in 0..max_new_tokens {
        // The prompt pass leaves a single shared logit row; afterwards
        // each sequence has its own row at its slot index
        let mut step_tokens = Vec::with_capacity(batch);
        for (slot, sampler) in samplers.iter_mut().enumerate() {
            let index = if step == 0 {
                llama_batch.n_tokens() - 1
            } else {
                slot as i32
            };
            let token = sampler.sample(&ctx, index);
            sampler.accept(token);
            step_tokens.push(token);
        }

        for (slot, &token) in step_tokens.iter().enumerate() {
            sequences[slot].push(token.0);
            if let Ok(piece) = model.token_to_bytes(token, Special::Tokenize) {
                byte_buffers[slot].extend_from_slice(&piece);
            }
        }

        let decodes: Vec<String> = byte_buffers
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect();
        if watcher.step(&decodes, step + 1, &codec) {
            tracing::debug!("All {} sequences hit a stop marker", batch);
            break;
        }

        llama_batch.clear();
        for (slot, &token) in step_tokens.iter().enumerate() {
            llama_batch
                .add(token, n_past, &[slot as i32], true)
                .map_err(|e| BackendError::Inference(e.to_string()))?;
        }
        ctx.decode(&mut llama_batch)
            .map_err(|e| decode_error(e.to_string()))?;
        n_past += 1;
    }

    Ok(sequences)
}

/// One sampler per sequence so sampled batches diverge
fn build_samplers(batch: usize, params: &SamplingParams) -> Vec<LlamaSampler> {
    let base_seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    (0..batch)
        .map(|slot| {
            if params.do_sample {
                LlamaSampler::chain_simple([
                    LlamaSampler::top_p(params.top_p, 1),
                    LlamaSampler::temp(params.temperature),
                    LlamaSampler::dist(base_seed.wrapping_add(slot as u32)),
                ])
            } else {
                LlamaSampler::greedy()
            }
        })
        .collect()
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_gguf_header(version: u32) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".gguf")
            .tempfile()
            .unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&1u64.to_le_bytes()).unwrap();
        file.write_all(&1u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_validate_gguf_accepts_v3_header() {
        let file = write_gguf_header(3);
        assert!(validate_gguf(file.path()).is_ok());
    }

    #[test]
    fn test_validate_gguf_rejects_bad_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 24]).unwrap();
        file.flush().unwrap();
        let err = validate_gguf(file.path()).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_validate_gguf_rejects_unsupported_version() {
        let file = write_gguf_header(7);
        let err = validate_gguf(file.path()).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_validate_gguf_rejects_truncated_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        file.flush().unwrap();
        assert!(validate_gguf(file.path()).is_err());
    }

    #[test]
    fn test_oom_classification() {
        assert!(decode_error("CUDA out of memory".to_string()).is_out_of_memory());
        assert!(decode_error("ggml: failed to allocate buffer".to_string()).is_out_of_memory());
        assert!(!decode_error("invalid token".to_string()).is_out_of_memory());
    }

    #[test]
    fn test_samplers_one_per_slot() {
        let samplers = build_samplers(4, &SamplingParams::nucleus(0.8));
        assert_eq!(samplers.len(), 4);

        let samplers = build_samplers(1, &SamplingParams::greedy());
        assert_eq!(samplers.len(), 1);
    }
}
