//! genbench decoding core
//!
//! A unified decoding layer for code-generation benchmarking: one
//! `Decoder` trait served by three algorithms (batched-local,
//! remote-per-call, OOM-retrying seq2seq), a data-driven prompt template
//! catalog, per-sequence stop-marker tracking, and a registry resolving
//! model names to fully configured sessions.

pub mod backend;
pub mod config;
pub mod decoder;
pub mod error;
pub mod registry;
pub mod stop;
pub mod template;

pub use config::{ModelConfig, Precision, RuntimeConfig};
pub use decoder::{Decoder, LocalDecoder, RemoteDecoder, RemoteStyle, RetryDecoder};
pub use error::{DecodeError, Result};
pub use registry::{resolve, BackendKind, ModelSpec};
pub use stop::{StopMarkerSet, StopWatcher, BASE_EOS};
pub use template::{ChatMessage, TemplateFamily, TemplateMode};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the tracing subscriber for binaries embedding this crate.
///
/// Defaults to `genbench=info`, overridable through `RUST_LOG`. Calling
/// it twice is an error from the subscriber, so it is left to the
/// outermost binary.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("genbench=info".parse().expect("static directive")))
        .init();
}
