//! Crate-wide error types
//!
//! Three failure classes cross the decoder boundary: caller mistakes
//! (`InvalidArgument`), accelerator memory exhaustion after all retries
//! (`ResourceExhausted`), and everything the underlying backend reports
//! (`Backend`), which is passed through without interpretation.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by a `Decoder::generate` call
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A precondition was violated or a model identifier is unknown.
    /// Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Accelerator memory was exhausted and the output budget shrank to
    /// zero without a successful generation.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other runtime failure from the model or remote call, propagated
    /// unchanged. Transient-vs-permanent interpretation belongs to the
    /// backend, not this crate.
    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),
}

/// Shorthand used throughout the crate
pub type Result<T> = std::result::Result<T, DecodeError>;

impl DecodeError {
    /// Builds an `InvalidArgument` from anything displayable
    pub fn invalid(msg: impl Into<String>) -> Self {
        DecodeError::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_helper() {
        let err = DecodeError::invalid("temperature must be positive");
        assert!(matches!(err, DecodeError::InvalidArgument(_)));
        assert_eq!(
            err.to_string(),
            "Invalid argument: temperature must be positive"
        );
    }

    #[test]
    fn test_backend_error_wraps() {
        let err: DecodeError = BackendError::Inference("decode failed".to_string()).into();
        assert!(matches!(err, DecodeError::Backend(_)));
    }
}
