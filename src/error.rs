//! Crate-wide error taxonomy.
//!
//! Kinds, not classes: every failure site maps to one variant here, and the
//! worker boundary translates internal failures into these before they reach
//! callers. Tool execution errors never appear here — the pipeline reifies
//! them as tool-role messages and keeps going.

use thiserror::Error;

pub use crate::acquire::AcquireError;
pub use crate::gguf::GgufError;

/// HTTP statuses worth retrying against a remote backend.
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum Error {
    /// Input predicate failed. Rejected synchronously, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Remote backend HTTP failure. Retryable iff the status says so.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Native load failure, or the file is missing/empty.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Negative return from the native tokenizer after retry.
    #[error("tokenization failed: {0}")]
    Tokenization(String),

    /// Context allocation failure.
    #[error("context creation failed: {0}")]
    ContextCreate(String),

    /// Decode or sampler failure, with a stage hint.
    #[error("inference failed during {stage}: {message}")]
    Inference {
        stage: &'static str,
        message: String,
    },

    #[error("lora load failed: {0}")]
    LoraLoad(String),

    #[error("lora apply failed: {0}")]
    LoraApply(String),

    /// The request carried image attachments; the native core has no image
    /// intake path.
    #[error("image attachments are not supported: {0}")]
    VisionUnsupported(String),

    /// The worker thread is gone (channel closed before a terminal event).
    #[error("inference worker unavailable: {0}")]
    WorkerClosed(String),

    #[error(transparent)]
    Gguf(#[from] GgufError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Retry policy: only transient remote-API statuses are retryable.
    /// Everything native is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { status, .. } => RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            let err = Error::Api {
                status,
                message: "upstream".into(),
            };
            assert!(err.is_retryable(), "status {status} should retry");
        }
    }

    #[test]
    fn test_non_retryable() {
        let err = Error::Api {
            status: 401,
            message: "unauthorized".into(),
        };
        assert!(!err.is_retryable());
        assert!(!Error::Validation("empty model".into()).is_retryable());
        assert!(!Error::ModelLoad("missing".into()).is_retryable());
    }
}
