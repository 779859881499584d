//! Error types for the claw-inference crate.

use thiserror::Error;

/// Errors that can occur while decoding or reconciling inference metrics.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// A counter key component is empty or contains the key separator.
    #[error("invalid counter key: {reason}")]
    InvalidCounterKey {
        /// The reason the key is invalid.
        reason: String,
    },

    /// The staleness window is unusable (zero or too large to represent).
    #[error("invalid staleness window: {reason}")]
    InvalidWindow {
        /// The reason the window is invalid.
        reason: String,
    },
}

/// Result type for inference metric operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
