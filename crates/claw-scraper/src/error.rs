//! Error types for the scraper service.

use thiserror::Error;

/// Errors that can occur while scraping, syncing or persisting metrics.
#[derive(Debug, Error)]
pub enum ScraperError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote end answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// A cluster could not be queried.
    #[error("cluster {cluster}: {reason}")]
    Cluster {
        /// Cluster name.
        cluster: String,
        /// What went wrong.
        reason: String,
    },

    /// Writing to the time-series sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// The pool directory could not be read or updated.
    #[error("pool directory error: {0}")]
    PoolDirectory(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric decoding or reconciliation error.
    #[error("inference metrics error: {0}")]
    Inference(#[from] claw_inference::InferenceError),
}

/// Result type for scraper operations.
pub type Result<T> = std::result::Result<T, ScraperError>;
