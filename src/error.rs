//! Error types for the megakit library.

use thiserror::Error;

/// Main error type for megakit operations.
#[derive(Error, Debug)]
pub enum MegaError {
    /// Invalid credentials, expired session, or blocked account.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Temporary failure that outlived the retry budget.
    #[error("temporary failure: {0}")]
    Transient(String),

    /// Remote node, local file, or path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Server refused access to the resource.
    #[error("access denied: {0}")]
    Permission(String),

    /// Storage quota exceeded.
    #[error("over quota: {0}")]
    Quota(String),

    /// Malformed response, unexpected shape, or framing violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Integrity check failed (meta-MAC mismatch, bad attribute blob).
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Key material could not be decrypted or authenticated.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid configuration or caller input.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Transfer aborted through a cancellation token or callback.
    #[error("operation cancelled")]
    Cancelled,

    /// Network request error.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Base64 decoding error.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl MegaError {
    /// Whether retrying the operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MegaError::Transient(_) | MegaError::Request(_))
    }
}

/// Result type alias for megakit operations.
pub type Result<T> = std::result::Result<T, MegaError>;
