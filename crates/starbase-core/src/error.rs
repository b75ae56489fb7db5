//! Crate-wide error taxonomy
//!
//! One variant per failure kind; the HTTP surface maps these to status
//! codes in a single place.

/// Starbase error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed caller input (maps to 400)
    #[error("Invalid input: {0}")]
    InputInvalid(String),
    /// Entity does not exist (maps to 404)
    #[error("Not found: {0}")]
    NotFound(String),
    /// Operation conflicts with in-flight state, e.g. sync already running (maps to 409)
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Retryable upstream failure (429/5xx/transport); the retry loop
    /// swallows these up to the configured bound
    #[error("Transient remote error: {0}")]
    RemoteTransient(String),
    /// Permanent upstream failure (auth, 4xx)
    #[error("Remote error ({status}): {message}")]
    RemoteFatal { status: u16, message: String },
    /// Embedding service down; callers degrade, never fail
    #[error("Embedder unavailable: {0}")]
    EmbedderUnavailable(String),
    /// Database error
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),
    /// Vector index error
    #[error("Vector index error: {0}")]
    VectorIndex(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Caller cancelled the operation
    #[error("Cancelled")]
    Cancelled,
    /// Invariant violation, a bug
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the remote side may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteTransient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON encoding: {}", e))
    }
}
