//! Error types for the RAG pipeline.
//!
//! Every component gets its own `thiserror` enum so callers can match on the
//! failure kind they care about (the query pipeline only downgrades
//! [`GenerationError`], the readiness gate only swallows transient ones).
//! [`RagError`] is the top-level type returned by the pipeline entry points.

use std::path::PathBuf;

/// Top-level error for ingestion, startup and query handling.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("generation backend error: {0}")]
    Generation(#[from] GenerationError),

    #[error("collection '{name}' missing after {attempts} attempts")]
    IndexMissing { name: String, attempts: u32 },

    #[error("no documents to ingest under {}", path.display())]
    EmptyInput { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("could not determine the platform config directory")]
    NoConfigDir,

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Failures reported by a [`VectorStore`](crate::vector_store::VectorStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot reach vector store at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("collection '{name}' does not exist")]
    CollectionNotFound { name: String },

    #[error(
        "invalid collection name '{name}': use letters, digits and underscores, \
         starting with a letter or underscore"
    )]
    InvalidName { name: String },

    #[error("collection '{name}' is not loaded")]
    NotLoaded { name: String },

    #[error("collection '{name}' has no built index")]
    NotBuilt { name: String },

    #[error("vector store rejected the request: {message}")]
    Backend { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

/// Failures from the embedding capability.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("failed to load embedding model '{model}': {message}")]
    ModelLoad { model: String, message: String },

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("embedding has zero norm and cannot be normalized")]
    ZeroVector,

    #[error("embedding task was cancelled: {0}")]
    Join(String),
}

impl From<candle_core::Error> for EmbedError {
    fn from(err: candle_core::Error) -> Self {
        EmbedError::Inference(err.to_string())
    }
}

/// A failed call to the text-generation backend.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: f64 },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

impl GenerationError {
    /// Whether the failure is an expected, transient backend condition
    /// (unreachable, slow, or non-success) as opposed to a protocol error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Status { .. }
                | GenerationError::Timeout { .. }
                | GenerationError::Connection { .. }
        )
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}
