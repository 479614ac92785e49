use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write failure in an input or sidecar table.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The embeddings sidecar could not be encoded or decoded.
    #[error("embedding store error: {0}")]
    EmbeddingStore(#[from] bincode::Error),

    /// File read/write error. Fatal for the running stage.
    #[error("storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    /// Invalid configuration detected at launch. The job never starts.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Bad or absent API key. Fatal, never retried.
    #[error("{provider} authentication failed: {message}")]
    Auth {
        provider: &'static str,
        message: String,
    },

    /// Provider signalled a rate limit. Retried with backoff, then fatal.
    ///
    /// `retry_after` carries the provider's own delay hint when present
    /// (`Retry-After` header, or Gemini's `retry_delay` detail) and acts as a
    /// hard lower bound on the next wait.
    #[error("{provider} rate limit: {message}")]
    RateLimited {
        provider: &'static str,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Malformed prompt or schema rejection. Fatal, never retried.
    #[error("{provider} rejected the request: {message}")]
    BadRequest {
        provider: &'static str,
        message: String,
    },

    /// The LLM returned output that does not conform to the expected schema.
    /// Item-level: callers downgrade the affected item and continue.
    #[error("response did not match the expected shape: {0}")]
    Parse(String),

    /// Not enough data to proceed (empty argument table, too few samples for
    /// the projection, etc.). Fatal with a human-readable reason.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Provider returned a non-success status outside the mapped taxonomy.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A pipeline stage failed with a descriptive message.
    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// A status registry mutation violated the monotonic state machine.
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    /// The job or payload was cancelled via the cancellation flag.
    #[error("pipeline was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

impl PipelineError {
    /// Whether the gateway retry loop may try again after this error.
    /// Only rate-limit signals are retryable; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::RateLimited { .. })
    }

    /// The provider's delay hint, when one was attached to the error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
