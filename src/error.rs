//! Error taxonomy for the RAG pipeline.
//!
//! Every stage returns `Result<T, RagError>`; errors are never used for
//! control flow. Degraded-but-successful outcomes (stale source fallback,
//! zero candidates, expansion parse trouble) are carried as warning fields
//! on stage outcome structs instead.
//!
//! | Kind | HTTP mapping | Recovery |
//! |------|--------------|----------|
//! | `NotFound` | 404 | caller supplies a valid id |
//! | `PreconditionFailed` | 409 | run the missing upstream stage |
//! | `StaleSource` | never surfaced directly | consolidator downgrades to stored content |
//! | `Transient` | 503 | bounded retries inside the failing call, then surface |
//! | `Permanent` | 502 | propagate; partial state marked `_err` where applicable |
//! | `Cancelled` | — | request dropped; nothing persisted |

use thiserror::Error;

/// Result alias used by all pipeline stages.
pub type RagResult<T> = std::result::Result<T, RagError>;

/// Error kinds produced by the RAG core.
#[derive(Error, Debug)]
pub enum RagError {
    /// A referenced entity (work, chunk, query, result) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine guard rejected the stage; `predicate` names the
    /// unmet condition (e.g. `vector_status = vec`).
    #[error("precondition failed: {predicate}")]
    PreconditionFailed { predicate: String },

    /// The sanitized file is missing or its content hash no longer matches
    /// the stored hash.
    #[error("stale source for work {work_id}: {reason}")]
    StaleSource { work_id: String, reason: String },

    /// Retryable external-call failure (network, 5xx, rate limit) that
    /// survived the bounded retry loop.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Deterministic external error (auth, non-429 4xx, dimension
    /// mismatch, invalid template). Retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The request was cancelled; the affected stage persisted nothing.
    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Shorthand for a [`RagError::PreconditionFailed`] with the given predicate.
    pub fn precondition(predicate: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            predicate: predicate.into(),
        }
    }

    /// True if the error came from a retryable external condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
