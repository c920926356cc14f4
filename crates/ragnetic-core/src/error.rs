//! Error kinds raised at the stage boundaries of ingestion and retrieval.
//!
//! Collaborators (vector index, embedding provider, storage, parser) report
//! failures as opaque `anyhow` errors; the pipeline classifies each failure
//! into one of these variants depending on which stage produced it.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RagError {
    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("retrieval backend unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("invalid chunk parameters: {0}")]
    InvalidChunkParameters(String),

    #[error("document {0} not found")]
    DocumentNotFound(i64),
}

impl RagError {
    /// Failures that end an ingestion job without being worth a retry:
    /// the same bytes will fail to load or parse the same way again.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            RagError::ParseFailure(_)
                | RagError::StorageUnavailable(_)
                | RagError::DocumentNotFound(_)
        )
    }

    /// Transient backend failures the job runner may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingFailure(_)
                | RagError::IndexUnavailable(_)
                | RagError::RetrievalUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
