//! Error taxonomy for the ingestion and conversation pipelines.
//!
//! Collaborator traits return `anyhow::Result`; component contracts map
//! those failures into a [`RagError`] variant that tells the caller how the
//! failure propagates (document failed, degraded retrieval, turn aborted).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// The document's format has no extractor.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Text could not be extracted (corrupt file, empty content, too large).
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Embedding retries were exhausted or the vector store rejected a write.
    #[error("indexing failed: {0}")]
    Index(String),

    /// The vector store or query embedding was unavailable. Non-fatal to a turn.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The model provider failed mid-turn. Fatal to the turn only.
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("turn cancelled")]
    Cancelled,

    #[error("thread {0} already has a turn in flight")]
    TurnInProgress(String),

    #[error("document {0} is already being ingested")]
    IngestInProgress(String),

    #[error("thread {thread_id} already has {limit} attached documents")]
    AttachLimit { thread_id: String, limit: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RagError {
    /// Machine-readable code used by the HTTP layer and stream events.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::Extraction(_) => "extraction_error",
            RagError::Index(_) => "index_error",
            RagError::Retrieval(_) => "retrieval_error",
            RagError::Generation(_) => "generation_error",
            RagError::Cancelled => "cancelled",
            RagError::TurnInProgress(_) => "turn_in_progress",
            RagError::IngestInProgress(_) => "ingest_in_progress",
            RagError::AttachLimit { .. } => "attach_limit",
            RagError::NotFound(_) => "not_found",
            RagError::Store(_) => "internal",
        }
    }
}

pub type RagResult<T> = Result<T, RagError>;
