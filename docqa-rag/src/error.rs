//! Error types for the `docqa-rag` crate.

use thiserror::Error;

/// Errors that can occur in retrieval pipeline operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// A configuration validation error. Raised before any work starts.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An operation reached a component that has not been set up yet.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// A source document could not be converted into plain text.
    #[error("Conversion error ({path}): {message}")]
    ConversionError {
        /// The path of the document that failed to convert.
        path: String,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred during embedding generation.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingError {
        /// The embedding model that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred in the vector index.
    #[error("Index error ({backend}): {message}")]
    IndexError {
        /// The index backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred during result reranking.
    #[error("Reranker error ({reranker}): {message}")]
    RerankerError {
        /// The reranker that produced the error.
        reranker: String,
        /// A description of the failure.
        message: String,
    },

    /// The answer generator failed or timed out.
    #[error("Generation error ({provider}): {message}")]
    GenerationError {
        /// The generator that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// No indexed chunks reference the requested document.
    #[error("Document not found: {document_id}")]
    NotFound {
        /// The document identifier that matched nothing.
        document_id: String,
    },

    /// An error in the pipeline orchestration.
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Filesystem failure outside of a more specific context.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Snapshot or payload (de)serialization failure.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    /// Shorthand for an [`RagError::IndexError`].
    pub(crate) fn index(backend: &str, message: impl Into<String>) -> Self {
        Self::IndexError { backend: backend.to_string(), message: message.into() }
    }

    /// Shorthand for an [`RagError::EmbeddingError`].
    pub(crate) fn embedding(provider: &str, message: impl Into<String>) -> Self {
        Self::EmbeddingError { provider: provider.to_string(), message: message.into() }
    }
}

/// A convenience result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;
