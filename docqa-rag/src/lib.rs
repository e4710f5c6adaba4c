//! # docqa-rag
//!
//! Retrieval-augmented question answering over a local document collection.
//!
//! ## Overview
//!
//! Documents are normalized to plain text, split into overlapping chunks,
//! embedded in memory-bounded batches and stored in a vector index. A
//! question is embedded, the nearest chunks are retrieved (and optionally
//! reranked), and the best of them are assembled into an answer, which an
//! [`AnswerGenerator`] may rewrite.
//!
//! - [`Chunker`] - [`FixedSizeChunker`] and [`RecursiveChunker`]
//! - [`Embedder`] - lazy-loading, batching front end over an [`EmbeddingModel`]
//! - [`VectorIndex`] - [`LocalVectorIndex`], in memory or persisted as a JSON snapshot
//! - [`Reranker`] - [`NoOpReranker`] and [`EmbeddingReranker`]
//! - [`RagPipeline`] - ingest and query orchestration for one configuration
//! - [`RagService`] - process-wide container the transport layer talks to
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docqa_rag::{RagService, ServiceSettings};
//!
//! let service = RagService::from_settings(&ServiceSettings::from_env()?)?;
//! service.initialize().await?;
//! service.ingest_document(Path::new("uploads/handbook.md")).await?;
//! let result = service.query("When does enrollment close?", None).await?;
//! println!("{} ({} sources)", result.answer, result.num_results);
//! ```
//!
//! ## Features
//!
//! - `openai` - OpenAI-compatible embedding model and answer generator
//! - `full` - everything above

pub mod chunking;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod hashing;
pub mod index;
pub mod local_index;
pub mod normalize;
#[cfg(feature = "openai")]
pub mod openai;
pub mod pipeline;
pub mod pool;
pub mod prompt;
pub mod reranker;
pub mod service;

pub use chunking::{Chunker, FixedSizeChunker, RecursiveChunker, chunker_for};
pub use config::{
    ChunkingStrategy, EmbeddingConfig, IndexConfig, RemoteModelSettings, RetrievalConfig,
    RetrievalConfigBuilder, RetrievalConfigUpdate, ServiceSettings,
};
pub use document::{
    Chunk, CollectionStats, DocumentInfo, DocumentList, HealthStatus, IndexEntry,
    NO_RELEVANT_INFORMATION, QueryResult, RawSearchResults, SearchResult,
};
pub use embedding::{Embedder, EmbeddingModel, EncodeOptions, ModelLoader};
pub use error::{RagError, Result};
pub use generation::AnswerGenerator;
pub use hashing::{HashingEmbeddingModel, HashingModelLoader};
pub use index::{DistanceMetric, MetadataFilter, VectorIndex};
pub use local_index::LocalVectorIndex;
pub use normalize::{DocumentNormalizer, TextNormalizer};
#[cfg(feature = "openai")]
pub use openai::{OpenAiEmbeddingLoader, OpenAiEmbeddingModel, OpenAiGenerator};
pub use pipeline::{RagPipeline, RagPipelineBuilder};
pub use pool::WorkerPool;
pub use prompt::{DEFAULT_SYSTEM_PROMPT, PromptStore};
pub use reranker::{EmbeddingReranker, NoOpReranker, Reranker};
pub use service::{DefaultPipelineFactory, PipelineFactory, RagService, RagServiceBuilder};
