//! Configuration for the retrieval pipeline and the service around it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::index::DistanceMetric;

/// Retrieval parameters shared by every component of one pipeline instance.
///
/// The value is immutable once a pipeline is built from it. Changing the
/// configuration means building a new pipeline (see
/// [`RagService::set_config`](crate::service::RagService::set_config)).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of characters shared by consecutive chunks.
    pub chunk_overlap: usize,
    /// Default number of results to retrieve per query.
    pub n_results: usize,
    /// Whether candidates go through the reranker before answer assembly.
    pub use_reranking: bool,
    /// Similarity threshold exposed to callers.
    ///
    /// Advisory only: the pipeline reports it but never drops results
    /// below it, so `num_results` and `avg_similarity` always describe the
    /// full candidate set.
    pub min_similarity_threshold: f32,
    /// How chunk boundaries are chosen.
    #[serde(default)]
    pub chunking_strategy: ChunkingStrategy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            n_results: 3,
            use_reranking: false,
            min_similarity_threshold: 0.3,
            chunking_strategy: ChunkingStrategy::default(),
        }
    }
}

impl RetrievalConfig {
    /// Create a new builder for constructing a [`RetrievalConfig`].
    pub fn builder() -> RetrievalConfigBuilder {
        RetrievalConfigBuilder::default()
    }

    /// Check that the parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0`
    /// - `chunk_overlap >= chunk_size`
    /// - `n_results == 0`
    /// - `min_similarity_threshold` is outside `[0, 1]`
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.n_results == 0 {
            return Err(RagError::ConfigError("n_results must be greater than zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_similarity_threshold) {
            return Err(RagError::ConfigError(format!(
                "min_similarity_threshold ({}) must be within [0, 1]",
                self.min_similarity_threshold
            )));
        }
        Ok(())
    }

    /// Merge a partial update onto this configuration and validate the result.
    ///
    /// `self` is left untouched; the merged value is returned.
    pub fn merged(&self, update: &RetrievalConfigUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(size) = update.chunk_size {
            next.chunk_size = size;
        }
        if let Some(overlap) = update.chunk_overlap {
            next.chunk_overlap = overlap;
        }
        if let Some(n) = update.n_results {
            next.n_results = n;
        }
        if let Some(rerank) = update.use_reranking {
            next.use_reranking = rerank;
        }
        if let Some(threshold) = update.min_similarity_threshold {
            next.min_similarity_threshold = threshold;
        }
        if let Some(strategy) = update.chunking_strategy {
            next.chunking_strategy = strategy;
        }
        next.validate()?;
        Ok(next)
    }
}

/// A partial configuration change, as submitted by a settings screen.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_overlap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_reranking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking_strategy: Option<ChunkingStrategy>,
}

/// How a document is cut into chunks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Plain sliding window over characters.
    #[default]
    Fixed,
    /// Sliding window whose end snaps back to paragraph, sentence or word boundaries.
    Recursive,
}

/// Builder for constructing a validated [`RetrievalConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetrievalConfigBuilder {
    config: RetrievalConfig,
}

impl RetrievalConfigBuilder {
    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the default number of results per query.
    pub fn n_results(mut self, n: usize) -> Self {
        self.config.n_results = n;
        self
    }

    /// Enable or disable the reranking pass.
    pub fn use_reranking(mut self, enabled: bool) -> Self {
        self.config.use_reranking = enabled;
        self
    }

    /// Set the advisory similarity threshold.
    pub fn min_similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.min_similarity_threshold = threshold;
        self
    }

    /// Set the chunking strategy.
    pub fn chunking_strategy(mut self, strategy: ChunkingStrategy) -> Self {
        self.config.chunking_strategy = strategy;
        self
    }

    /// Build the [`RetrievalConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// See [`RetrievalConfig::validate`].
    pub fn build(self) -> Result<RetrievalConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Embedding model and batching parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Output dimensionality of the local hashing model.
    pub dimensions: usize,
    /// Texts per sub-batch when encoding a corpus.
    pub batch_size: usize,
    /// Whether vectors are L2-normalized after encoding.
    pub normalize: bool,
    /// Average text length (characters) above which the sub-batch size is halved.
    pub long_text_threshold: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dimensions: 384, batch_size: 32, normalize: true, long_text_threshold: 1000 }
    }
}

/// Where and how the vector index stores its collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexConfig {
    /// Directory holding the collection snapshot. `None` keeps everything in memory.
    pub persist_dir: Option<PathBuf>,
    /// Name of the single collection the pipeline reads and writes.
    pub collection_name: String,
    /// Entries written per insertion batch.
    pub insert_batch_size: usize,
    /// Distance metric used by search.
    pub metric: DistanceMetric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            collection_name: "knowledge_base".to_string(),
            insert_batch_size: 100,
            metric: DistanceMetric::default(),
        }
    }
}

/// Connection settings for an OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteModelSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

/// Process-level settings for [`RagService`](crate::service::RagService).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    /// File holding the system prompt for answer generation.
    pub prompt_file: PathBuf,
    /// Number of concurrent worker tasks for model and index work.
    pub worker_threads: usize,
    /// Upper bound on a single answer-generation call.
    pub generation_timeout: Duration,
    /// Chat-completion endpoint for answer generation, if any.
    pub llm: Option<RemoteModelSettings>,
    /// Embedding endpoint replacing the local hashing model, if any.
    pub remote_embedding: Option<RemoteModelSettings>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            index: IndexConfig {
                persist_dir: Some(PathBuf::from("index_db")),
                ..Default::default()
            },
            embedding: EmbeddingConfig::default(),
            prompt_file: PathBuf::from(".prompt.txt"),
            worker_threads: 2,
            generation_timeout: Duration::from_secs(30),
            llm: None,
            remote_embedding: None,
        }
    }
}

impl ServiceSettings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] when a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let lookup =
            |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let persist_dir =
            lookup("RAG_INDEX_PATH").map(PathBuf::from).or(defaults.index.persist_dir);
        let collection_name =
            lookup("RAG_COLLECTION").unwrap_or_else(|| defaults.index.collection_name.clone());
        let prompt_file =
            lookup("RAG_PROMPT_FILE").map(PathBuf::from).unwrap_or(defaults.prompt_file);

        let dimensions =
            parse_var(&lookup, "RAG_EMBEDDING_DIMENSIONS", defaults.embedding.dimensions)?;
        let batch_size =
            parse_var(&lookup, "RAG_EMBEDDING_BATCH_SIZE", defaults.embedding.batch_size)?;
        let worker_threads =
            parse_var(&lookup, "RAG_WORKER_THREADS", defaults.worker_threads)?;
        let timeout_secs = parse_var(
            &lookup,
            "RAG_GENERATION_TIMEOUT_SECS",
            defaults.generation_timeout.as_secs(),
        )?;

        if dimensions == 0 || batch_size == 0 || worker_threads == 0 {
            return Err(RagError::ConfigError(
                "embedding dimensions, batch size and worker threads must be greater than zero"
                    .to_string(),
            ));
        }

        let llm = lookup("LLM_API_KEY").map(|api_key| RemoteModelSettings {
            api_key,
            base_url: lookup("LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: lookup("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        });
        let remote_embedding = lookup("EMBEDDING_BASE_URL").map(|base_url| RemoteModelSettings {
            api_key: lookup("EMBEDDING_API_KEY").unwrap_or_default(),
            base_url,
            model: lookup("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
        });

        Ok(Self {
            index: IndexConfig { persist_dir, collection_name, ..defaults.index },
            embedding: EmbeddingConfig { dimensions, batch_size, ..defaults.embedding },
            prompt_file,
            worker_threads,
            generation_timeout: Duration::from_secs(timeout_secs),
            llm,
            remote_embedding,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| RagError::ConfigError(format!("{key} has an invalid value: '{value}'"))),
    }
}
