//! Retrieval pipeline orchestrator.
//!
//! The [`RagPipeline`] coordinates the ingest and query workflows by
//! composing a [`DocumentNormalizer`], a [`Chunker`], an [`Embedder`], a
//! [`VectorIndex`] and an optional [`Reranker`].
//!
//! # Example
//!
//! ```rust,ignore
//! use docqa_rag::{RagPipeline, RetrievalConfig, LocalVectorIndex};
//!
//! let pipeline = RagPipeline::builder()
//!     .config(RetrievalConfig::default())
//!     .embedder(Arc::new(embedder))
//!     .index(Arc::new(LocalVectorIndex::in_memory("knowledge_base")))
//!     .build()?;
//!
//! pipeline.ingest_document(Path::new("docs/handbook.md")).await?;
//! let result = pipeline.query("When do classes start?", None, true).await?;
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span};

use crate::chunking::{Chunker, chunker_for};
use crate::config::RetrievalConfig;
use crate::document::{
    CollectionStats, DOCUMENT_KEY, DocumentInfo, DocumentList, QueryResult, RawSearchResults,
    SearchResult, distance_to_similarity, mean_similarity,
};
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::{MetadataFilter, VectorIndex};
use crate::normalize::{DocumentNormalizer, TextNormalizer, source_id_for};
use crate::reranker::{EmbeddingReranker, Reranker};

/// Number of top sources joined into the answer when full context is requested.
const FULL_CONTEXT_SOURCES: usize = 3;

/// Separator between sources in an assembled answer.
const CONTEXT_SEPARATOR: &str = "\n\n";

/// The retrieval pipeline for one immutable [`RetrievalConfig`].
///
/// Ingestion runs normalize → chunk → embed → upsert; querying runs
/// embed → search → rerank → assemble. A configuration change is applied by
/// building a new pipeline, never by mutating this one. Construct one via
/// [`RagPipeline::builder()`].
pub struct RagPipeline {
    config: RetrievalConfig,
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    chunker: Arc<dyn Chunker>,
    normalizer: Arc<dyn DocumentNormalizer>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RagPipeline {
    /// Create a new [`RagPipelineBuilder`].
    pub fn builder() -> RagPipelineBuilder {
        RagPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Return a reference to the embedder.
    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    /// Return a reference to the vector index.
    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Ingest a file, replacing the whole collection with its chunks.
    ///
    /// The document id is the file name. Returns the number of chunks stored.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConversionError`] if the file cannot be normalized
    /// or produces no text. Embedding failures abort before the index is
    /// touched, so the previous collection generation stays intact.
    pub async fn ingest_document(&self, path: &Path) -> Result<usize> {
        let source_id = source_id_for(path);
        let text = self.normalizer.normalize(path).await.map_err(|e| {
            error!(document.id = %source_id, error = %e, "document conversion failed");
            e
        })?;
        self.ingest_text(&source_id, text, true).await
    }

    /// Ingest already normalized text under `source_id`.
    ///
    /// With `replace_all` the collection is dropped and refilled with this
    /// document only; otherwise the chunks are appended.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConversionError`] for empty text, and propagates
    /// embedding and index errors.
    pub async fn ingest_text(
        &self,
        source_id: &str,
        text: String,
        replace_all: bool,
    ) -> Result<usize> {
        let span = info_span!("pipeline.ingest", document.id = %source_id, replace_all);
        async move {
            let mut chunks = if text.trim().is_empty() {
                Vec::new()
            } else {
                self.chunker.split(source_id, &text)
            };
            drop(text);
            if chunks.is_empty() {
                error!(document.id = %source_id, "document produced no text");
                return Err(RagError::ConversionError {
                    path: source_id.to_string(),
                    message: "document produced no text".to_string(),
                });
            }
            debug!(document.id = %source_id, chunk_count = chunks.len(), "document chunked");

            // Texts move out of the chunks; the index stores them once.
            let texts: Vec<String> =
                chunks.iter_mut().map(|c| std::mem::take(&mut c.content)).collect();
            let vectors = self.embedder.encode_batch(&texts).await.map_err(|e| {
                error!(document.id = %source_id, error = %e, "embedding failed during ingestion");
                e
            })?;

            let chunk_count = chunks.len();
            let collection_size =
                self.index.upsert(texts, vectors, chunks, replace_all).await.map_err(|e| {
                    error!(document.id = %source_id, error = %e, "upsert failed during ingestion");
                    e
                })?;

            info!(document.id = %source_id, chunk_count, collection_size, "ingested document");
            Ok(chunk_count)
        }
        .instrument(span)
        .await
    }

    /// Answer `question` from the index.
    ///
    /// `n_results` defaults to the configured value. With
    /// `return_full_context` the answer joins the top three sources with a
    /// blank line; otherwise it is the single best source. An empty index
    /// yields the "no relevant information found" result.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] for `n_results == Some(0)` and
    /// propagates embedding, index and reranker errors.
    pub async fn query(
        &self,
        question: &str,
        n_results: Option<usize>,
        return_full_context: bool,
    ) -> Result<QueryResult> {
        let n_results = n_results.unwrap_or(self.config.n_results);
        if n_results == 0 {
            return Err(RagError::ConfigError("n_results must be greater than zero".to_string()));
        }

        let span = info_span!("pipeline.query", n_results, return_full_context);
        async move {
            let query_vector = self.embedder.encode_query(question).await.map_err(|e| {
                error!(error = %e, "embedding failed during query");
                e
            })?;

            let raw = self.index.search(&[query_vector], n_results, None).await.map_err(|e| {
                error!(error = %e, "index search failed");
                e
            })?;

            if raw.first_len() == 0 {
                info!(result_count = 0, "no relevant information found");
                return Ok(QueryResult::no_relevant_information(question));
            }

            let RawSearchResults { documents, metadatas, distances, .. } = raw;
            let documents = documents.into_iter().next().unwrap_or_default();
            let metadatas = metadatas.into_iter().next().unwrap_or_default();
            let distances = distances.into_iter().next().unwrap_or_default();
            let mut sources: Vec<SearchResult> = documents
                .into_iter()
                .zip(metadatas)
                .zip(distances)
                .enumerate()
                .map(|(i, ((content, metadata), distance))| SearchResult {
                    content,
                    metadata,
                    distance,
                    similarity: distance_to_similarity(distance),
                    rank: i + 1,
                })
                .collect();

            if let Some(reranker) = &self.reranker {
                sources = reranker.rerank(question, sources).await.map_err(|e| {
                    error!(error = %e, "reranking failed");
                    e
                })?;
            }

            let threshold = self.config.min_similarity_threshold;
            let below = sources.iter().filter(|s| s.similarity < threshold).count();
            if below > 0 {
                debug!(below, threshold, "sources below advisory similarity threshold");
            }

            let answer = if return_full_context {
                sources
                    .iter()
                    .take(FULL_CONTEXT_SOURCES)
                    .map(|s| s.content.as_str())
                    .collect::<Vec<_>>()
                    .join(CONTEXT_SEPARATOR)
            } else {
                sources.first().map(|s| s.content.clone()).unwrap_or_default()
            };
            let similarity_scores: Vec<f32> = sources.iter().map(|s| s.similarity).collect();
            let avg_similarity = mean_similarity(&similarity_scores);

            info!(result_count = sources.len(), avg_similarity, "query completed");
            Ok(QueryResult {
                question: question.to_string(),
                answer,
                num_results: sources.len(),
                sources,
                similarity_scores,
                avg_similarity,
                generated_answer: false,
            })
        }
        .instrument(span)
        .await
    }

    /// Remove every chunk of `document_id`.
    ///
    /// Returns `None` when the document has no chunks in the index.
    pub async fn delete_document(&self, document_id: &str) -> Result<Option<usize>> {
        let filter = MetadataFilter::document(document_id);
        let deleted = self.index.delete(&filter).await.map_err(|e| {
            error!(document.id = %document_id, error = %e, "delete failed");
            e
        })?;

        match deleted {
            Some(chunk_count) => info!(document.id = %document_id, chunk_count, "deleted document"),
            None => info!(document.id = %document_id, "document not in index"),
        }
        Ok(deleted)
    }

    /// Every indexed document with its chunk count, sorted by id.
    pub async fn list_documents(&self) -> Result<DocumentList> {
        let metadatas = self.index.metadatas().await?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for metadata in &metadatas {
            if let Some(document_id) = metadata.get(DOCUMENT_KEY) {
                *counts.entry(document_id.clone()).or_default() += 1;
            }
        }

        let documents: Vec<DocumentInfo> = counts
            .into_iter()
            .map(|(document_id, chunks_count)| DocumentInfo { document_id, chunks_count })
            .collect();
        Ok(DocumentList {
            total_documents: documents.len(),
            total_chunks: metadatas.len(),
            documents,
        })
    }

    /// Size of the underlying collection.
    pub async fn stats(&self) -> Result<CollectionStats> {
        self.index.stats().await
    }
}

/// Builder for constructing a [`RagPipeline`].
///
/// `config`, `embedder` and `index` are required. The chunker defaults to
/// the strategy named in the config and the normalizer to
/// [`TextNormalizer`]. When the config enables reranking and no reranker is
/// set, an [`EmbeddingReranker`] over the same embedder is used; when it
/// disables reranking, no reranker runs.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = RagPipeline::builder()
///     .config(RetrievalConfig::builder().use_reranking(true).build()?)
///     .embedder(embedder)
///     .index(index)
///     .build()?;
/// ```
#[derive(Default)]
pub struct RagPipelineBuilder {
    config: Option<RetrievalConfig>,
    embedder: Option<Arc<Embedder>>,
    index: Option<Arc<dyn VectorIndex>>,
    chunker: Option<Arc<dyn Chunker>>,
    normalizer: Option<Arc<dyn DocumentNormalizer>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RagPipelineBuilder {
    /// Set the retrieval configuration.
    pub fn config(mut self, config: RetrievalConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedder.
    pub fn embedder(mut self, embedder: Arc<Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Set the vector index.
    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the chunker derived from the config.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Override the document normalizer.
    pub fn normalizer(mut self, normalizer: Arc<dyn DocumentNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Set the reranker used when the config enables reranking.
    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Build the [`RagPipeline`], validating the config and required fields.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a required field is missing or
    /// the config is invalid.
    pub fn build(self) -> Result<RagPipeline> {
        let config =
            self.config.ok_or_else(|| RagError::ConfigError("config is required".to_string()))?;
        config.validate()?;
        let embedder = self
            .embedder
            .ok_or_else(|| RagError::ConfigError("embedder is required".to_string()))?;
        let index =
            self.index.ok_or_else(|| RagError::ConfigError("index is required".to_string()))?;
        let chunker = match self.chunker {
            Some(chunker) => chunker,
            None => chunker_for(&config)?,
        };
        let normalizer = self.normalizer.unwrap_or_else(|| Arc::new(TextNormalizer::new()));
        let reranker = config.use_reranking.then(|| {
            self.reranker.unwrap_or_else(|| {
                Arc::new(EmbeddingReranker::new(embedder.clone())) as Arc<dyn Reranker>
            })
        });

        Ok(RagPipeline {
            config,
            embedder,
            index,
            chunker,
            normalizer,
            reranker,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::document::{Chunk, NO_RELEVANT_INFORMATION};
    use crate::hashing::HashingModelLoader;
    use crate::local_index::LocalVectorIndex;
    use crate::pool::WorkerPool;

    fn embedder() -> Arc<Embedder> {
        Arc::new(Embedder::new(
            Arc::new(HashingModelLoader::new(64)),
            EmbeddingConfig { dimensions: 64, ..Default::default() },
            WorkerPool::new(2),
        ))
    }

    /// Returns fixed distances regardless of the query.
    struct FixedIndex {
        distances: Vec<f32>,
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn upsert(
            &self,
            texts: Vec<String>,
            _vectors: Vec<Vec<f32>>,
            _chunks: Vec<Chunk>,
            _replace_all: bool,
        ) -> Result<usize> {
            Ok(texts.len())
        }

        async fn search(
            &self,
            _query_vectors: &[Vec<f32>],
            top_k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<RawSearchResults> {
            let n = self.distances.len().min(top_k);
            Ok(RawSearchResults {
                ids: vec![(0..n).map(|i| format!("doc_{i}")).collect()],
                documents: vec![(0..n).map(|i| format!("source {i}")).collect()],
                metadatas: vec![vec![HashMap::new(); n]],
                distances: vec![self.distances[..n].to_vec()],
            })
        }

        async fn delete(&self, _filter: &MetadataFilter) -> Result<Option<usize>> {
            Ok(None)
        }

        async fn stats(&self) -> Result<CollectionStats> {
            Ok(CollectionStats { name: "fixed".to_string(), count: self.distances.len() })
        }

        async fn metadatas(&self) -> Result<Vec<HashMap<String, String>>> {
            Ok(Vec::new())
        }
    }

    fn fixed_pipeline(distances: Vec<f32>) -> RagPipeline {
        RagPipeline::builder()
            .config(RetrievalConfig::default())
            .embedder(embedder())
            .index(Arc::new(FixedIndex { distances }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn assembles_full_context_from_top_three() {
        // 1/(1+d) gives similarities 0.9, 0.7 and 0.5.
        let distances = vec![1.0 / 0.9 - 1.0, 1.0 / 0.7 - 1.0, 1.0];
        let pipeline = fixed_pipeline(distances);

        let result = pipeline.query("q", None, true).await.unwrap();
        assert_eq!(result.answer, "source 0\n\nsource 1\n\nsource 2");
        assert_eq!(result.num_results, 3);
        assert!((result.avg_similarity - 0.7).abs() < 1e-5);
        assert_eq!(result.sources.iter().map(|s| s.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!result.generated_answer);

        let single = pipeline.query("q", None, false).await.unwrap();
        assert_eq!(single.answer, "source 0");
    }

    #[tokio::test]
    async fn empty_index_reports_no_information() {
        let pipeline = fixed_pipeline(Vec::new());
        let result = pipeline.query("anything", None, true).await.unwrap();
        assert_eq!(result.answer, NO_RELEVANT_INFORMATION);
        assert_eq!(result.num_results, 0);
        assert_eq!(result.avg_similarity, 0.0);
        assert!(result.sources.is_empty());
    }

    #[tokio::test]
    async fn rejects_zero_results() {
        let pipeline = fixed_pipeline(vec![0.1]);
        let err = pipeline.query("q", Some(0), true).await.unwrap_err();
        assert!(matches!(err, RagError::ConfigError(_)));
    }

    #[tokio::test]
    async fn empty_text_is_a_conversion_error() {
        let pipeline = RagPipeline::builder()
            .config(RetrievalConfig::default())
            .embedder(embedder())
            .index(Arc::new(LocalVectorIndex::in_memory("kb")))
            .build()
            .unwrap();
        let err = pipeline.ingest_text("empty.md", String::new(), true).await.unwrap_err();
        assert!(matches!(err, RagError::ConversionError { .. }));
    }

    #[test]
    fn build_requires_index() {
        let result = RagPipeline::builder()
            .config(RetrievalConfig::default())
            .embedder(embedder())
            .build();
        assert!(matches!(result, Err(RagError::ConfigError(_))));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = RetrievalConfig { chunk_size: 10, chunk_overlap: 10, ..Default::default() };
        let result = RagPipeline::builder()
            .config(config)
            .embedder(embedder())
            .index(Arc::new(LocalVectorIndex::in_memory("kb")))
            .build();
        assert!(matches!(result, Err(RagError::ConfigError(_))));
    }
}
