//! Reranker trait for re-scoring search results.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::document::SearchResult;
use crate::embedding::{EncodeOptions, Embedder};
use crate::error::{RagError, Result};
use crate::index::cosine_similarity;

/// A reranker that re-scores and reorders search results.
///
/// Implementations receive the full candidate set and return the same set,
/// possibly in a different order and with updated `similarity` and `rank`.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Rerank search results given the original query.
    async fn rerank(&self, query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>>;
}

/// A no-op reranker that returns results unchanged.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::NoOpReranker;
///
/// let reranker = NoOpReranker;
/// let reranked = reranker.rerank("query", results).await?;
/// // reranked == results (same order, same scores)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReranker;

#[async_trait]
impl Reranker for NoOpReranker {
    async fn rerank(&self, _query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        Ok(results)
    }
}

/// Second-pass scoring with freshly computed, normalized embeddings.
///
/// Each candidate's `similarity` becomes `(cos + 1) / 2` of the query and
/// candidate embeddings, so it stays in `[0, 1]`. Candidates are re-sorted by
/// that score (ties keep their retrieval order) and ranked again from 1.
pub struct EmbeddingReranker {
    embedder: Arc<Embedder>,
}

impl EmbeddingReranker {
    const NAME: &'static str = "embedding";

    /// Rerank with `embedder`, normally the one the pipeline queries with.
    pub fn new(embedder: Arc<Embedder>) -> Self {
        Self { embedder }
    }

    fn failed(e: RagError) -> RagError {
        error!(reranker = Self::NAME, error = %e, "reranking failed");
        RagError::RerankerError { reranker: Self::NAME.to_string(), message: e.to_string() }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rerank(&self, query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        if results.is_empty() {
            return Ok(results);
        }

        let options = EncodeOptions { normalize: true, ..self.embedder.default_options() };
        let query_vector =
            self.embedder.encode(&[query], options).await.map_err(Self::failed)?.pop().ok_or_else(
                || Self::failed(RagError::PipelineError("no query vector".to_string())),
            )?;
        let contents: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
        let vectors = self.embedder.encode(&contents, options).await.map_err(Self::failed)?;

        let mut rescored: Vec<SearchResult> = results
            .into_iter()
            .zip(vectors)
            .map(|(mut result, vector)| {
                result.similarity = (cosine_similarity(&query_vector, &vector) + 1.0) / 2.0;
                result
            })
            .collect();
        rescored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        for (i, result) in rescored.iter_mut().enumerate() {
            result.rank = i + 1;
        }

        debug!(candidates = rescored.len(), "reranked candidates");
        Ok(rescored)
    }
}
