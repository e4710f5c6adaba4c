//! Vector index trait, metadata filters and distance metrics.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{Chunk, CollectionStats, DOCUMENT_KEY, RawSearchResults};
use crate::error::Result;

/// A storage backend for one named collection of embedded chunks.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::{LocalVectorIndex, VectorIndex};
///
/// let index = LocalVectorIndex::new(IndexConfig::default());
/// index.upsert(texts, vectors, chunks, true).await?;
/// let raw = index.search(&[query_vector], 3, None).await?;
/// ```
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Name of the collection.
    fn name(&self) -> &str;

    /// Write embedded chunks and return the collection size afterwards.
    ///
    /// `texts[i]`, `vectors[i]` and `chunks[i]` describe the same entry;
    /// `texts` is authoritative for the stored content and `chunks` supplies
    /// the metadata. With `replace_all` the collection is dropped and
    /// recreated before the first entry is written, starting a new
    /// generation with a fresh id space. Entries are inserted in fixed-size
    /// batches.
    async fn upsert(
        &self,
        texts: Vec<String>,
        vectors: Vec<Vec<f32>>,
        chunks: Vec<Chunk>,
        replace_all: bool,
    ) -> Result<usize>;

    /// Return the `top_k` nearest entries for each query vector.
    ///
    /// Rows are ordered by ascending distance.
    async fn search(
        &self,
        query_vectors: &[Vec<f32>],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<RawSearchResults>;

    /// Delete every entry matching `filter`.
    ///
    /// Returns `None` when nothing matched a filter that names a document,
    /// so callers can tell "no such document" apart from a successful delete.
    async fn delete(&self, filter: &MetadataFilter) -> Result<Option<usize>>;

    /// Current collection size.
    async fn stats(&self) -> Result<CollectionStats>;

    /// Metadata of every entry, in insertion order.
    async fn metadatas(&self) -> Result<Vec<HashMap<String, String>>>;
}

/// A conjunction of metadata equality constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    constraints: Vec<(String, String)>,
}

impl MetadataFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match entries belonging to `document_id`.
    pub fn document(document_id: impl Into<String>) -> Self {
        Self::new().eq(DOCUMENT_KEY, document_id)
    }

    /// Add the constraint `metadata[key] == value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.push((key.into(), value.into()));
        self
    }

    /// Whether `metadata` satisfies every constraint.
    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.constraints.iter().all(|(k, v)| metadata.get(k) == Some(v))
    }

    /// The document this filter targets, if it names one.
    pub fn document_id(&self) -> Option<&str> {
        self.constraints.iter().find(|(k, _)| k == DOCUMENT_KEY).map(|(_, v)| v.as_str())
    }
}

/// How the index measures distance between vectors.
///
/// Both metrics grow as vectors become less similar, so distances convert
/// uniformly through
/// [`distance_to_similarity`](crate::document::distance_to_similarity).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Sum of squared coordinate differences.
    #[default]
    SquaredL2,
    /// `1 - cos(a, b)`; `1.0` when either vector is zero.
    Cosine,
}

impl DistanceMetric {
    /// Distance between two vectors of equal length.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::SquaredL2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::Cosine => 1.0 - cosine_similarity(a, b),
        }
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
