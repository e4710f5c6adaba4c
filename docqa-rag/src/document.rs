//! Data types for chunks, index entries, search results and answers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata key naming the source document of a chunk.
pub const DOCUMENT_KEY: &str = "document";

/// Metadata key holding the chunk's sequence number within its document.
pub const CHUNK_ID_KEY: &str = "chunk_id";

/// A bounded slice of a document's text, the unit of embedding and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// The text content of the chunk. Never empty.
    pub content: String,
    /// Identifier of the document this chunk was cut from.
    pub source_id: String,
    /// Zero-based position of the chunk within its document.
    pub sequence: usize,
    /// Key-value metadata, always including [`DOCUMENT_KEY`] and [`CHUNK_ID_KEY`].
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    pub(crate) fn new(source_id: &str, sequence: usize, content: String) -> Self {
        let metadata = HashMap::from([
            (DOCUMENT_KEY.to_string(), source_id.to_string()),
            (CHUNK_ID_KEY.to_string(), sequence.to_string()),
        ]);
        Self { content, source_id: source_id.to_string(), sequence, metadata }
    }
}

/// A chunk as persisted in the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    /// Collection-unique identifier, assigned at insertion.
    pub id: String,
    /// The vector embedding of `content`.
    pub embedding: Vec<f32>,
    /// The chunk text.
    pub content: String,
    /// The chunk metadata.
    pub metadata: HashMap<String, String>,
}

/// Raw search output, one row per query vector.
///
/// Each row is ordered by ascending distance. The four tables are parallel:
/// `ids[q][i]`, `documents[q][i]`, `metadatas[q][i]` and `distances[q][i]`
/// describe the same entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawSearchResults {
    pub ids: Vec<Vec<String>>,
    pub documents: Vec<Vec<String>>,
    pub metadatas: Vec<Vec<HashMap<String, String>>>,
    pub distances: Vec<Vec<f32>>,
}

impl RawSearchResults {
    /// Number of hits for the first query vector.
    pub fn first_len(&self) -> usize {
        self.ids.first().map_or(0, Vec::len)
    }
}

/// A retrieved chunk with its scores, as handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// The chunk text.
    pub content: String,
    /// The chunk metadata.
    pub metadata: HashMap<String, String>,
    /// Raw distance reported by the index (lower is closer).
    pub distance: f32,
    /// Bounded relevance score (higher is more relevant).
    pub similarity: f32,
    /// One-based position in the final ordering.
    pub rank: usize,
}

/// Convert an index distance into a similarity in `(0, 1]`.
///
/// Every index implementation reports distances through this one function so
/// callers never compare raw distances from different metrics.
pub fn distance_to_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// The structured answer to a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub question: String,
    /// Generated answer, or the assembled retrieval context when no generation happened.
    pub answer: String,
    pub sources: Vec<SearchResult>,
    pub similarity_scores: Vec<f32>,
    /// Arithmetic mean of `similarity_scores`; `0.0` when there are none.
    pub avg_similarity: f32,
    pub num_results: usize,
    /// Whether `answer` came from the answer generator.
    #[serde(default)]
    pub generated_answer: bool,
}

/// Answer text used when retrieval finds nothing.
pub const NO_RELEVANT_INFORMATION: &str = "no relevant information found";

impl QueryResult {
    /// The terminal result for a question with no candidates.
    pub fn no_relevant_information(question: &str) -> Self {
        Self {
            question: question.to_string(),
            answer: NO_RELEVANT_INFORMATION.to_string(),
            sources: Vec::new(),
            similarity_scores: Vec::new(),
            avg_similarity: 0.0,
            num_results: 0,
            generated_answer: false,
        }
    }
}

/// Arithmetic mean, `0.0` for an empty slice.
pub fn mean_similarity(scores: &[f32]) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f32>() / scores.len() as f32
}

/// Collection size summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionStats {
    pub name: String,
    pub count: usize,
}

/// One indexed document and how many chunks it has.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentInfo {
    pub document_id: String,
    pub chunks_count: usize,
}

/// Every indexed document, sorted by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentList {
    pub documents: Vec<DocumentInfo>,
    pub total_documents: usize,
    pub total_chunks: usize,
}

/// Service liveness summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    pub pipeline_initialized: bool,
    pub llm_initialized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_decreases_with_distance() {
        assert_eq!(distance_to_similarity(0.0), 1.0);
        assert!((distance_to_similarity(1.0) - 0.5).abs() < f32::EPSILON);
        assert!(distance_to_similarity(2.0) < distance_to_similarity(1.0));
    }

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean_similarity(&[]), 0.0);
        assert!((mean_similarity(&[0.9, 0.7, 0.5]) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn chunk_metadata_names_document() {
        let chunk = Chunk::new("faq.md", 3, "text".to_string());
        assert_eq!(chunk.metadata[DOCUMENT_KEY], "faq.md");
        assert_eq!(chunk.metadata[CHUNK_ID_KEY], "3");
    }
}
