//! Offline embedding model based on feature hashing.
//!
//! Words and character trigrams are hashed into a fixed number of buckets
//! with a sign bit, the classic "hashing trick". There are no weights to
//! download, output is fully deterministic, and texts that share vocabulary
//! land close together, which is enough for keyword-heavy knowledge bases and
//! for tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::embedding::{EmbeddingModel, ModelLoader, l2_normalized};
use crate::error::{RagError, Result};

const MODEL_NAME: &str = "hashing";

/// Weight of a whole-word feature relative to a trigram feature.
const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Deterministic bag-of-features embedding model.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingModel {
    dimensions: usize,
}

impl HashingEmbeddingModel {
    /// Create a model producing `dimensions`-long vectors.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `dimensions` is zero.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(RagError::ConfigError(
                "embedding dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut vector, word.as_bytes(), WORD_WEIGHT);

            let padded: Vec<char> = format!(" {word} ").chars().collect();
            for trigram in padded.windows(3) {
                let trigram: String = trigram.iter().collect();
                self.add_feature(&mut vector, trigram.as_bytes(), TRIGRAM_WEIGHT);
            }
        }

        l2_normalized(vector)
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

/// 64-bit FNV-1a, stable across platforms and compiler versions.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingModel for HashingEmbeddingModel {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch_blocking(texts)
    }

    fn embed_batch_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// [`ModelLoader`] for [`HashingEmbeddingModel`].
#[derive(Debug, Clone)]
pub struct HashingModelLoader {
    dimensions: usize,
}

impl HashingModelLoader {
    /// Create a loader for `dimensions`-long vectors. Validation happens at load time.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl ModelLoader for HashingModelLoader {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>> {
        Ok(Arc::new(HashingEmbeddingModel::new(self.dimensions)?))
    }
}
