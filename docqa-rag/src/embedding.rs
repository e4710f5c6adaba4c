//! Embedding models and the batching [`Embedder`] in front of them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::pool::WorkerPool;

/// A model that generates vector embeddings from text input.
///
/// Implementations wrap specific backends (the local hashing model, an HTTP
/// endpoint, ...) behind a unified async interface. The default
/// [`embed`](EmbeddingModel::embed) implementation delegates to
/// [`embed_batch`](EmbeddingModel::embed_batch).
///
/// Models that compute on the local CPU report [`is_local`](EmbeddingModel::is_local)
/// and implement [`embed_batch_blocking`](EmbeddingModel::embed_batch_blocking);
/// the [`Embedder`] then runs them on a blocking worker thread.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Short model name used in logs and errors.
    fn name(&self) -> &str;

    /// Return the dimensionality of embeddings produced by this model.
    fn dimensions(&self) -> usize;

    /// Generate embedding vectors for a batch of text inputs, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Whether inference runs on the local CPU.
    fn is_local(&self) -> bool {
        false
    }

    /// Synchronous inference, for models where [`is_local`](EmbeddingModel::is_local) holds.
    fn embed_batch_blocking(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::embedding(self.name(), "model has no local inference path"))
    }

    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()]).await?.into_iter().next().ok_or_else(|| {
            RagError::embedding(self.name(), "model returned no vector for a single input")
        })
    }
}

/// Produces an [`EmbeddingModel`], typically at a noticeable one-off cost.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Name of the model this loader produces.
    fn name(&self) -> &str;

    /// Load the model.
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>>;
}

/// Options for a single [`Embedder::encode`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// L2-normalize every output vector.
    pub normalize: bool,
    /// Texts handed to the model per call.
    pub batch_size: usize,
}

enum ModelState {
    Unloaded,
    Loaded(Arc<dyn EmbeddingModel>),
}

/// Batching front end over a lazily loaded [`EmbeddingModel`].
///
/// The model is loaded on the first encode and kept until
/// [`clear_cache`](Embedder::clear_cache). Loading happens under a lock, so
/// concurrent first callers wait for a single load instead of racing.
/// Sub-batches run on the shared [`WorkerPool`]: local models on its blocking
/// threads, remote models as pooled async tasks.
pub struct Embedder {
    loader: Arc<dyn ModelLoader>,
    state: Mutex<ModelState>,
    config: EmbeddingConfig,
    pool: WorkerPool,
}

impl Embedder {
    /// Create an embedder. Nothing is loaded until the first encode.
    pub fn new(loader: Arc<dyn ModelLoader>, config: EmbeddingConfig, pool: WorkerPool) -> Self {
        Self { loader, state: Mutex::new(ModelState::Unloaded), config, pool }
    }

    /// The batching configuration.
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Options derived from the configuration.
    pub fn default_options(&self) -> EncodeOptions {
        EncodeOptions { normalize: self.config.normalize, batch_size: self.config.batch_size }
    }

    /// Whether the model is currently loaded.
    pub async fn is_loaded(&self) -> bool {
        matches!(*self.state.lock().await, ModelState::Loaded(_))
    }

    /// Return the loaded model, loading it first if needed.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error; the state stays unloaded so the next
    /// call retries.
    pub async fn model(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let mut state = self.state.lock().await;
        if let ModelState::Loaded(model) = &*state {
            return Ok(model.clone());
        }

        info!(model = self.loader.name(), "loading embedding model");
        let model = self.loader.load().await.map_err(|e| {
            error!(model = self.loader.name(), error = %e, "embedding model failed to load");
            e
        })?;
        info!(model = model.name(), dimensions = model.dimensions(), "embedding model loaded");
        *state = ModelState::Loaded(model.clone());
        Ok(model)
    }

    /// Release the loaded model. The next encode reloads it.
    pub async fn clear_cache(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, ModelState::Loaded(_)) {
            info!(model = self.loader.name(), "releasing embedding model");
        }
        *state = ModelState::Unloaded;
    }

    /// Encode `texts` in sub-batches of `options.batch_size`.
    ///
    /// Output vector `i` belongs to input text `i`. An empty input returns an
    /// empty output without touching the model.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmbeddingError`] if the model fails or returns the
    /// wrong number or shape of vectors.
    pub async fn encode<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: EncodeOptions,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model().await?;
        let batch_size = options.batch_size.max(1);
        let normalize = options.normalize;
        let mut vectors = Vec::with_capacity(texts.len());

        for (batch_index, group) in texts.chunks(batch_size).enumerate() {
            // The owned batch moves into the worker and is dropped there.
            let batch: Vec<String> = group.iter().map(|t| t.as_ref().to_string()).collect();
            let batch_len = batch.len();
            let worker_model = model.clone();
            let batch_vectors = if model.is_local() {
                self.pool
                    .run(move || {
                        let vectors = worker_model.embed_batch_blocking(&batch)?;
                        finish_batch(worker_model.as_ref(), vectors, batch.len(), normalize)
                    })
                    .await?
            } else {
                self.pool
                    .spawn(async move {
                        let vectors = worker_model.embed_batch(&batch).await?;
                        finish_batch(worker_model.as_ref(), vectors, batch.len(), normalize)
                    })
                    .await?
            };

            debug!(batch_index, batch_len, "encoded sub-batch");
            vectors.extend(batch_vectors);
        }

        Ok(vectors)
    }

    /// Encode a single query text with the configured options.
    pub async fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(&[text], self.default_options())
            .await?
            .pop()
            .ok_or_else(|| RagError::embedding(self.loader.name(), "no vector for query"))
    }

    /// Encode a large corpus with an adaptive sub-batch size.
    ///
    /// The configured batch size is halved (down to one) when the average
    /// text is longer than `long_text_threshold` characters, keeping the peak
    /// size of one model call roughly constant.
    pub async fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Vec<f32>>> {
        let batch_size = adaptive_batch_size(texts, &self.config);
        debug!(texts = texts.len(), batch_size, "encoding corpus");
        self.encode(texts, EncodeOptions { normalize: self.config.normalize, batch_size }).await
    }
}

/// Sub-batch size for a corpus, halved for long texts.
pub fn adaptive_batch_size<S: AsRef<str>>(texts: &[S], config: &EmbeddingConfig) -> usize {
    let batch_size = config.batch_size.max(1);
    if texts.is_empty() {
        return batch_size;
    }
    let total_chars: usize = texts.iter().map(|t| t.as_ref().chars().count()).sum();
    let average = total_chars / texts.len();
    if average > config.long_text_threshold { (batch_size / 2).max(1) } else { batch_size }
}

/// Validate one sub-batch of model output and normalize it if requested.
fn finish_batch(
    model: &dyn EmbeddingModel,
    vectors: Vec<Vec<f32>>,
    expected: usize,
    normalize: bool,
) -> Result<Vec<Vec<f32>>> {
    check_batch(model, &vectors, expected)?;
    if normalize { Ok(vectors.into_iter().map(l2_normalized).collect()) } else { Ok(vectors) }
}

fn check_batch(model: &dyn EmbeddingModel, vectors: &[Vec<f32>], expected: usize) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::embedding(
            model.name(),
            format!("model returned {} vectors for {expected} texts", vectors.len()),
        ));
    }
    let dimensions = model.dimensions();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(RagError::embedding(
            model.name(),
            format!("model returned a {}-dimensional vector, expected {dimensions}", bad.len()),
        ));
    }
    Ok(())
}

/// Scale `v` to unit length. Zero vectors are returned unchanged.
pub fn l2_normalized(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
