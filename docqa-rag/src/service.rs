//! Process-wide service container.
//!
//! [`RagService`] owns the current [`RagPipeline`], the optional
//! [`AnswerGenerator`] and the [`PromptStore`], and exposes the operations a
//! transport layer calls. Configuration changes build a brand-new pipeline
//! and swap it in; ingestion and deletion go through a single admission lock.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{EmbeddingConfig, RetrievalConfig, RetrievalConfigUpdate, ServiceSettings};
use crate::document::{DocumentList, HealthStatus, QueryResult};
use crate::embedding::{Embedder, ModelLoader};
use crate::error::{RagError, Result};
use crate::generation::AnswerGenerator;
use crate::hashing::HashingModelLoader;
use crate::index::VectorIndex;
use crate::local_index::LocalVectorIndex;
use crate::pipeline::RagPipeline;
use crate::pool::WorkerPool;
use crate::prompt::{DEFAULT_SYSTEM_PROMPT, PromptStore};

/// Query used to load the embedding model during [`RagService::initialize`].
const WARM_UP_QUERY: &str = "warm-up query";

/// Builds a pipeline for a given configuration.
pub trait PipelineFactory: Send + Sync {
    /// Build a ready pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `config` is invalid.
    fn build(&self, config: &RetrievalConfig) -> Result<RagPipeline>;
}

/// Factory giving every pipeline its own embedder over a shared index.
///
/// The embedding model is loaded lazily per pipeline, so a config change
/// discards the old model along with the old pipeline. The cached collection
/// handle and the worker pool outlive both.
pub struct DefaultPipelineFactory {
    loader: Arc<dyn ModelLoader>,
    embedding: EmbeddingConfig,
    index: Arc<dyn VectorIndex>,
    pool: WorkerPool,
}

impl DefaultPipelineFactory {
    /// Create a factory that loads models through `loader` with `embedding`
    /// settings, runs inference on `pool` and shares `index` across pipelines.
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        embedding: EmbeddingConfig,
        index: Arc<dyn VectorIndex>,
        pool: WorkerPool,
    ) -> Self {
        Self { loader, embedding, index, pool }
    }

    /// Wire the local index and the configured embedding model.
    ///
    /// Uses the remote embedding endpoint when one is configured and the
    /// `openai` feature is enabled, the local hashing model otherwise.
    pub fn from_settings(settings: &ServiceSettings) -> Self {
        let pool = WorkerPool::new(settings.worker_threads);
        let index = LocalVectorIndex::new(settings.index.clone()).with_pool(pool.clone());
        Self::new(model_loader(settings), settings.embedding.clone(), Arc::new(index), pool)
    }
}

impl PipelineFactory for DefaultPipelineFactory {
    fn build(&self, config: &RetrievalConfig) -> Result<RagPipeline> {
        let embedder =
            Embedder::new(self.loader.clone(), self.embedding.clone(), self.pool.clone());
        RagPipeline::builder()
            .config(config.clone())
            .embedder(Arc::new(embedder))
            .index(self.index.clone())
            .build()
    }
}

#[cfg(feature = "openai")]
fn model_loader(settings: &ServiceSettings) -> Arc<dyn ModelLoader> {
    match &settings.remote_embedding {
        Some(remote) => Arc::new(crate::openai::OpenAiEmbeddingLoader::new(remote.clone())),
        None => Arc::new(HashingModelLoader::new(settings.embedding.dimensions)),
    }
}

#[cfg(not(feature = "openai"))]
fn model_loader(settings: &ServiceSettings) -> Arc<dyn ModelLoader> {
    if settings.remote_embedding.is_some() {
        warn!("remote embedding configured without the `openai` feature, using hashing model");
    }
    Arc::new(HashingModelLoader::new(settings.embedding.dimensions))
}

#[cfg(feature = "openai")]
fn answer_generator(settings: &ServiceSettings) -> Result<Option<Arc<dyn AnswerGenerator>>> {
    settings
        .llm
        .as_ref()
        .map(|llm| {
            crate::openai::OpenAiGenerator::new(llm.clone())
                .map(|g| Arc::new(g) as Arc<dyn AnswerGenerator>)
        })
        .transpose()
}

#[cfg(not(feature = "openai"))]
fn answer_generator(settings: &ServiceSettings) -> Result<Option<Arc<dyn AnswerGenerator>>> {
    if settings.llm.is_some() {
        warn!("LLM configured but the `openai` feature is disabled; answers are raw context");
    }
    Ok(None)
}

/// The service container behind the transport layer.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::{RagService, ServiceSettings};
///
/// let service = RagService::from_settings(&ServiceSettings::from_env()?)?;
/// service.initialize().await?;
/// service.ingest_document(Path::new("uploads/faq.md")).await?;
/// let result = service.query("How much does the course cost?", None).await?;
/// ```
pub struct RagService {
    factory: Arc<dyn PipelineFactory>,
    config: RwLock<RetrievalConfig>,
    current: RwLock<Option<Arc<RagPipeline>>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
    prompts: PromptStore,
    admission: Mutex<()>,
    generation_timeout: Duration,
    next_request: AtomicU64,
}

impl RagService {
    /// Create a new [`RagServiceBuilder`].
    pub fn builder() -> RagServiceBuilder {
        RagServiceBuilder::default()
    }

    /// Build the service from process settings.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if the answer generator settings are
    /// invalid.
    pub fn from_settings(settings: &ServiceSettings) -> Result<Self> {
        let mut builder = Self::builder()
            .factory(Arc::new(DefaultPipelineFactory::from_settings(settings)))
            .prompt_store(PromptStore::new(&settings.prompt_file))
            .generation_timeout(settings.generation_timeout);
        if let Some(generator) = answer_generator(settings)? {
            builder = builder.generator(generator);
        }
        builder.build()
    }

    fn request_span(&self, operation: &'static str) -> tracing::Span {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed);
        info_span!("service.request", operation, request.id = %format!("req-{n:06}"))
    }

    /// Build the pipeline for the current config and load the embedding model.
    ///
    /// A failing warm-up is logged and the model loads on first use instead.
    pub async fn initialize(&self) -> Result<()> {
        let pipeline = self.install(true).await?;
        match pipeline.embedder().encode_query(WARM_UP_QUERY).await {
            Ok(_) => info!("embedding model warmed up"),
            Err(e) => warn!(error = %e, "embedding warm-up failed"),
        }
        Ok(())
    }

    /// Build a pipeline for the current config and make it current.
    ///
    /// Without `replace`, a pipeline installed concurrently is kept.
    async fn install(&self, replace: bool) -> Result<Arc<RagPipeline>> {
        let config = self.config.read().await.clone();
        let mut current = self.current.write().await;
        if let Some(existing) = current.as_ref().filter(|_| !replace) {
            return Ok(existing.clone());
        }

        let pipeline = Arc::new(self.factory.build(&config)?);
        *current = Some(pipeline.clone());
        info!(
            chunk_size = config.chunk_size,
            chunk_overlap = config.chunk_overlap,
            n_results = config.n_results,
            use_reranking = config.use_reranking,
            "pipeline initialized"
        );
        Ok(pipeline)
    }

    async fn current(&self) -> Result<Arc<RagPipeline>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(|| RagError::NotInitialized("retrieval pipeline".to_string()))
    }

    /// The current pipeline, initializing it first if needed.
    async fn pipeline(&self) -> Result<Arc<RagPipeline>> {
        match self.current().await {
            Err(RagError::NotInitialized(what)) => {
                warn!(component = %what, "not initialized, initializing on demand");
                self.install(false).await
            }
            other => other,
        }
    }

    /// Answer a question, generating the final answer when a generator is set.
    ///
    /// `n_results` overrides the configured source count for this request.
    /// Generation runs under the configured timeout; on failure or timeout
    /// the answer is the assembled retrieval context.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] for `n_results == Some(0)`.
    pub async fn query(&self, question: &str, n_results: Option<usize>) -> Result<QueryResult> {
        let span = self.request_span("query");
        async move {
            let pipeline = self.pipeline().await?;
            let mut result = pipeline.query(question, n_results, true).await?;

            let Some(generator) = &self.generator else {
                return Ok(result);
            };
            if result.num_results == 0 || result.answer.is_empty() {
                return Ok(result);
            }

            let prompt = self.prompts.load().await.unwrap_or_else(|e| {
                warn!(error = %e, "using default system prompt");
                DEFAULT_SYSTEM_PROMPT.to_string()
            });
            let generation = generator.generate(question, &result.answer, &prompt);
            let outcome = tokio::time::timeout(self.generation_timeout, generation).await;
            match outcome {
                Ok(Ok(answer)) => {
                    info!(generator = generator.name(), "answer generated");
                    result.answer = answer;
                    result.generated_answer = true;
                }
                Ok(Err(e)) => {
                    warn!(
                        generator = generator.name(),
                        error = %e,
                        "generation failed, returning context"
                    );
                }
                Err(_) => {
                    warn!(
                        generator = generator.name(),
                        timeout_secs = self.generation_timeout.as_secs_f64(),
                        "generation timed out, returning context"
                    );
                }
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Ingest a file, replacing the collection. Returns the chunk count.
    pub async fn ingest_document(&self, path: &Path) -> Result<usize> {
        let span = self.request_span("ingest");
        async move {
            let _admission = self.admission.lock().await;
            self.pipeline().await?.ingest_document(path).await
        }
        .instrument(span)
        .await
    }

    /// Append already normalized text under `source_id`. Returns the chunk count.
    pub async fn ingest_text(&self, source_id: &str, text: String) -> Result<usize> {
        let span = self.request_span("ingest_text");
        async move {
            let _admission = self.admission.lock().await;
            self.pipeline().await?.ingest_text(source_id, text, false).await
        }
        .instrument(span)
        .await
    }

    /// Delete a document's chunks and return how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotFound`] when the index has no chunks for it.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let span = self.request_span("delete");
        async move {
            let _admission = self.admission.lock().await;
            self.delete_unlocked(document_id).await
        }
        .instrument(span)
        .await
    }

    async fn delete_unlocked(&self, document_id: &str) -> Result<usize> {
        self.pipeline().await?.delete_document(document_id).await?.ok_or_else(|| {
            RagError::NotFound { document_id: document_id.to_string() }
        })
    }

    /// Replace a document: delete it, then ingest `path`.
    ///
    /// A missing document is not an error. A failure between the two steps
    /// leaves the document absent.
    pub async fn update_document(&self, document_id: &str, path: &Path) -> Result<usize> {
        let span = self.request_span("update");
        async move {
            let _admission = self.admission.lock().await;
            match self.delete_unlocked(document_id).await {
                Ok(_) | Err(RagError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            self.pipeline().await?.ingest_document(path).await.map_err(|e| {
                error!(document.id = %document_id, error = %e, "re-ingest failed after delete");
                e
            })
        }
        .instrument(span)
        .await
    }

    /// Every indexed document with its chunk count.
    pub async fn list_documents(&self) -> Result<DocumentList> {
        self.pipeline().await?.list_documents().await
    }

    /// The active retrieval configuration.
    pub async fn get_config(&self) -> RetrievalConfig {
        self.config.read().await.clone()
    }

    /// Merge `update` onto the active config and swap in a new pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if the merged config is invalid; the
    /// running pipeline is left untouched.
    pub async fn set_config(&self, update: &RetrievalConfigUpdate) -> Result<RetrievalConfig> {
        let mut config = self.config.write().await;
        let next = config.merged(update)?;
        let pipeline = Arc::new(self.factory.build(&next)?);

        *self.current.write().await = Some(pipeline);
        *config = next.clone();
        info!(
            chunk_size = next.chunk_size,
            chunk_overlap = next.chunk_overlap,
            n_results = next.n_results,
            use_reranking = next.use_reranking,
            "configuration updated"
        );
        Ok(next)
    }

    /// The stored system prompt.
    pub async fn get_prompt(&self) -> Result<String> {
        self.prompts.load().await
    }

    /// Replace the stored system prompt.
    pub async fn set_prompt(&self, prompt: &str) -> Result<()> {
        self.prompts.save(prompt).await
    }

    /// Liveness summary.
    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            pipeline_initialized: self.current.read().await.is_some(),
            llm_initialized: self.generator.is_some(),
        }
    }
}

/// Builder for constructing a [`RagService`].
///
/// `factory` and `prompt_store` are required.
#[derive(Default)]
pub struct RagServiceBuilder {
    factory: Option<Arc<dyn PipelineFactory>>,
    config: Option<RetrievalConfig>,
    generator: Option<Arc<dyn AnswerGenerator>>,
    prompts: Option<PromptStore>,
    generation_timeout: Option<Duration>,
}

impl RagServiceBuilder {
    /// Set the pipeline factory.
    pub fn factory(mut self, factory: Arc<dyn PipelineFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the initial retrieval configuration.
    pub fn config(mut self, config: RetrievalConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the answer generator.
    pub fn generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set the system prompt store.
    pub fn prompt_store(mut self, prompts: PromptStore) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Bound each generation call; defaults to 30 seconds.
    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = Some(timeout);
        self
    }

    /// Build the [`RagService`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a required field is missing or
    /// the initial config is invalid.
    pub fn build(self) -> Result<RagService> {
        let factory =
            self.factory.ok_or_else(|| RagError::ConfigError("factory is required".to_string()))?;
        let prompts = self
            .prompts
            .ok_or_else(|| RagError::ConfigError("prompt_store is required".to_string()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        Ok(RagService {
            factory,
            config: RwLock::new(config),
            current: RwLock::new(None),
            generator: self.generator,
            prompts,
            admission: Mutex::new(()),
            generation_timeout: self.generation_timeout.unwrap_or(Duration::from_secs(30)),
            next_request: AtomicU64::new(0),
        })
    }
}
