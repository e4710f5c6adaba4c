//! End-to-end ingestion and query scenarios through the service container.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use docqa_rag::{
    DefaultPipelineFactory, EmbeddingConfig, EmbeddingModel, HashingModelLoader, IndexConfig,
    LocalVectorIndex, ModelLoader, NO_RELEVANT_INFORMATION, PromptStore, RagError, RagService,
    RetrievalConfig, RetrievalConfigUpdate, WorkerPool,
};

const DIMENSIONS: usize = 128;

/// Hashing model wrapper that can be switched into failure.
struct SwitchableModel {
    inner: Arc<dyn EmbeddingModel>,
    failing: Arc<AtomicBool>,
}

#[async_trait]
impl EmbeddingModel for SwitchableModel {
    fn name(&self) -> &str {
        "switchable"
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed_batch(&self, texts: &[String]) -> docqa_rag::Result<Vec<Vec<f32>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RagError::EmbeddingError {
                provider: "switchable".to_string(),
                message: "inference backend unavailable".to_string(),
            });
        }
        self.inner.embed_batch(texts).await
    }
}

/// Counts model loads and hands out [`SwitchableModel`]s.
#[derive(Default)]
struct CountingLoader {
    loads: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

#[async_trait]
impl ModelLoader for CountingLoader {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn load(&self) -> docqa_rag::Result<Arc<dyn EmbeddingModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let inner = HashingModelLoader::new(DIMENSIONS).load().await?;
        Ok(Arc::new(SwitchableModel { inner, failing: self.failing.clone() }))
    }
}

fn factory(
    loader: Arc<dyn ModelLoader>,
    persist_dir: Option<&Path>,
) -> Arc<DefaultPipelineFactory> {
    let pool = WorkerPool::new(2);
    let index = LocalVectorIndex::new(IndexConfig {
        persist_dir: persist_dir.map(Path::to_path_buf),
        insert_batch_size: 3,
        ..Default::default()
    })
    .with_pool(pool.clone());
    Arc::new(DefaultPipelineFactory::new(
        loader,
        EmbeddingConfig { dimensions: DIMENSIONS, batch_size: 4, ..Default::default() },
        Arc::new(index),
        pool,
    ))
}

fn service_with(dir: &Path, loader: Arc<dyn ModelLoader>, persist: bool) -> RagService {
    let config = RetrievalConfig::builder().chunk_size(200).chunk_overlap(20).build().unwrap();
    let persist_dir = persist.then(|| dir.join("index"));
    RagService::builder()
        .factory(factory(loader, persist_dir.as_deref()))
        .config(config)
        .prompt_store(PromptStore::new(dir.join("prompt.txt")))
        .build()
        .unwrap()
}

fn service(dir: &Path, persist: bool) -> RagService {
    service_with(dir, Arc::new(HashingModelLoader::new(DIMENSIONS)), persist)
}

fn handbook() -> String {
    let paragraphs = [
        "Enrollment for the autumn semester opens on the first of August for two weeks.",
        "The tuition fee for the evening course is five hundred euros per semester.",
        "Parking permits are issued by the front office on Mondays and Thursdays only.",
        "The library opens at eight in the morning and closes at ten in the evening.",
        "Exams are held in the main hall; bring a photo identification card to every session.",
        "Scholarships cover up to half of the tuition fee for students with excellent grades.",
    ];
    paragraphs.join("\n\n").repeat(2)
}

async fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

#[tokio::test]
async fn ingest_then_list_shows_document() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let service = service(dir.path(), false);
    let path = write_file(dir.path(), "handbook.md", &handbook()).await;

    let chunk_count = service.ingest_document(&path).await?;
    assert!(chunk_count > 1);

    let list = service.list_documents().await?;
    assert_eq!(list.total_documents, 1);
    assert_eq!(list.total_chunks, chunk_count);
    assert_eq!(list.documents[0].document_id, "handbook.md");
    assert_eq!(list.documents[0].chunks_count, chunk_count);
    Ok(())
}

#[tokio::test]
async fn repeated_replace_all_ingest_has_no_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    let path = write_file(dir.path(), "handbook.md", &handbook()).await;

    let first = service.ingest_document(&path).await.unwrap();
    let second = service.ingest_document(&path).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(service.list_documents().await.unwrap().total_chunks, second);
}

#[tokio::test]
async fn query_returns_closest_sources_first() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    service
        .ingest_text("tuition.md", "The tuition fee for the evening course is 500 euros.".into())
        .await
        .unwrap();
    service
        .ingest_text("parking.md", "Parking permits are issued by the front office.".into())
        .await
        .unwrap();
    service
        .ingest_text("library.md", "The library opens at eight in the morning.".into())
        .await
        .unwrap();

    let question = "How much is the tuition fee for the evening course?";
    let result = service.query(question, None).await.unwrap();
    assert_eq!(result.num_results, 3);
    assert_eq!(result.sources[0].metadata["document"], "tuition.md");
    assert_eq!(result.sources.iter().map(|s| s.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    for pair in result.similarity_scores.windows(2) {
        assert!(pair[0] >= pair[1]);
    }
    let mean = result.similarity_scores.iter().sum::<f32>() / 3.0;
    assert!((result.avg_similarity - mean).abs() < 1e-6);

    let context: Vec<&str> = result.sources.iter().map(|s| s.content.as_str()).collect();
    assert_eq!(result.answer, context.join("\n\n"));
    assert!(!result.generated_answer);
}

#[tokio::test]
async fn empty_index_has_no_relevant_information() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);

    let result = service.query("Is there anything here?", None).await.unwrap();
    assert_eq!(result.answer, NO_RELEVANT_INFORMATION);
    assert_eq!(result.num_results, 0);
    assert_eq!(result.avg_similarity, 0.0);
}

#[tokio::test]
async fn delete_unknown_document_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    let path = write_file(dir.path(), "handbook.md", &handbook()).await;
    let chunk_count = service.ingest_document(&path).await.unwrap();

    let err = service.delete_document("missing.md").await.unwrap_err();
    assert!(matches!(err, RagError::NotFound { ref document_id } if document_id == "missing.md"));

    assert_eq!(service.delete_document("handbook.md").await.unwrap(), chunk_count);
    assert_eq!(service.list_documents().await.unwrap().total_documents, 0);
}

#[tokio::test]
async fn update_tolerates_missing_document() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    let text = "Classes start on the first Monday of autumn.";
    let path = write_file(dir.path(), "faq.txt", text).await;

    let count = service.update_document("faq.txt", &path).await.unwrap();
    assert_eq!(count, 1);
    let count = service.update_document("faq.txt", &path).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(service.list_documents().await.unwrap().total_chunks, 1);
}

#[tokio::test]
async fn failed_conversion_keeps_previous_generation() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    let good = write_file(dir.path(), "handbook.md", &handbook()).await;
    let blank = write_file(dir.path(), "blank.md", "   \n\n  \n").await;
    let binary = write_file(dir.path(), "slides.pptx", "not really slides").await;
    let chunk_count = service.ingest_document(&good).await.unwrap();

    let err = service.ingest_document(&blank).await.unwrap_err();
    assert!(matches!(err, RagError::ConversionError { .. }));
    let err = service.ingest_document(&binary).await.unwrap_err();
    assert!(matches!(err, RagError::ConversionError { .. }));

    let list = service.list_documents().await.unwrap();
    assert_eq!(list.documents[0].document_id, "handbook.md");
    assert_eq!(list.total_chunks, chunk_count);
}

#[tokio::test]
async fn persisted_index_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "handbook.md", &handbook()).await;
    let chunk_count = service(dir.path(), true).ingest_document(&path).await?;
    assert!(dir.path().join("index").join("knowledge_base.json").exists());

    let restarted = service(dir.path(), true);
    let list = restarted.list_documents().await?;
    assert_eq!(list.total_chunks, chunk_count);
    assert_eq!(list.documents[0].document_id, "handbook.md");
    Ok(())
}

#[tokio::test]
async fn config_update_swaps_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    let before = service.get_config().await;

    let invalid = RetrievalConfigUpdate { chunk_overlap: Some(500), ..Default::default() };
    let err = service.set_config(&invalid).await.unwrap_err();
    assert!(matches!(err, RagError::ConfigError(_)));
    assert_eq!(service.get_config().await, before);

    let update = RetrievalConfigUpdate {
        n_results: Some(2),
        use_reranking: Some(true),
        ..Default::default()
    };
    let after = service.set_config(&update).await.unwrap();
    assert_eq!(after.n_results, 2);
    assert!(after.use_reranking);
    assert_eq!(after.chunk_size, before.chunk_size);

    let path = write_file(dir.path(), "handbook.md", &handbook()).await;
    service.ingest_document(&path).await.unwrap();
    let result = service.query("When does enrollment open?", None).await.unwrap();
    assert_eq!(result.num_results, 2);
    assert_eq!(result.sources.iter().map(|s| s.rank).collect::<Vec<_>>(), vec![1, 2]);
    assert!(result.similarity_scores.iter().all(|s| (0.0..=1.0).contains(s)));
}

#[tokio::test]
async fn prompt_round_trips_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);

    assert_eq!(service.get_prompt().await.unwrap(), docqa_rag::DEFAULT_SYSTEM_PROMPT);
    service.set_prompt("Answer like a helpful registrar.").await.unwrap();
    assert_eq!(service.get_prompt().await.unwrap(), "Answer like a helpful registrar.");
}

#[tokio::test]
async fn health_reports_lazy_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);

    let health = service.health().await;
    assert_eq!(health.status, "ok");
    assert!(!health.pipeline_initialized);
    assert!(!health.llm_initialized);

    service.list_documents().await.unwrap();
    assert!(service.health().await.pipeline_initialized);
}

#[tokio::test]
async fn initialize_warms_up_embedding_model() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    service.initialize().await.unwrap();
    assert!(service.health().await.pipeline_initialized);
}

#[tokio::test]
async fn request_n_results_overrides_config() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), false);
    for (id, text) in [
        ("tuition.md", "The tuition fee for the evening course is 500 euros."),
        ("parking.md", "Parking permits are issued by the front office."),
        ("library.md", "The library opens at eight in the morning."),
    ] {
        service.ingest_text(id, text.into()).await.unwrap();
    }
    assert_eq!(service.get_config().await.n_results, 3);

    let result = service.query("How much is the tuition fee?", Some(1)).await.unwrap();
    assert_eq!(result.num_results, 1);
    assert_eq!(result.sources[0].metadata["document"], "tuition.md");
    assert_eq!(result.answer, result.sources[0].content);

    let result = service.query("How much is the tuition fee?", None).await.unwrap();
    assert_eq!(result.num_results, 3);

    let err = service.query("How much is the tuition fee?", Some(0)).await.unwrap_err();
    assert!(matches!(err, RagError::ConfigError(_)));
}

#[tokio::test]
async fn failing_model_leaves_index_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Arc::new(CountingLoader::default());
    let failing = loader.failing.clone();
    let service = service_with(dir.path(), loader, false);
    let good = write_file(dir.path(), "handbook.md", &handbook()).await;
    let other = write_file(dir.path(), "faq.txt", "Classes start on the first Monday.").await;
    service.ingest_document(&good).await.unwrap();
    let before = service.list_documents().await.unwrap();

    failing.store(true, Ordering::SeqCst);
    let err = service.ingest_document(&other).await.unwrap_err();
    assert!(matches!(err, RagError::EmbeddingError { .. }));
    let err = service.ingest_text("notes.md", "Bring a pencil.".into()).await.unwrap_err();
    assert!(matches!(err, RagError::EmbeddingError { .. }));
    assert_eq!(service.list_documents().await.unwrap(), before);

    failing.store(false, Ordering::SeqCst);
    assert_eq!(service.ingest_document(&other).await.unwrap(), 1);
}

#[tokio::test]
async fn config_change_reloads_embedding_model() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Arc::new(CountingLoader::default());
    let loads = loader.loads.clone();
    let service = service_with(dir.path(), loader, false);

    service.initialize().await.unwrap();
    service.query("When does enrollment open?", None).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    let update = RetrievalConfigUpdate { n_results: Some(2), ..Default::default() };
    service.set_config(&update).await.unwrap();
    service.query("When does enrollment open?", None).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}
