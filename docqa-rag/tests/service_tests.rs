//! Answer generation fallback and request tracing through the service.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docqa_rag::{
    AnswerGenerator, DefaultPipelineFactory, EmbeddingConfig, HashingModelLoader,
    LocalVectorIndex, PromptStore, RagError, RagService, Result, WorkerPool,
};
use docqa_telemetry::SpanStorage;

enum Behavior {
    Answer(&'static str),
    Fail,
    Hang,
}

struct ScriptedGenerator {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self { behavior, calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl AnswerGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, question: &str, context: &str, system_prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(!question.is_empty() && !context.is_empty() && !system_prompt.is_empty());
        match self.behavior {
            Behavior::Answer(answer) => Ok(answer.to_string()),
            Behavior::Fail => Err(RagError::GenerationError {
                provider: "scripted".to_string(),
                message: "upstream unavailable".to_string(),
            }),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("too late".to_string())
            }
        }
    }
}

fn service(dir: &std::path::Path, generator: Arc<ScriptedGenerator>) -> RagService {
    let pool = WorkerPool::new(2);
    let index = LocalVectorIndex::in_memory("knowledge_base").with_pool(pool.clone());
    let factory = DefaultPipelineFactory::new(
        Arc::new(HashingModelLoader::new(64)),
        EmbeddingConfig { dimensions: 64, ..Default::default() },
        Arc::new(index),
        pool,
    );
    RagService::builder()
        .factory(Arc::new(factory))
        .prompt_store(PromptStore::new(dir.join("prompt.txt")))
        .generator(generator)
        .generation_timeout(Duration::from_millis(50))
        .build()
        .unwrap()
}

async fn seed(service: &RagService) {
    let docs = [
        ("fees.md", "The course fee is 300 euros and can be paid in two parts."),
        ("hours.md", "The office is open from nine to five on weekdays."),
    ];
    for (id, text) in docs {
        service.ingest_text(id, text.to_string()).await.unwrap();
    }
}

fn joined_context(result: &docqa_rag::QueryResult) -> String {
    result.sources.iter().take(3).map(|s| s.content.as_str()).collect::<Vec<_>>().join("\n\n")
}

#[tokio::test]
async fn generated_answer_replaces_context() {
    let dir = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::new(Behavior::Answer("The fee is 300 euros."));
    let service = service(dir.path(), generator.clone());
    seed(&service).await;

    let result = service.query("How much is the course fee?", None).await.unwrap();
    assert_eq!(result.answer, "The fee is 300 euros.");
    assert!(result.generated_answer);
    assert_eq!(result.num_results, 2);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert!(service.health().await.llm_initialized);
}

#[tokio::test]
async fn failing_generator_falls_back_to_context() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), ScriptedGenerator::new(Behavior::Fail));
    seed(&service).await;

    let result = service.query("How much is the course fee?", None).await.unwrap();
    assert!(!result.generated_answer);
    assert_eq!(result.answer, joined_context(&result));
}

#[tokio::test]
async fn slow_generator_times_out_to_context() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), ScriptedGenerator::new(Behavior::Hang));
    seed(&service).await;

    let result = service.query("When is the office open?", None).await.unwrap();
    assert!(!result.generated_answer);
    assert_eq!(result.answer, joined_context(&result));
}

#[tokio::test]
async fn generator_is_skipped_without_results() {
    let dir = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::new(Behavior::Answer("unused"));
    let service = service(dir.path(), generator.clone());

    let result = service.query("Anything at all?", None).await.unwrap();
    assert_eq!(result.answer, docqa_rag::NO_RELEVANT_INFORMATION);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_spans_are_captured() {
    let storage = SpanStorage::new();
    let _default =
        tracing::subscriber::set_default(docqa_telemetry::storage_subscriber(storage.clone()));

    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path(), ScriptedGenerator::new(Behavior::Answer("ok")));
    seed(&service).await;
    service.query("How much is the course fee?", None).await.unwrap();

    let ids = storage.request_ids();
    assert_eq!(ids.len(), 3);
    let query_spans = storage.get(&ids[2]).unwrap();
    let names: Vec<&str> = query_spans.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"pipeline.query"));
    assert!(names.contains(&"service.request"));
    let ingest_spans = storage.get(&ids[0]).unwrap();
    assert!(ingest_spans.iter().any(|s| s.name == "pipeline.ingest"));
}
