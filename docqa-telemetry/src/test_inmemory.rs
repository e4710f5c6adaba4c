use tracing::info_span;

use crate::memory::SpanStorage;

#[tokio::test]
async fn test_request_span_capture() {
    let storage = SpanStorage::new();
    let _default = tracing::subscriber::set_default(crate::storage_subscriber(storage.clone()));

    let span = info_span!("service.request", operation = "query", request.id = "req-000123");
    {
        let _guard = span.enter();
        tracing::info!("handling request");
    }
    drop(span);

    let spans = storage.get("req-000123").expect("span stored under request id");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "service.request");
    assert_eq!(spans[0].attributes["operation"], "query");
    assert!(spans[0].start_time > 0);
    assert!(spans[0].end_time >= spans[0].start_time);
}

#[tokio::test]
async fn test_children_inherit_request_id() {
    let storage = SpanStorage::new();
    let _default = tracing::subscriber::set_default(crate::storage_subscriber(storage.clone()));

    let parent = info_span!("service.request", request.id = "req-000007");
    let child = info_span!(parent: &parent, "pipeline.query", n_results = 3u64);
    drop(child);
    drop(parent);

    let spans = storage.get("req-000007").expect("spans stored");
    let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["pipeline.query", "service.request"]);
    assert_eq!(spans[0].attributes["n_results"], serde_json::json!(3));
    assert_eq!(spans[0].parent_span_id.as_deref(), Some(spans[1].span_id.as_str()));
}

#[tokio::test]
async fn test_spans_without_request_id_are_ignored() {
    let storage = SpanStorage::new();
    let _default = tracing::subscriber::set_default(crate::storage_subscriber(storage.clone()));

    drop(info_span!("background.task", session.id = "s-1"));

    assert!(storage.request_ids().is_empty());
    storage.clear();
    assert!(storage.get("s-1").is_none());
}

/// The only test in this crate that installs a global subscriber.
#[test]
fn test_init_with_storage_captures_globally() {
    let storage = SpanStorage::new();
    crate::init_with_storage("docqa-test", storage.clone()).expect("first global init");

    let span = info_span!("service.request", operation = "ingest", request.id = "req-global-1");
    span.in_scope(|| tracing::debug!("captured even when filtered from logs"));
    drop(span);

    let spans = storage.get("req-global-1").expect("span captured by global subscriber");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].attributes["operation"], "ingest");

    assert!(crate::init_telemetry("docqa-test").is_err());
    assert!(crate::init_json_telemetry("docqa-test").is_err());
}
