use crate::memory::SpanData;

#[test]
fn test_span_data_serialization() {
    let span = SpanData {
        span_id: "00000000000000a1".to_string(),
        name: "pipeline.query".to_string(),
        request_id: "req-000001".to_string(),
        parent_span_id: None,
        start_time: 1234567890000000000,
        end_time: 1234567890000001000,
        attributes: std::collections::HashMap::new(),
    };

    let json = serde_json::to_string_pretty(&span).unwrap();

    assert!(json.contains("\"span_id\""));
    assert!(json.contains("\"request_id\""));
    assert!(json.contains("\"start_time\""));
    assert!(json.contains("\"end_time\""));
    // Absent parents are omitted rather than serialized as null
    assert!(!json.contains("\"parent_span_id\""));
    assert_eq!(span.duration_nanos(), 1000);
}
