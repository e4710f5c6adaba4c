use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{Id, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// Span field that groups spans belonging to one request.
pub const REQUEST_ID_FIELD: &str = "request.id";

/// Data for a captured span
#[derive(Debug, Clone, Serialize)]
pub struct SpanData {
    pub span_id: String,
    pub name: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Nanoseconds since the Unix epoch.
    pub start_time: u128,
    pub end_time: u128,
    pub attributes: HashMap<String, serde_json::Value>,
}

impl SpanData {
    /// Span duration in nanoseconds.
    pub fn duration_nanos(&self) -> u128 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Closed spans grouped by request id
#[derive(Debug, Clone, Default)]
pub struct SpanStorage {
    spans: Arc<RwLock<HashMap<String, Vec<SpanData>>>>,
}

impl SpanStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spans recorded for `request_id`, in the order they closed.
    pub fn get(&self, request_id: &str) -> Option<Vec<SpanData>> {
        self.spans.read().ok()?.get(request_id).cloned()
    }

    /// Every request id with at least one span, sorted.
    pub fn request_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.spans.read().map(|spans| spans.keys().cloned().collect()).unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn add_span(&self, request_id: String, span: SpanData) {
        if let Ok(mut spans) = self.spans.write() {
            spans.entry(request_id).or_default().push(span);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut spans) = self.spans.write() {
            spans.clear();
        }
    }
}

/// A tracing layer that captures closed spans carrying a `request.id`.
///
/// Child spans inherit the request id of their parent, so a request span
/// opened at the service boundary collects every span beneath it.
pub struct InMemorySpanLayer {
    storage: SpanStorage,
}

impl InMemorySpanLayer {
    pub fn new(storage: SpanStorage) -> Self {
        Self { storage }
    }
}

#[derive(Clone)]
struct SpanFields(HashMap<String, serde_json::Value>);

#[derive(Clone, Copy)]
struct StartTime(u128);

fn now_nanos() -> u128 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_nanos()
}

impl<S> Layer<S> for InMemorySpanLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        let mut fields = visitor.0;

        if !fields.contains_key(REQUEST_ID_FIELD) {
            let inherited = span.parent().and_then(|parent| {
                let extensions = parent.extensions();
                extensions.get::<SpanFields>().and_then(|f| f.0.get(REQUEST_ID_FIELD).cloned())
            });
            if let Some(request_id) = inherited {
                fields.insert(REQUEST_ID_FIELD.to_string(), request_id);
            }
        }

        let mut extensions = span.extensions_mut();
        extensions.insert(StartTime(now_nanos()));
        extensions.insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            let mut visitor = JsonVisitor::default();
            values.record(&mut visitor);
            fields.0.extend(visitor.0);
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let extensions = span.extensions();
        let Some(fields) = extensions.get::<SpanFields>() else {
            return;
        };
        let Some(request_id) =
            fields.0.get(REQUEST_ID_FIELD).and_then(|v| v.as_str()).map(str::to_string)
        else {
            return;
        };

        let span_data = SpanData {
            span_id: format!("{:016x}", id.into_u64()),
            name: span.metadata().name().to_string(),
            request_id: request_id.clone(),
            parent_span_id: span.parent().map(|p| format!("{:016x}", p.id().into_u64())),
            start_time: extensions.get::<StartTime>().map_or(0, |s| s.0),
            end_time: now_nanos(),
            attributes: fields.0.clone(),
        };
        self.storage.add_span(request_id, span_data);
    }
}

#[derive(Default)]
struct JsonVisitor(HashMap<String, serde_json::Value>);

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }
}
