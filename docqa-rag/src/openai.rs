//! OpenAI-compatible HTTP backends: an embedding model and an answer generator.
//!
//! This module is only available when the `openai` feature is enabled. Any
//! server speaking the OpenAI `/embeddings` and `/chat/completions` wire
//! format works, including local inference servers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::RemoteModelSettings;
use crate::embedding::{EmbeddingModel, ModelLoader};
use crate::error::{RagError, Result};
use crate::generation::{AnswerGenerator, user_prompt};

const PROVIDER: &str = "OpenAI";

/// Text embedded once at load time to discover the output dimensionality.
const SAMPLE_TEXT: &str = "dimension check";

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

/// Send a JSON request and decode the JSON response, mapping failures with `on_error`.
async fn post_json<Req, Resp>(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &Req,
    on_error: impl Fn(String) -> RagError,
) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: for<'de> Deserialize<'de>,
{
    let mut request = client.post(url).json(body);
    if !api_key.is_empty() {
        request = request.bearer_auth(api_key);
    }

    let response = request.send().await.map_err(|e| {
        error!(provider = PROVIDER, url, error = %e, "request failed");
        on_error(format!("request failed: {e}"))
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail =
            serde_json::from_str::<ErrorResponse>(&body).map(|e| e.error.message).unwrap_or(body);

        error!(provider = PROVIDER, %status, "API error");
        return Err(on_error(format!("API returned {status}: {detail}")));
    }

    response.json().await.map_err(|e| {
        error!(provider = PROVIDER, error = %e, "failed to parse response");
        on_error(format!("failed to parse response: {e}"))
    })
}

// ── API request/response types ─────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

// ── Embedding model ────────────────────────────────────────────────

/// An [`EmbeddingModel`] backed by an OpenAI-compatible embeddings endpoint.
pub struct OpenAiEmbeddingModel {
    client: reqwest::Client,
    settings: RemoteModelSettings,
    dimensions: usize,
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    fn name(&self) -> &str {
        &self.settings.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            provider = PROVIDER,
            batch_size = texts.len(),
            model = %self.settings.model,
            "embedding batch"
        );
        request_embeddings(&self.client, &self.settings, texts).await
    }
}

async fn request_embeddings(
    client: &reqwest::Client,
    settings: &RemoteModelSettings,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let body = EmbeddingRequest { model: &settings.model, input: texts };
    let response: EmbeddingResponse = post_json(
        client,
        &endpoint(&settings.base_url, "embeddings"),
        &settings.api_key,
        &body,
        |message| RagError::embedding(PROVIDER, message),
    )
    .await?;

    // Servers may return rows out of order; `index` restores input order.
    let mut data = response.data;
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

/// [`ModelLoader`] that connects to the endpoint and measures its dimensionality.
pub struct OpenAiEmbeddingLoader {
    settings: RemoteModelSettings,
}

impl OpenAiEmbeddingLoader {
    /// Loader for the endpoint in `settings`; nothing is contacted until
    /// [`load`](ModelLoader::load).
    pub fn new(settings: RemoteModelSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ModelLoader for OpenAiEmbeddingLoader {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>> {
        let client = reqwest::Client::new();
        let sample = request_embeddings(&client, &self.settings, &[SAMPLE_TEXT.to_string()]).await?;
        let dimensions = sample
            .first()
            .map(Vec::len)
            .filter(|d| *d > 0)
            .ok_or_else(|| RagError::embedding(PROVIDER, "sample request returned no embedding"))?;

        Ok(Arc::new(OpenAiEmbeddingModel { client, settings: self.settings.clone(), dimensions }))
    }
}

// ── Answer generator ───────────────────────────────────────────────

/// An [`AnswerGenerator`] backed by an OpenAI-compatible chat-completions endpoint.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::openai::OpenAiGenerator;
///
/// let generator = OpenAiGenerator::new(settings)?;
/// let answer = generator.generate("When do classes start?", &context, &prompt).await?;
/// ```
pub struct OpenAiGenerator {
    client: reqwest::Client,
    settings: RemoteModelSettings,
}

impl OpenAiGenerator {
    /// Create a generator for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] when the API key is empty.
    pub fn new(settings: RemoteModelSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(RagError::ConfigError("LLM API key must not be empty".to_string()));
        }
        Ok(Self { client: reqwest::Client::new(), settings })
    }
}

fn generation_error(message: String) -> RagError {
    RagError::GenerationError { provider: PROVIDER.to_string(), message }
}

#[async_trait]
impl AnswerGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn generate(
        &self,
        question: &str,
        context: &str,
        system_prompt: &str,
    ) -> Result<String> {
        let user = user_prompt(question, context);
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage { role: "system", content: system_prompt });
        }
        messages.push(ChatMessage { role: "user", content: &user });

        let body = ChatRequest { model: &self.settings.model, messages };
        let response: ChatResponse = post_json(
            &self.client,
            &endpoint(&self.settings.base_url, "chat/completions"),
            &self.settings.api_key,
            &body,
            generation_error,
        )
        .await?;

        let answer = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| generation_error("API returned an empty answer".to_string()))?;

        debug!(provider = PROVIDER, answer_len = answer.len(), "answer generated");
        Ok(answer)
    }
}
