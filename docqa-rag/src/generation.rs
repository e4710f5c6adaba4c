//! The answer-generation capability consumed by the service.

use async_trait::async_trait;

use crate::error::Result;

/// Turns a question plus retrieved context into a final answer.
///
/// Treated as an opaque, fallible, network-bound capability. Callers bound it
/// with a timeout and fall back to the raw context on failure.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Short generator name used in logs and errors.
    fn name(&self) -> &str;

    /// Generate an answer to `question` grounded in `context`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::GenerationError`](crate::RagError::GenerationError)
    /// when the provider fails.
    async fn generate(&self, question: &str, context: &str, system_prompt: &str)
    -> Result<String>;
}

/// Build the user turn sent alongside the system prompt.
pub fn user_prompt(question: &str, context: &str) -> String {
    format!(
        "CONTEXT:\n{context}\n\n\
         QUESTION:\n\"{question}\"\n\n\
         INSTRUCTIONS:\n\
         1. Use only the facts in the context above.\n\
         2. Answer the question directly in one or two sentences.\n\
         3. If the context does not contain the answer, say so plainly.\n\n\
         ANSWER:"
    )
}
