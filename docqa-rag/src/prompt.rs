//! File-backed storage for the system prompt.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;

/// Prompt used when no prompt file exists yet.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant that answers questions \
using a knowledge base. Base every answer strictly on the provided context. Do not add \
facts that are not in the context. If the context does not cover the question, say that \
the knowledge base has no information about it. Keep answers short and clear.";

/// The system prompt persisted as one text file.
///
/// Writes replace the whole file atomically (temp file + rename), so readers
/// see either the old prompt or the new one.
#[derive(Debug, Clone)]
pub struct PromptStore {
    path: PathBuf,
}

impl PromptStore {
    /// A store backed by the file at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the prompt file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the prompt, falling back to [`DEFAULT_SYSTEM_PROMPT`] when the file
    /// is missing or empty.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Io`](crate::RagError::Io) for read failures other
    /// than a missing file.
    pub async fn load(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(prompt) if !prompt.trim().is_empty() => Ok(prompt),
            Ok(_) => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(DEFAULT_SYSTEM_PROMPT.to_string())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read prompt file");
                Err(e.into())
            }
        }
    }

    /// Replace the stored prompt.
    pub async fn save(&self, prompt: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, prompt).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), chars = prompt.chars().count(), "system prompt updated");
        Ok(())
    }
}
