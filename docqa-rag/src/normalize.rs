//! Conversion of source files into normalized plain text.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::{RagError, Result};

/// Converts a document on disk into the text the chunker works on.
#[async_trait]
pub trait DocumentNormalizer: Send + Sync {
    /// Read `path` and return its normalized text.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConversionError`] for unsupported formats or
    /// unreadable files.
    async fn normalize(&self, path: &Path) -> Result<String>;
}

/// Extensions read verbatim as UTF-8 text.
const PLAIN_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "csv", "log", "json"];

/// Extensions whose markup is stripped before use.
const HTML_EXTENSIONS: &[&str] = &["html", "htm"];

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)\s*>").expect("valid regex")
});
static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|tr|h[1-6]|section|article|ul|ol|table)[^>]*>")
        .expect("valid regex")
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static SPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));

/// File-extension based normalizer for text-like formats.
///
/// Plain formats are read as UTF-8. HTML has scripts, styles and tags removed
/// and the common entities decoded. In every case line endings become `\n`,
/// trailing whitespace is trimmed from each line and runs of blank lines are
/// collapsed to one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    /// Create a new `TextNormalizer`.
    pub fn new() -> Self {
        Self
    }

    /// Normalize text that is already in memory.
    pub fn normalize_text(raw: &str) -> String {
        let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
        let trimmed_lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
        let joined = trimmed_lines.join("\n");
        BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
    }

    /// Reduce an HTML page to its visible text.
    pub fn strip_html(html: &str) -> String {
        let without_code = SCRIPT_OR_STYLE.replace_all(html, "");
        let with_breaks = BLOCK_TAG.replace_all(&without_code, "\n");
        let without_tags = ANY_TAG.replace_all(&with_breaks, "");
        let decoded = without_tags
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&");
        SPACE_RUNS.replace_all(&decoded, " ").into_owned()
    }
}

fn conversion_error(path: &Path, message: impl Into<String>) -> RagError {
    RagError::ConversionError { path: path.display().to_string(), message: message.into() }
}

#[async_trait]
impl DocumentNormalizer for TextNormalizer {
    async fn normalize(&self, path: &Path) -> Result<String> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| conversion_error(path, "file has no extension"))?;

        let is_html = HTML_EXTENSIONS.contains(&extension.as_str());
        if !is_html && !PLAIN_EXTENSIONS.contains(&extension.as_str()) {
            return Err(conversion_error(path, format!("unsupported format '.{extension}'")));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| conversion_error(path, format!("failed to read file: {e}")))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| conversion_error(path, "file is not valid UTF-8"))?;

        let text = if is_html { Self::strip_html(&raw) } else { raw };
        let normalized = Self::normalize_text(&text);
        debug!(path = %path.display(), chars = normalized.chars().count(), "normalized document");
        Ok(normalized)
    }
}

/// The stable identifier of a document: its file name.
pub fn source_id_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_blank_lines_and_crlf() {
        let raw = "Title\r\n\r\n\r\n\r\nBody   \r\nmore\n";
        assert_eq!(TextNormalizer::normalize_text(raw), "Title\n\nBody\nmore");
    }

    #[test]
    fn strips_html_markup() {
        let html = "<html><head><style>p{}</style><script>var x=1;</script></head>\
                    <body><h1>Prices</h1><p>Tom &amp; Jerry&nbsp;club</p></body></html>";
        let text = TextNormalizer::normalize_text(&TextNormalizer::strip_html(html));
        assert_eq!(text, "Prices\n\nTom & Jerry club");
    }

    #[test]
    fn source_id_is_file_name() {
        assert_eq!(source_id_for(Path::new("/uploads/faq.md")), "faq.md");
    }

    #[tokio::test]
    async fn unsupported_extension_is_conversion_error() {
        let err = TextNormalizer::new().normalize(Path::new("slides.pptx")).await.unwrap_err();
        assert!(matches!(err, RagError::ConversionError { .. }));
    }

    #[tokio::test]
    async fn reads_markdown_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        tokio::fs::write(&path, "# Notes\n\n\n\nline  \n").await.unwrap();
        let text = TextNormalizer::new().normalize(&path).await.unwrap();
        assert_eq!(text, "# Notes\n\nline");
    }
}
