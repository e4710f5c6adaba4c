//! Document chunking strategies.
//!
//! This module provides the [`Chunker`] trait and two implementations:
//!
//! - [`FixedSizeChunker`] - sliding window over characters with configurable overlap
//! - [`RecursiveChunker`] - same window, but each cut snaps back to the nearest
//!   paragraph, sentence or word boundary
//!
//! Sizes are counted in Unicode scalar values (`char`s), never bytes, so a
//! chunk boundary can never split a multi-byte character.

use std::sync::Arc;

use crate::config::{ChunkingStrategy, RetrievalConfig};
use crate::document::Chunk;
use crate::error::{RagError, Result};

/// A strategy for splitting normalized text into chunks.
///
/// Implementations are constructed with a validated size/overlap pair, so
/// splitting itself cannot fail.
pub trait Chunker: Send + Sync {
    /// Split `text` into chunks attributed to `source_id`.
    ///
    /// Returns an empty `Vec` if the text is empty. Otherwise every chunk is
    /// non-empty, at most `chunk_size` characters long, shares exactly
    /// `chunk_overlap` characters with its successor, and the chunks together
    /// cover the whole text.
    fn split(&self, source_id: &str, text: &str) -> Vec<Chunk>;
}

/// Build the chunker selected by `config`.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] if the size/overlap pair is invalid.
pub fn chunker_for(config: &RetrievalConfig) -> Result<Arc<dyn Chunker>> {
    Ok(match config.chunking_strategy {
        ChunkingStrategy::Fixed => {
            Arc::new(FixedSizeChunker::new(config.chunk_size, config.chunk_overlap)?)
        }
        ChunkingStrategy::Recursive => {
            Arc::new(RecursiveChunker::new(config.chunk_size, config.chunk_overlap)?)
        }
    })
}

fn validate_window(chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RagError::ConfigError("chunk_size must be greater than zero".to_string()));
    }
    if chunk_overlap >= chunk_size {
        return Err(RagError::ConfigError(format!(
            "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
        )));
    }
    Ok(())
}

/// Splits text into fixed-size chunks by character count with configurable overlap.
///
/// Each chunk carries the `document` and `chunk_id` metadata fields.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::FixedSizeChunker;
///
/// let chunker = FixedSizeChunker::new(200, 20)?;
/// let chunks = chunker.split("handbook.md", &text);
/// ```
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `chunk_size` is zero or
    /// `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        validate_window(chunk_size, chunk_overlap)?;
        Ok(Self { chunk_size, chunk_overlap })
    }
}

impl Chunker for FixedSizeChunker {
    fn split(&self, source_id: &str, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size - self.chunk_overlap;
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(Chunk::new(source_id, chunks.len(), chars[start..end].iter().collect()));
            if end == chars.len() {
                break;
            }
            start += step;
        }

        chunks
    }
}

/// Splits text hierarchically: paragraphs → sentences → words.
///
/// Works like [`FixedSizeChunker`] but, instead of cutting exactly at
/// `chunk_size`, pulls each cut back to the last paragraph break (`\n\n`)
/// inside the window. Failing that it tries a sentence end (`. `, `! `,
/// `? ` or a newline), then any whitespace. Only the back half of the window
/// is searched, so chunks never shrink below half the configured size unless
/// the text ends. The next chunk starts `chunk_overlap` characters before the
/// cut.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::RecursiveChunker;
///
/// let chunker = RecursiveChunker::new(500, 50)?;
/// let chunks = chunker.split("handbook.md", &text);
/// ```
#[derive(Debug, Clone)]
pub struct RecursiveChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveChunker {
    /// Create a new `RecursiveChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `chunk_size` is zero or
    /// `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        validate_window(chunk_size, chunk_overlap)?;
        Ok(Self { chunk_size, chunk_overlap })
    }

    /// Pick the cut position for a window starting at `start`.
    fn cut(&self, chars: &[char], start: usize) -> usize {
        let hard_end = (start + self.chunk_size).min(chars.len());
        if hard_end == chars.len() {
            return hard_end;
        }

        // The cut must leave more than `chunk_overlap` chars so the next window advances.
        let lowest = start + (self.chunk_overlap + 1).max(self.chunk_size / 2);
        if lowest >= hard_end {
            return hard_end;
        }

        let boundaries: [fn(&[char], usize) -> bool; 3] =
            [is_paragraph_break, is_sentence_end, is_word_break];
        for boundary in boundaries {
            if let Some(pos) = (lowest..=hard_end).rev().find(|&pos| boundary(chars, pos)) {
                return pos;
            }
        }
        hard_end
    }
}

/// `pos` directly follows a blank line.
fn is_paragraph_break(chars: &[char], pos: usize) -> bool {
    pos >= 2 && chars[pos - 1] == '\n' && chars[pos - 2] == '\n'
}

/// `pos` directly follows sentence punctuation plus whitespace, or a newline.
fn is_sentence_end(chars: &[char], pos: usize) -> bool {
    if pos >= 1 && chars[pos - 1] == '\n' {
        return true;
    }
    pos >= 2 && chars[pos - 1].is_whitespace() && matches!(chars[pos - 2], '.' | '!' | '?')
}

/// `pos` directly follows whitespace.
fn is_word_break(chars: &[char], pos: usize) -> bool {
    pos >= 1 && chars[pos - 1].is_whitespace()
}

impl Chunker for RecursiveChunker {
    fn split(&self, source_id: &str, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let end = self.cut(&chars, start);
            chunks.push(Chunk::new(source_id, chunks.len(), chars[start..end].iter().collect()));
            if end == chars.len() {
                break;
            }
            start = end - self.chunk_overlap;
        }

        chunks
    }
}
