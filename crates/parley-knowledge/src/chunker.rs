//! Document chunking.
//!
//! Splits normalized text into windows of at most `size` characters with
//! `overlap` characters of trailing overlap.  When a window does not end the
//! text, the break prefers the last sentence terminator (`.`, `!`, `?`, or a
//! paragraph break) provided it falls past the window midpoint; otherwise
//! the window breaks at `size`.
//!
//! Normalization strips ASCII control characters other than newline and
//! collapses whitespace runs: runs containing two or more newlines become a
//! paragraph break (`\n\n`), runs with one newline become `\n`, everything
//! else a single space.  Paragraph breaks must survive normalization or the
//! `\n\n` terminator could never fire.
//!
//! Output is deterministic for a given `(text, size, overlap)`.

use serde_json::Value;

use crate::error::{KnowledgeError, Result};

/// One bounded window of a document.
///
/// `start_char` / `end_char` index into the *normalized* text, in characters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub metadata: Value,
}

/// Sentence-preferring overlapping chunker.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    /// Default chunk size in characters.
    pub const DEFAULT_SIZE: usize = 500;
    /// Default trailing overlap in characters.
    pub const DEFAULT_OVERLAP: usize = 50;

    /// Create a chunker.  `overlap` must be smaller than `size / 2` so that
    /// every window makes forward progress even after a midpoint break.
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(KnowledgeError::InvalidChunking {
                reason: "chunk size must be positive".to_owned(),
            });
        }
        if overlap >= size / 2 {
            return Err(KnowledgeError::InvalidChunking {
                reason: format!("overlap {overlap} must be below half the chunk size {size}"),
            });
        }
        Ok(Self { size, overlap })
    }

    /// Split `text` into chunks, attaching `metadata` to each.
    pub fn chunk(&self, text: &str, metadata: &Value) -> Vec<Chunk> {
        let normalized = normalize(text);
        let chars: Vec<char> = normalized.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let hard_end = (start + self.size).min(chars.len());
            let mut end = hard_end;

            if hard_end < chars.len() {
                if let Some(boundary) = last_terminator(&chars[start..hard_end]) {
                    if boundary > self.size / 2 {
                        end = start + boundary;
                    }
                }
            }

            let text: String = chars[start..end].iter().collect();
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                chunks.push(Chunk {
                    text: trimmed.to_owned(),
                    start_char: start,
                    end_char: end,
                    metadata: metadata.clone(),
                });
            }

            if end >= chars.len() {
                break;
            }
            start = end.saturating_sub(self.overlap);
        }

        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            size: Self::DEFAULT_SIZE,
            overlap: Self::DEFAULT_OVERLAP,
        }
    }
}

/// Offset just past the last sentence terminator in `window`, if any.
fn last_terminator(window: &[char]) -> Option<usize> {
    let mut best = None;
    for (i, c) in window.iter().enumerate() {
        match c {
            '.' | '!' | '?' => best = Some(i + 1),
            '\n' if window.get(i + 1) == Some(&'\n') => best = Some(i + 2),
            _ => {}
        }
    }
    best
}

/// Strip control characters and collapse whitespace runs.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run_newlines = 0usize;
    let mut in_run = false;

    for c in text.chars() {
        if c.is_whitespace() {
            in_run = true;
            if c == '\n' {
                run_newlines += 1;
            }
            continue;
        }
        if c.is_control() {
            continue;
        }
        if in_run {
            if !out.is_empty() {
                match run_newlines {
                    0 => out.push(' '),
                    1 => out.push('\n'),
                    _ => out.push_str("\n\n"),
                }
            }
            in_run = false;
            run_newlines = 0;
        }
        out.push(c);
    }
    out
}
