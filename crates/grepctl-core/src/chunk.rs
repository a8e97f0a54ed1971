//! Sliding-window text chunker.
//!
//! Turns a [`Document`] into the [`CorpusEntry`] values that get indexed.
//! Short documents become a single entry whose id is the document id; long
//! documents are cut into fixed-size, overlapping windows with recorded
//! character offsets.
//!
//! Each entry id is derived from `(doc_id, index)` and each entry carries a
//! SHA-256 hash of its text, so re-chunking identical input is idempotent
//! and unchanged entries keep their embeddings.
//!
//! # Algorithm
//!
//! 1. Count the text length in chars (not bytes).
//! 2. If `len == 0`, produce nothing.
//! 3. If `len <= short_threshold`, produce one entry covering the document.
//! 4. Otherwise emit windows `[start, min(start + window, len))` for
//!    `start = 0, stride, 2 * stride, …` while `start < len`.
//!
//! # Example
//!
//! ```rust
//! use grepctl_core::chunk::{chunk_document, ChunkPolicy};
//! use grepctl_core::models::Document;
//!
//! let doc = Document {
//!     doc_id: "doc-1".into(),
//!     uri: "gs://bucket/a.txt".into(),
//!     modality: "text".into(),
//!     source: "file".into(),
//!     created_at: 0,
//!     text_content: Some("a".repeat(2500)),
//!     mime_type: None,
//!     metadata: serde_json::json!({}),
//! };
//! let entries: Vec<_> = chunk_document(&doc, &ChunkPolicy::default()).collect();
//! assert_eq!(entries.len(), 3);
//! assert_eq!(entries[2].id, "doc-1:2");
//! ```

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::models::{ChunkSpan, CorpusEntry, Document};

/// Window sizes for the chunker, in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Texts at or below this length are kept whole.
    pub short_threshold: usize,
    pub window: usize,
    pub stride: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            short_threshold: 2000,
            window: 1200,
            stride: 1000,
        }
    }
}

impl ChunkPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            bail!("chunking.window must be > 0");
        }
        if self.stride == 0 || self.stride > self.window {
            bail!(
                "chunking.stride must be in 1..={} (got {})",
                self.window,
                self.stride
            );
        }
        Ok(())
    }
}

/// Chunk a document into corpus entries.
///
/// Returns a lazy iterator. It is `Clone`, so the sequence can be restarted
/// and replays identical ids and boundaries.
pub fn chunk_document<'a>(doc: &'a Document, policy: &ChunkPolicy) -> Chunks<'a> {
    let text = doc.text_content.as_deref().unwrap_or("");
    let len = text.chars().count();
    Chunks {
        doc,
        text,
        len,
        policy: *policy,
        next_start: 0,
        next_byte: 0,
        index: 0,
        done: len == 0,
    }
}

/// Iterator over the entries of one document. See [`chunk_document`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    doc: &'a Document,
    text: &'a str,
    len: usize,
    policy: ChunkPolicy,
    /// Char offset of the next window.
    next_start: usize,
    /// Byte offset matching `next_start`.
    next_byte: usize,
    index: i64,
    done: bool,
}

impl Chunks<'_> {
    /// Whether this document is emitted as a single un-windowed entry.
    pub fn is_whole(&self) -> bool {
        self.len <= self.policy.short_threshold
    }
}

impl Iterator for Chunks<'_> {
    type Item = CorpusEntry;

    fn next(&mut self) -> Option<CorpusEntry> {
        if self.done {
            return None;
        }

        if self.is_whole() {
            self.done = true;
            return Some(make_entry(self.doc, self.doc.doc_id.clone(), None, self.text));
        }

        if self.next_start >= self.len {
            self.done = true;
            return None;
        }

        let start = self.next_start;
        let end = (start + self.policy.window).min(self.len);
        let rest = &self.text[self.next_byte..];
        let end_byte = self.next_byte + byte_offset(rest, end - start);
        let piece = &self.text[self.next_byte..end_byte];

        let span = ChunkSpan {
            index: self.index,
            start: start as i64,
            end: end as i64,
        };
        let id = format!("{}:{}", self.doc.doc_id, self.index);
        let entry = make_entry(self.doc, id, Some(span), piece);

        self.next_byte += byte_offset(rest, self.policy.stride);
        self.next_start += self.policy.stride;
        self.index += 1;

        Some(entry)
    }
}

/// Byte offset of the `chars`-th char of `s`, or `s.len()` past the end.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// SHA-256 hex digest of an entry's text; the dedup key for embeddings.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_entry(doc: &Document, id: String, span: Option<ChunkSpan>, text: &str) -> CorpusEntry {
    CorpusEntry {
        id,
        doc_id: doc.doc_id.clone(),
        uri: doc.uri.clone(),
        modality: doc.modality.clone(),
        source: doc.source.clone(),
        created_at: doc.created_at,
        span,
        text: text.to_string(),
        content_hash: content_hash(text),
        embedding: None,
        embed_attempts: 0,
        embedded_at: None,
    }
}
