//! Core data models used throughout grepctl.
//!
//! These types represent the documents, corpus entries, queries, and search
//! results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A document as produced by the external extraction stage.
///
/// `text_content` is `None` when extraction failed or the modality is
/// unsupported; such documents are excluded from chunking and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub uri: String,
    pub modality: String,
    pub source: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::json!({})
}

/// Character span of a chunk within its parent document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub index: i64,
    /// Inclusive start offset, in chars.
    pub start: i64,
    /// Exclusive end offset, in chars.
    pub end: i64,
}

/// The unit indexed for search: either one window of a long document or a
/// whole short document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    /// `doc_id` for a short document, `doc_id:index` for a chunk.
    pub id: String,
    pub doc_id: String,
    pub uri: String,
    pub modality: String,
    pub source: String,
    pub created_at: i64,
    /// `None` when the entry is the whole document.
    pub span: Option<ChunkSpan>,
    pub text: String,
    /// SHA-256 hex digest of `text`.
    pub content_hash: String,
    /// Absent when not yet computed. Never `Some` of an empty vector once
    /// it has passed through [`crate::embedding::normalize`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub embed_attempts: u32,
    pub embedded_at: Option<i64>,
}

impl CorpusEntry {
    pub fn chunk_index(&self) -> Option<i64> {
        self.span.map(|s| s.index)
    }

    pub fn is_pending(&self) -> bool {
        crate::embedding::is_pending(self.embedding.as_deref())
    }

    /// Copy of the entry without its vector, for result payloads.
    pub fn without_embedding(&self) -> CorpusEntry {
        CorpusEntry {
            embedding: None,
            ..self.clone()
        }
    }
}

/// Structured predicates applied after retrieval. All optional, conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Allowed source tags. Empty means no source filtering.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Inclusive lower bound on `created_at` (Unix seconds).
    #[serde(default)]
    pub start_ts: Option<i64>,
    /// Inclusive upper bound on `created_at` (Unix seconds).
    #[serde(default)]
    pub end_ts: Option<i64>,
    /// Full-match pattern, case-insensitive unless the pattern sets flags.
    #[serde(default)]
    pub regex: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
            && self.start_ts.is_none()
            && self.end_ts.is_none()
            && self.regex.is_none()
    }
}

/// A single search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub rerank: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            filters: SearchFilters::default(),
            rerank: false,
        }
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub entry: CorpusEntry,
    /// Cosine distance to the query vector (lower is closer).
    pub distance: f64,
    /// LLM-judged relevance in `[0, 1]`; `None` when not reranked or when
    /// scoring failed for this entry.
    pub relevance_score: Option<f64>,
    /// 1-based final position.
    pub rank: usize,
}
