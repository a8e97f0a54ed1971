//! Storage abstraction for grepctl.
//!
//! The [`Store`] trait is the table of [`CorpusEntry`] records plus the
//! small amount of index bookkeeping the pipeline needs. The ingestion and
//! query pipelines only talk to storage through this trait, so SQLite, the
//! in-memory store, and anything else are interchangeable.
//!
//! Every implementation must treat a null embedding and a zero-length
//! embedding as the same "pending" state, in every query that asks.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{CorpusEntry, Document};
use crate::retrieval::{IndexMeta, IndexSnapshot};

/// What [`Store::replace_entries`] did to a document's entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    /// Ids that did not exist before.
    pub created: usize,
    /// Existing ids whose content hash changed; their embedding was cleared.
    pub updated: usize,
    /// Existing ids with identical content; their embedding was kept.
    pub unchanged: usize,
    /// Ids of this document that are no longer produced by the chunker.
    pub removed: usize,
}

/// Corpus-wide counts, used by `status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorpusStats {
    pub documents: usize,
    pub entries: usize,
    pub embedded: usize,
    /// Pending and still eligible for backfill.
    pub pending: usize,
    /// Pending but at or over the retry limit.
    pub parked: usize,
}

/// Embedding health for one source tag.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceHealth {
    pub source: String,
    pub total: usize,
    /// Present and of the expected dimensionality.
    pub valid: usize,
    pub null: usize,
    /// Stored as a zero-length array. Pending, same as `null`.
    pub empty: usize,
    /// Present but of some other dimensionality.
    pub wrong_dims: usize,
}

/// Result of [`Store::repair_embeddings`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    /// Zero-length vectors rewritten as null.
    pub emptied_to_null: usize,
    /// Entries whose retry counter was reset.
    pub attempts_reset: usize,
}

/// Result of [`Store::validate_documents`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub documents: usize,
    /// URIs stored under more than one document id, with their count.
    pub duplicate_uris: Vec<(String, usize)>,
    pub documents_without_text: usize,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document |
/// | [`replace_entries`](Store::replace_entries) | Idempotently upsert a document's entries |
/// | [`pending_entries`](Store::pending_entries) | Entries lacking a vector |
/// | [`cached_embeddings`](Store::cached_embeddings) | Previously computed vectors by content hash |
/// | [`set_embedding`](Store::set_embedding) | Atomically attach a vector to one entry |
/// | [`record_embed_failure`](Store::record_embed_failure) | Bump retry counters |
/// | [`embedded_entries`](Store::embedded_entries) | All entries with a vector |
/// | [`get_entries`](Store::get_entries) | Entries by id |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a document record (including documents without text).
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    /// Replace the entries of `doc_id` with `entries`, atomically.
    ///
    /// An entry whose id exists with the same `content_hash` keeps its
    /// embedding and retry counter. A changed entry is reset to pending.
    /// Entries of `doc_id` missing from `entries` are deleted.
    async fn replace_entries(&self, doc_id: &str, entries: &[CorpusEntry])
        -> Result<ReplaceOutcome>;

    /// Entries whose embedding is null or zero-length and whose retry
    /// counter is below `max_attempts`, fewest attempts first, then by id.
    async fn pending_entries(
        &self,
        limit: Option<usize>,
        max_attempts: u32,
    ) -> Result<Vec<CorpusEntry>>;

    /// Look up vectors computed earlier for any of `hashes`.
    ///
    /// Never returns an empty vector.
    async fn cached_embeddings(&self, hashes: &[String]) -> Result<HashMap<String, Vec<f32>>>;

    /// Attach `vector` to `entry_id` and remember it under `content_hash`.
    ///
    /// The write only happens if the entry still has `content_hash`;
    /// returns `false` when the entry changed or vanished in the meantime.
    /// Callers must have validated the dimensionality.
    async fn set_embedding(
        &self,
        entry_id: &str,
        content_hash: &str,
        vector: &[f32],
        model: &str,
    ) -> Result<bool>;

    /// Increment the retry counter of each entry.
    async fn record_embed_failure(&self, entry_ids: &[String]) -> Result<()>;

    /// All entries with a non-empty embedding, ordered by id.
    async fn embedded_entries(&self) -> Result<Vec<CorpusEntry>>;

    /// Entries by id. Missing ids are skipped; order is unspecified.
    async fn get_entries(&self, ids: &[String]) -> Result<Vec<CorpusEntry>>;

    /// Number of entries with a non-empty embedding.
    async fn count_embedded(&self) -> Result<usize>;

    async fn corpus_stats(&self, max_attempts: u32) -> Result<CorpusStats>;

    /// Per-source breakdown of vector presence and dimensionality.
    async fn embedding_health(&self, dims: usize) -> Result<Vec<SourceHealth>>;

    /// Rewrite zero-length vectors as null and reset retry counters of
    /// pending entries, optionally only those of one modality.
    async fn repair_embeddings(&self, modality: Option<&str>) -> Result<RepairReport>;

    async fn validate_documents(&self) -> Result<ValidationReport>;

    async fn load_index_meta(&self) -> Result<IndexMeta>;

    async fn save_index_meta(&self, meta: &IndexMeta) -> Result<()>;

    async fn load_index_snapshot(&self) -> Result<Option<IndexSnapshot>>;

    async fn save_index_snapshot(&self, snapshot: &IndexSnapshot) -> Result<()>;
}
