//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! All tables live behind one `std::sync::RwLock`, so every trait method is
//! atomic with respect to the others. Entries are kept in a `BTreeMap` to
//! give id-ordered scans for free.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::normalize;
use crate::models::{CorpusEntry, Document};
use crate::retrieval::{IndexMeta, IndexSnapshot};

use super::{CorpusStats, RepairReport, ReplaceOutcome, SourceHealth, Store, ValidationReport};

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Document>,
    entries: BTreeMap<String, CorpusEntry>,
    cache: HashMap<String, Vec<f32>>,
    meta: IndexMeta,
    snapshot: Option<IndexSnapshot>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an entry's stored vector without any normalization, the
    /// way a foreign writer might.
    pub fn write_raw_embedding(&self, entry_id: &str, vector: Vec<f32>) -> bool {
        let mut t = self.tables.write().unwrap();
        match t.entries.get_mut(entry_id) {
            Some(e) => {
                e.embedding = Some(vector);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        t.documents.insert(doc.doc_id.clone(), doc.clone());
        Ok(())
    }

    async fn replace_entries(
        &self,
        doc_id: &str,
        entries: &[CorpusEntry],
    ) -> Result<ReplaceOutcome> {
        let mut t = self.tables.write().unwrap();
        let mut outcome = ReplaceOutcome::default();

        let keep: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let stale: Vec<String> = t
            .entries
            .values()
            .filter(|e| e.doc_id == doc_id && !keep.contains(e.id.as_str()))
            .map(|e| e.id.clone())
            .collect();
        for id in stale {
            t.entries.remove(&id);
            outcome.removed += 1;
        }

        for incoming in entries {
            match t.entries.get_mut(&incoming.id) {
                Some(existing) if existing.content_hash == incoming.content_hash => {
                    // Same content: refresh descriptive fields, keep the vector.
                    existing.uri = incoming.uri.clone();
                    existing.modality = incoming.modality.clone();
                    existing.source = incoming.source.clone();
                    existing.created_at = incoming.created_at;
                    existing.span = incoming.span;
                    outcome.unchanged += 1;
                }
                Some(existing) => {
                    *existing = CorpusEntry {
                        embedding: None,
                        embed_attempts: 0,
                        embedded_at: None,
                        ..incoming.clone()
                    };
                    outcome.updated += 1;
                }
                None => {
                    let fresh = CorpusEntry {
                        embedding: normalize(incoming.embedding.clone()),
                        embed_attempts: 0,
                        ..incoming.clone()
                    };
                    t.entries.insert(incoming.id.clone(), fresh);
                    outcome.created += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn pending_entries(
        &self,
        limit: Option<usize>,
        max_attempts: u32,
    ) -> Result<Vec<CorpusEntry>> {
        let t = self.tables.read().unwrap();
        let mut pending: Vec<CorpusEntry> = t
            .entries
            .values()
            .filter(|e| e.is_pending() && e.embed_attempts < max_attempts)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.embed_attempts
                .cmp(&b.embed_attempts)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(n) = limit {
            pending.truncate(n);
        }
        Ok(pending)
    }

    async fn cached_embeddings(&self, hashes: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        let t = self.tables.read().unwrap();
        Ok(hashes
            .iter()
            .filter_map(|h| {
                t.cache
                    .get(h)
                    .filter(|v| !v.is_empty())
                    .map(|v| (h.clone(), v.clone()))
            })
            .collect())
    }

    async fn set_embedding(
        &self,
        entry_id: &str,
        content_hash: &str,
        vector: &[f32],
        _model: &str,
    ) -> Result<bool> {
        let Some(vector) = normalize(Some(vector.to_vec())) else {
            return Ok(false);
        };
        let mut t = self.tables.write().unwrap();
        let written = match t.entries.get_mut(entry_id) {
            Some(e) if e.content_hash == content_hash => {
                e.embedding = Some(vector.clone());
                e.embedded_at = Some(chrono::Utc::now().timestamp());
                true
            }
            _ => false,
        };
        if written {
            t.cache.insert(content_hash.to_string(), vector);
        }
        Ok(written)
    }

    async fn record_embed_failure(&self, entry_ids: &[String]) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        for id in entry_ids {
            if let Some(e) = t.entries.get_mut(id) {
                e.embed_attempts += 1;
            }
        }
        Ok(())
    }

    async fn embedded_entries(&self) -> Result<Vec<CorpusEntry>> {
        let t = self.tables.read().unwrap();
        Ok(t.entries
            .values()
            .filter(|e| !e.is_pending())
            .cloned()
            .collect())
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<CorpusEntry>> {
        let t = self.tables.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| t.entries.get(id).cloned())
            .collect())
    }

    async fn count_embedded(&self) -> Result<usize> {
        let t = self.tables.read().unwrap();
        Ok(t.entries.values().filter(|e| !e.is_pending()).count())
    }

    async fn corpus_stats(&self, max_attempts: u32) -> Result<CorpusStats> {
        let t = self.tables.read().unwrap();
        let mut stats = CorpusStats {
            documents: t.documents.len(),
            entries: t.entries.len(),
            ..Default::default()
        };
        for e in t.entries.values() {
            if !e.is_pending() {
                stats.embedded += 1;
            } else if e.embed_attempts < max_attempts {
                stats.pending += 1;
            } else {
                stats.parked += 1;
            }
        }
        Ok(stats)
    }

    async fn embedding_health(&self, dims: usize) -> Result<Vec<SourceHealth>> {
        let t = self.tables.read().unwrap();
        let mut by_source: BTreeMap<&str, SourceHealth> = BTreeMap::new();
        for e in t.entries.values() {
            let h = by_source
                .entry(e.source.as_str())
                .or_insert_with(|| SourceHealth {
                    source: e.source.clone(),
                    ..Default::default()
                });
            h.total += 1;
            match e.embedding.as_deref() {
                None => h.null += 1,
                Some([]) => h.empty += 1,
                Some(v) if v.len() == dims => h.valid += 1,
                Some(_) => h.wrong_dims += 1,
            }
        }
        Ok(by_source.into_values().collect())
    }

    async fn repair_embeddings(&self, modality: Option<&str>) -> Result<RepairReport> {
        let mut t = self.tables.write().unwrap();
        let mut report = RepairReport::default();
        for e in t.entries.values_mut() {
            if modality.is_some_and(|m| m != e.modality) {
                continue;
            }
            if matches!(e.embedding.as_deref(), Some([])) {
                e.embedding = None;
                report.emptied_to_null += 1;
            }
            if e.embedding.is_none() && e.embed_attempts > 0 {
                e.embed_attempts = 0;
                report.attempts_reset += 1;
            }
        }
        Ok(report)
    }

    async fn validate_documents(&self) -> Result<ValidationReport> {
        let t = self.tables.read().unwrap();
        let mut by_uri: BTreeMap<&str, usize> = BTreeMap::new();
        let mut without_text = 0;
        for d in t.documents.values() {
            *by_uri.entry(d.uri.as_str()).or_default() += 1;
            if d.text_content.as_deref().map_or(true, str::is_empty) {
                without_text += 1;
            }
        }
        Ok(ValidationReport {
            documents: t.documents.len(),
            duplicate_uris: by_uri
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|(u, n)| (u.to_string(), n))
                .collect(),
            documents_without_text: without_text,
        })
    }

    async fn load_index_meta(&self) -> Result<IndexMeta> {
        Ok(self.tables.read().unwrap().meta.clone())
    }

    async fn save_index_meta(&self, meta: &IndexMeta) -> Result<()> {
        self.tables.write().unwrap().meta = meta.clone();
        Ok(())
    }

    async fn load_index_snapshot(&self) -> Result<Option<IndexSnapshot>> {
        Ok(self.tables.read().unwrap().snapshot.clone())
    }

    async fn save_index_snapshot(&self, snapshot: &IndexSnapshot) -> Result<()> {
        self.tables.write().unwrap().snapshot = Some(snapshot.clone());
        Ok(())
    }
}
