//! Search orchestrator: the ingestion and query pipelines.
//!
//! [`SearchEngine`] owns nothing but handles: a [`Store`], an optional
//! [`Embedder`], an optional [`Scorer`], and the live [`IndexSlot`]. All
//! durable state is in the store, so several engines may share one.
//!
//! # Ingestion
//!
//! 1. Chunk each document and replace its entries (per-document errors are
//!    counted, never fatal).
//! 2. Backfill pending entries.
//! 3. If the corpus is at or over the approximate threshold and the index
//!    is absent or stale, rebuild it.
//!
//! # Query
//!
//! 1. Validate the request and compile filters ([`QueryError`] on failure).
//! 2. Embed the query with the corpus provider.
//! 3. Retrieve [`candidate_budget`] candidates, exact or approximate.
//! 4. Filter, then rerank when requested.
//! 5. Truncate to `top_k` and assign 1-based ranks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backfill::{self, BackfillOptions, BackfillReport};
use crate::chunk::{chunk_document, ChunkPolicy};
use crate::embedding::{checked_vector, Embedder};
use crate::error::QueryError;
use crate::filter::CompiledFilters;
use crate::models::{CorpusEntry, Document, SearchQuery, SearchResult};
use crate::rerank::{self, RerankOptions, Scored, Scorer};
use crate::retrieval::ivf::{default_nlist, DEFAULT_ITERATIONS};
use crate::retrieval::{
    candidate_budget, retrieve, select_mode, IndexMeta, IndexSlot, IndexState, IvfIndex,
    RetrievalParams,
};
use crate::store::{
    CorpusStats, RepairReport, ReplaceOutcome, SourceHealth, Store, ValidationReport,
};

/// Approximate index build policy.
#[derive(Debug, Clone)]
pub struct IndexParams {
    /// Fewest vectors worth training on.
    pub min_train_size: usize,
    /// Fixed list count; `None` picks `sqrt(n)`.
    pub nlist: Option<usize>,
    pub iterations: usize,
    /// Fraction of the build size that may be embedded before the index is stale.
    pub stale_fraction: f64,
    /// Rebuild automatically at the end of ingestion.
    pub auto_rebuild: bool,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            min_train_size: 5000,
            nlist: None,
            iterations: DEFAULT_ITERATIONS,
            stale_fraction: 0.2,
            auto_rebuild: true,
        }
    }
}

/// Everything the engine needs to know from the application config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunking: ChunkPolicy,
    pub backfill: BackfillOptions,
    pub retrieval: RetrievalParams,
    pub index: IndexParams,
    pub rerank: RerankOptions,
    /// Deadline for embedding one query.
    pub query_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkPolicy::default(),
            backfill: BackfillOptions::default(),
            retrieval: RetrievalParams::default(),
            index: IndexParams::default(),
            rerank: RerankOptions::default(),
            query_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    /// Stored, but without text to chunk.
    pub skipped_no_text: usize,
    pub failed_documents: usize,
    pub entries_created: usize,
    pub entries_updated: usize,
    pub entries_unchanged: usize,
    pub entries_removed: usize,
    pub backfill: BackfillReport,
    pub index_state: Option<IndexState>,
}

impl IngestReport {
    pub fn embeddings_backfilled(&self) -> usize {
        self.backfill.written()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    /// Mode that actually served the request.
    pub mode: &'static str,
    pub candidates_requested: usize,
    pub candidates_fetched: usize,
    pub candidates_after_filter: usize,
    pub reranked: bool,
    pub rerank_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub stats: SearchStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub corpus: CorpusStats,
    pub index: IndexMeta,
    /// Whether an approximate index is loaded in this process.
    pub index_loaded: bool,
    pub approximate_threshold: usize,
}

pub struct SearchEngine {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    scorer: Option<Arc<dyn Scorer>>,
    config: EngineConfig,
    slot: IndexSlot,
    /// Serializes read-modify-write cycles on the persisted index meta.
    meta_lock: Mutex<()>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn Embedder>>,
        scorer: Option<Arc<dyn Scorer>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            scorer,
            config,
            slot: IndexSlot::new(),
            meta_lock: Mutex::new(()),
        }
    }

    /// Create an engine and load any persisted index into it.
    ///
    /// A build interrupted by a crash is rolled back to the last usable
    /// state first.
    pub async fn open(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn Embedder>>,
        scorer: Option<Arc<dyn Scorer>>,
        config: EngineConfig,
    ) -> Result<Self> {
        let engine = Self::new(store, embedder, scorer, config);
        engine.hydrate().await?;
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn has_scorer(&self) -> bool {
        self.scorer.is_some()
    }

    fn embedder(&self) -> Result<&Arc<dyn Embedder>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| anyhow!("Embedding provider is disabled. Set [embedding] provider in config."))
    }

    async fn hydrate(&self) -> Result<()> {
        let _meta = self.meta_lock.lock().await;
        let mut meta = self.store.load_index_meta().await?;
        let snapshot = self.store.load_index_snapshot().await?;

        let before = meta.state;
        meta.recover(snapshot.is_some());
        if meta.state != before {
            info!(from = before.as_str(), to = meta.state.as_str(), "recovered interrupted index build");
            self.store.save_index_meta(&meta).await?;
        }

        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        if !matches!(meta.state, IndexState::Ready | IndexState::Stale) {
            return Ok(());
        }

        let vectors = indexable(self.store.embedded_entries().await?, snapshot.dims);
        if vectors.is_empty() {
            return Ok(());
        }
        let built = tokio::task::spawn_blocking(move || IvfIndex::from_snapshot(&snapshot, vectors))
            .await
            .context("index hydration task panicked")?;
        match built {
            Ok(index) => {
                info!(vectors = index.len(), nlist = index.nlist(), "loaded approximate index");
                self.slot.swap(Some(Arc::new(index)));
            }
            Err(e) => warn!(error = %e, "could not load index snapshot; using exact search"),
        }
        Ok(())
    }

    /// Store documents and their entries without embedding anything.
    pub async fn load(&self, docs: &[Document]) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for doc in docs {
            report.documents += 1;
            match self.load_one(doc).await {
                Ok(Some(outcome)) => {
                    report.entries_created += outcome.created;
                    report.entries_updated += outcome.updated;
                    report.entries_unchanged += outcome.unchanged;
                    report.entries_removed += outcome.removed;
                }
                Ok(None) => report.skipped_no_text += 1,
                Err(e) => {
                    warn!(doc_id = %doc.doc_id, error = %e, "failed to ingest document");
                    report.failed_documents += 1;
                }
            }
        }
        report.index_state = Some(self.store.load_index_meta().await?.state);
        Ok(report)
    }

    async fn load_one(&self, doc: &Document) -> Result<Option<ReplaceOutcome>> {
        if doc.doc_id.trim().is_empty() {
            bail!("document {} has an empty doc_id", doc.uri);
        }
        self.store.upsert_document(doc).await?;

        let entries: Vec<CorpusEntry> = chunk_document(doc, &self.config.chunking).collect();
        let outcome = self.store.replace_entries(&doc.doc_id, &entries).await?;
        if entries.is_empty() {
            debug!(doc_id = %doc.doc_id, "document has no text; not chunked");
            return Ok(None);
        }
        Ok(Some(outcome))
    }

    /// Full ingestion: load, backfill, and rebuild the index when due.
    pub async fn ingest(&self, docs: &[Document]) -> Result<IngestReport> {
        let mut report = self.load(docs).await?;
        report.backfill = self.backfill(None).await?;
        self.maybe_rebuild().await?;
        report.index_state = Some(self.store.load_index_meta().await?.state);
        Ok(report)
    }

    /// Embed pending entries, then record the new vectors against the index.
    pub async fn backfill(&self, limit: Option<usize>) -> Result<BackfillReport> {
        let embedder = self.embedder()?;
        let opts = BackfillOptions {
            limit,
            ..self.config.backfill.clone()
        };
        let report = backfill::backfill(self.store.as_ref(), embedder.as_ref(), &opts).await?;

        if report.written() > 0 {
            let _meta = self.meta_lock.lock().await;
            let mut meta = self.store.load_index_meta().await?;
            let before = meta.state;
            meta.note_embedded(report.written(), self.config.index.stale_fraction);
            if before != meta.state {
                info!(since_build = meta.embedded_since_build, "approximate index is stale");
            }
            self.store.save_index_meta(&meta).await?;
        }
        Ok(report)
    }

    async fn maybe_rebuild(&self) -> Result<()> {
        if !self.config.index.auto_rebuild {
            return Ok(());
        }
        let state = self.store.load_index_meta().await?.state;
        if !matches!(state, IndexState::Absent | IndexState::Stale) {
            return Ok(());
        }
        let embedded = self.store.count_embedded().await?;
        if embedded < self.config.retrieval.approximate_threshold
            || embedded < self.config.index.min_train_size
        {
            return Ok(());
        }
        self.rebuild_index().await?;
        Ok(())
    }

    /// Train a fresh approximate index over every embedded vector.
    ///
    /// Returns immediately with the current meta if another rebuild is
    /// already running. Queries keep using the previous index (or exact
    /// search) until the new one is swapped in.
    pub async fn rebuild_index(&self) -> Result<IndexMeta> {
        let Some(_rebuild) = self.slot.try_begin_rebuild() else {
            info!("index rebuild already in progress");
            return self.store.load_index_meta().await;
        };

        let entries = self.store.embedded_entries().await?;
        let dims = match (&self.embedder, entries.first()) {
            (Some(e), _) => e.dims(),
            (None, Some(first)) => first.embedding.as_ref().map_or(0, Vec::len),
            (None, None) => 0,
        };
        let vectors = indexable(entries, dims);

        if vectors.len() < self.config.index.min_train_size {
            info!(
                vectors = vectors.len(),
                min_train_size = self.config.index.min_train_size,
                "not enough vectors to train an index; exact search only"
            );
            let meta = IndexMeta::default();
            let _meta = self.meta_lock.lock().await;
            self.store.save_index_meta(&meta).await?;
            self.slot.swap(None);
            return Ok(meta);
        }

        let previous = {
            let _meta = self.meta_lock.lock().await;
            let mut meta = self.store.load_index_meta().await?;
            let previous = meta.state;
            meta.state = match previous {
                IndexState::Absent | IndexState::Building => IndexState::Building,
                _ => IndexState::Rebuilding,
            };
            self.store.save_index_meta(&meta).await?;
            previous
        };

        let size = vectors.len();
        let nlist = self.config.index.nlist.unwrap_or_else(|| default_nlist(size));
        let iterations = self.config.index.iterations;
        info!(vectors = size, nlist, "training approximate index");

        let trained = tokio::task::spawn_blocking(move || IvfIndex::train(vectors, nlist, iterations))
            .await
            .map_err(|e| anyhow!("index training task failed: {}", e))
            .and_then(|r| r);

        let index = match trained {
            Ok(index) => index,
            Err(e) => {
                let _meta = self.meta_lock.lock().await;
                let mut meta = self.store.load_index_meta().await?;
                meta.state = match previous {
                    IndexState::Ready | IndexState::Stale | IndexState::Rebuilding => {
                        IndexState::Stale
                    }
                    _ => IndexState::Absent,
                };
                self.store.save_index_meta(&meta).await?;
                return Err(e.context("index rebuild failed"));
            }
        };

        self.store.save_index_snapshot(&index.snapshot()).await?;
        let meta = IndexMeta {
            state: IndexState::Ready,
            built_at: Some(chrono::Utc::now().timestamp()),
            size_at_build: size,
            embedded_since_build: 0,
            dims: Some(index.dims()),
            nlist: index.nlist(),
        };
        {
            let _meta = self.meta_lock.lock().await;
            self.store.save_index_meta(&meta).await?;
        }
        self.slot.swap(Some(Arc::new(index)));
        info!(vectors = size, nlist = meta.nlist, "approximate index ready");
        Ok(meta)
    }

    /// Run one query through the full pipeline.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(QueryError::EmptyQuery.into());
        }
        if query.top_k == 0 {
            return Err(QueryError::InvalidTopK.into());
        }
        let filters = CompiledFilters::compile(&query.filters)?;

        let embedder = self.embedder()?;
        let query_vec = self.embed_query(embedder.as_ref(), text).await?;

        let params = &self.config.retrieval;
        let embedded = self.store.count_embedded().await?;
        let mode = select_mode(embedded, self.slot.current(), query_vec.len(), params);
        let fetch = candidate_budget(query.top_k, params);

        let (candidates, served) =
            retrieve(self.store.as_ref(), &mode, &query_vec, fetch, params.nprobe).await?;
        let fetched = candidates.len();
        let survivors = filters.apply(candidates);
        let after_filter = survivors.len();
        debug!(mode = served, fetch, fetched, after_filter, "retrieved candidates");

        let (ordered, reranked, rerank_failures) = match (&self.scorer, query.rerank) {
            (Some(scorer), true) => {
                let (scored, failures) = rerank::rerank(
                    scorer.as_ref(),
                    text,
                    survivors,
                    query.top_k,
                    &self.config.rerank,
                )
                .await;
                (scored, true, failures)
            }
            (scorer, wants) => {
                if wants && scorer.is_none() {
                    debug!("rerank requested but no scorer is configured");
                }
                let unscored = survivors
                    .into_iter()
                    .map(|candidate| Scored {
                        candidate,
                        relevance_score: None,
                    })
                    .collect();
                (unscored, false, 0)
            }
        };

        let results = ordered
            .into_iter()
            .take(query.top_k)
            .enumerate()
            .map(|(i, s)| SearchResult {
                entry: s.candidate.entry.without_embedding(),
                distance: s.candidate.distance,
                relevance_score: s.relevance_score,
                rank: i + 1,
            })
            .collect();

        Ok(SearchOutcome {
            results,
            stats: SearchStats {
                mode: served,
                candidates_requested: fetch,
                candidates_fetched: fetched,
                candidates_after_filter: after_filter,
                reranked,
                rerank_failures,
            },
        })
    }

    async fn embed_query(&self, embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
        let timeout = self.config.query_timeout;
        let input = [text.to_string()];
        let vectors = tokio::time::timeout(timeout, embedder.embed(&input))
            .await
            .map_err(|_| anyhow!("query embedding timed out after {:?}", timeout))?
            .context("failed to embed query")?;
        let Some(vector) = vectors.into_iter().next() else {
            bail!("embedding provider returned no vector for the query");
        };
        checked_vector(vector, embedder.dims())?
            .ok_or_else(|| anyhow!("embedding provider returned an empty vector for the query"))
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            corpus: self
                .store
                .corpus_stats(self.config.backfill.max_attempts)
                .await?,
            index: self.store.load_index_meta().await?,
            index_loaded: self.slot.current().is_some(),
            approximate_threshold: self.config.retrieval.approximate_threshold,
        })
    }

    /// Per-source vector health against the provider dimensionality.
    pub async fn verify(&self) -> Result<Vec<SourceHealth>> {
        let dims = match &self.embedder {
            Some(e) => e.dims(),
            None => match self.store.load_index_meta().await?.dims {
                Some(d) => d,
                None => bail!("cannot verify embeddings: no provider configured and no index built"),
            },
        };
        self.store.embedding_health(dims).await
    }

    /// Make stuck entries eligible for backfill again. `modality` limits
    /// the repair to entries of that modality.
    pub async fn repair(&self, modality: Option<&str>) -> Result<RepairReport> {
        let report = self.store.repair_embeddings(modality).await?;
        info!(
            modality = modality.unwrap_or("all"),
            emptied_to_null = report.emptied_to_null,
            attempts_reset = report.attempts_reset,
            "repaired embeddings"
        );
        Ok(report)
    }

    pub async fn validate(&self) -> Result<ValidationReport> {
        self.store.validate_documents().await
    }
}

/// `(id, vector)` pairs of the entries whose vector has `dims` values.
fn indexable(entries: Vec<CorpusEntry>, dims: usize) -> Vec<(String, Vec<f32>)> {
    entries
        .into_iter()
        .filter_map(|e| match e.embedding {
            Some(v) if !v.is_empty() && v.len() == dims => Some((e.id, v)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps text to `[1, n]` where `n` is the first number in the text
    /// (0 when there is none), so distance to the query grows with `n`.
    struct NumberEmbedder {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    impl NumberEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            }
        }
    }

    fn leading_number(text: &str) -> f32 {
        let digits: String = text
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().unwrap_or(0.0)
    }

    #[async_trait]
    impl Embedder for NumberEmbedder {
        fn model_name(&self) -> &str {
            "number"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| vec![1.0, leading_number(t) * 0.1])
                .collect())
        }
    }

    /// Scores `1 / (1 + n)`; fails for texts containing `FAIL`.
    struct InverseScorer;

    #[async_trait]
    impl Scorer for InverseScorer {
        fn name(&self) -> &str {
            "inverse"
        }
        async fn score(&self, _query: &str, snippet: &str) -> Result<f64> {
            if snippet.contains("FAIL") {
                bail!("scorer exploded");
            }
            Ok(1.0 / (1.0 + leading_number(snippet) as f64))
        }
    }

    fn doc(id: &str, source: &str, text: &str) -> Document {
        Document {
            doc_id: id.to_string(),
            uri: format!("file:///{}", id),
            modality: "text".to_string(),
            source: source.to_string(),
            created_at: 1_700_000_000,
            text_content: Some(text.to_string()),
            mime_type: None,
            metadata: serde_json::json!({}),
        }
    }

    fn numbered(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| doc(&format!("d{:04}", i), "file", &format!("entry {}", i)))
            .collect()
    }

    struct Harness {
        engine: SearchEngine,
        store: Arc<InMemoryStore>,
        embedder: Arc<NumberEmbedder>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(NumberEmbedder::new());
        let engine = SearchEngine::new(
            store.clone(),
            Some(embedder.clone()),
            Some(Arc::new(InverseScorer)),
            config,
        );
        Harness {
            engine,
            store,
            embedder,
        }
    }

    fn small_index_config(threshold: usize, auto_rebuild: bool) -> EngineConfig {
        EngineConfig {
            retrieval: RetrievalParams {
                approximate_threshold: threshold,
                ..Default::default()
            },
            index: IndexParams {
                min_train_size: threshold,
                auto_rebuild,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_long_document_is_windowed() {
        let h = harness(EngineConfig::default());
        let report = h
            .engine
            .ingest(&[doc("long", "file", &"a".repeat(2500))])
            .await
            .unwrap();
        assert_eq!(report.entries_created, 3);
        assert_eq!(report.embeddings_backfilled(), 3);

        let ids: Vec<String> = h
            .store
            .embedded_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["long:0", "long:1", "long:2"]);
    }

    #[tokio::test]
    async fn test_reingest_unchanged_does_no_embedding() {
        let h = harness(EngineConfig::default());
        let docs = vec![doc("a", "file", "entry 1"), doc("b", "file", &"x".repeat(2500))];

        let first = h.engine.ingest(&docs).await.unwrap();
        let calls = h.embedder.calls.load(Ordering::SeqCst);
        let mut ids_first: Vec<String> = h
            .store
            .embedded_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();

        let second = h.engine.ingest(&docs).await.unwrap();
        assert_eq!(second.entries_created, 0);
        assert_eq!(second.entries_unchanged, first.entries_created);
        assert_eq!(second.backfill.pending, 0);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls);

        let mut ids_second: Vec<String> = h
            .store
            .embedded_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        ids_first.sort();
        ids_second.sort();
        assert_eq!(ids_first, ids_second);
    }

    #[tokio::test]
    async fn test_changed_document_reembeds_and_drops_old_chunks() {
        let h = harness(EngineConfig::default());
        h.engine
            .ingest(&[doc("d", "file", &"a".repeat(2500))])
            .await
            .unwrap();
        let report = h
            .engine
            .ingest(&[doc("d", "file", "now short")])
            .await
            .unwrap();
        assert_eq!(report.entries_created, 1);
        assert_eq!(report.entries_removed, 3);
        assert_eq!(report.backfill.embedded, 1);
        assert_eq!(h.store.count_embedded().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_null_text_and_bad_documents() {
        let h = harness(EngineConfig::default());
        let mut no_text = doc("nt", "audio", "");
        no_text.text_content = None;
        let bad = doc("", "file", "orphan");

        let report = h
            .engine
            .ingest(&[no_text, bad, doc("ok", "file", "entry 3")])
            .await
            .unwrap();
        assert_eq!(report.documents, 3);
        assert_eq!(report.skipped_no_text, 1);
        assert_eq!(report.failed_documents, 1);
        assert_eq!(report.entries_created, 1);

        let validation = h.engine.validate().await.unwrap();
        assert_eq!(validation.documents, 2);
        assert_eq!(validation.documents_without_text, 1);
    }

    #[tokio::test]
    async fn test_filtered_match_survives_overfetch() {
        let h = harness(EngineConfig::default());
        let mut docs = numbered(10);
        docs[7].source = "pdf".to_string();
        h.engine.ingest(&docs).await.unwrap();

        let mut query = SearchQuery::new("query", 3);
        query.filters.sources = vec!["pdf".to_string()];
        let outcome = h.engine.search(&query).await.unwrap();

        assert!(outcome.stats.candidates_requested >= 50);
        assert_eq!(outcome.stats.candidates_fetched, 10);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].entry.doc_id, "d0007");
        assert_eq!(outcome.results[0].rank, 1);
    }

    #[tokio::test]
    async fn test_results_ordered_by_distance() {
        let h = harness(EngineConfig::default());
        h.engine.ingest(&numbered(10)).await.unwrap();

        let outcome = h.engine.search(&SearchQuery::new("query", 3)).await.unwrap();
        let ids: Vec<&str> = outcome
            .results
            .iter()
            .map(|r| r.entry.id.as_str())
            .collect();
        assert_eq!(ids, vec!["d0000", "d0001", "d0002"]);
        assert_eq!(outcome.stats.mode, "exact");
        assert!(outcome.results.iter().all(|r| r.entry.embedding.is_none()));
        let ranks: Vec<usize> = outcome.results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_rerank_failure_ranks_below_scored() {
        let h = harness(EngineConfig::default());
        let mut docs = numbered(5);
        docs[0].text_content = Some("entry 0 FAIL".to_string());
        h.engine.ingest(&docs).await.unwrap();

        let mut query = SearchQuery::new("query", 5);
        query.rerank = true;
        let outcome = h.engine.search(&query).await.unwrap();

        assert!(outcome.stats.reranked);
        assert_eq!(outcome.stats.rerank_failures, 1);
        let last = outcome.results.last().unwrap();
        assert_eq!(last.entry.doc_id, "d0000");
        assert_eq!(last.relevance_score, None);
        assert!(outcome.results[..4]
            .iter()
            .all(|r| r.relevance_score.is_some()));
        let ids: Vec<&str> = outcome.results[..4]
            .iter()
            .map(|r| r.entry.doc_id.as_str())
            .collect();
        assert_eq!(ids, vec!["d0001", "d0002", "d0003", "d0004"]);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_before_embedding() {
        let h = harness(EngineConfig::default());
        h.engine.ingest(&numbered(3)).await.unwrap();
        let calls = h.embedder.calls.load(Ordering::SeqCst);

        let err = h.engine.search(&SearchQuery::new("   ", 3)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::EmptyQuery)
        ));

        let err = h.engine.search(&SearchQuery::new("q", 0)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::InvalidTopK)
        ));

        let mut bad_regex = SearchQuery::new("q", 3);
        bad_regex.filters.regex = Some("[unterminated".to_string());
        let err = h.engine.search(&bad_regex).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::InvalidRegex { .. })
        ));

        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_search_without_embedder_fails() {
        let engine = SearchEngine::new(
            Arc::new(InMemoryStore::new()),
            None,
            None,
            EngineConfig::default(),
        );
        assert!(engine.search(&SearchQuery::new("q", 3)).await.is_err());
    }

    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        fn model_name(&self) -> &str {
            "stalled"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_embedding_timeout_is_error() {
        let engine = SearchEngine::new(
            Arc::new(InMemoryStore::new()),
            Some(Arc::new(StalledEmbedder)),
            None,
            EngineConfig {
                query_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let err = engine
            .search(&SearchQuery::new("q", 3))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"), "{:#}", err);
    }

    #[tokio::test]
    async fn test_auto_rebuild_serves_approximate() {
        let h = harness(small_index_config(20, true));
        let report = h.engine.ingest(&numbered(40)).await.unwrap();
        assert_eq!(report.index_state, Some(IndexState::Ready));

        let outcome = h.engine.search(&SearchQuery::new("query", 5)).await.unwrap();
        assert_eq!(outcome.stats.mode, "approximate");
        assert_eq!(outcome.results[0].entry.id, "d0000");
    }

    #[tokio::test]
    async fn test_changed_entry_not_served_from_old_index_vector() {
        let h = harness(small_index_config(20, false));
        h.engine.ingest(&numbered(60)).await.unwrap();
        assert_eq!(
            h.engine.rebuild_index().await.unwrap().state,
            IndexState::Ready
        );

        // New content clears the vector; the index still holds the old one.
        h.engine
            .load(&[doc("d0000", "file", "replaced 999")])
            .await
            .unwrap();
        let outcome = h.engine.search(&SearchQuery::new("query", 3)).await.unwrap();
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["d0001", "d0002", "d0003"]);

        // Re-embedded far away: ranked by the new vector, not the indexed one.
        h.engine.backfill(None).await.unwrap();
        let outcome = h.engine.search(&SearchQuery::new("query", 3)).await.unwrap();
        assert_eq!(outcome.stats.mode, "approximate");
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["d0001", "d0002", "d0003"]);
        for r in &outcome.results {
            let v = vec![1.0, leading_number(&r.entry.text) * 0.1];
            let expected = crate::embedding::cosine_distance(&[1.0, 0.0], &v);
            assert!((r.distance - expected).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_exact_when_index_absent_above_threshold() {
        let h = harness(small_index_config(5, false));
        h.engine.ingest(&numbered(10)).await.unwrap();
        let outcome = h.engine.search(&SearchQuery::new("query", 3)).await.unwrap();
        assert_eq!(outcome.stats.mode, "exact");
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_below_min_train_size_is_absent() {
        let h = harness(EngineConfig::default());
        h.engine.ingest(&numbered(10)).await.unwrap();
        let meta = h.engine.rebuild_index().await.unwrap();
        assert_eq!(meta.state, IndexState::Absent);
        assert!(h.engine.slot.current().is_none());
    }

    #[tokio::test]
    async fn test_index_goes_stale_after_growth() {
        let h = harness(small_index_config(20, false));
        h.engine.ingest(&numbered(30)).await.unwrap();
        let meta = h.engine.rebuild_index().await.unwrap();
        assert_eq!(meta.state, IndexState::Ready);
        assert_eq!(meta.size_at_build, 30);

        let more: Vec<Document> = (30..40)
            .map(|i| doc(&format!("d{:04}", i), "file", &format!("entry {}", i)))
            .collect();
        let report = h.engine.ingest(&more).await.unwrap();
        assert_eq!(report.index_state, Some(IndexState::Stale));

        let outcome = h.engine.search(&SearchQuery::new("query", 3)).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_rebuild_returns_current_state() {
        let h = harness(small_index_config(20, false));
        h.engine.ingest(&numbered(30)).await.unwrap();

        let guard = h.engine.slot.try_begin_rebuild();
        assert!(guard.is_some());
        let meta = h.engine.rebuild_index().await.unwrap();
        assert_eq!(meta.state, IndexState::Absent);
        assert!(h.engine.slot.current().is_none());
        drop(guard);

        let meta = h.engine.rebuild_index().await.unwrap();
        assert_eq!(meta.state, IndexState::Ready);
    }

    #[tokio::test]
    async fn test_open_hydrates_persisted_index() {
        let h = harness(small_index_config(20, true));
        h.engine.ingest(&numbered(30)).await.unwrap();

        let reopened = SearchEngine::open(
            h.store.clone(),
            Some(h.embedder.clone()),
            None,
            small_index_config(20, true),
        )
        .await
        .unwrap();
        let status = reopened.status().await.unwrap();
        assert!(status.index_loaded);
        assert_eq!(status.index.state, IndexState::Ready);
        assert_eq!(status.corpus.embedded, 30);
    }

    #[tokio::test]
    async fn test_open_recovers_interrupted_build() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_index_meta(&IndexMeta {
                state: IndexState::Building,
                ..Default::default()
            })
            .await
            .unwrap();
        let engine = SearchEngine::open(store.clone(), None, None, EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(
            engine.status().await.unwrap().index.state,
            IndexState::Absent
        );
    }

    #[tokio::test]
    async fn test_verify_and_repair_empty_vectors() {
        let h = harness(EngineConfig::default());
        h.engine.ingest(&numbered(3)).await.unwrap();
        h.store.write_raw_embedding("d0001", Vec::new());

        let health = h.engine.verify().await.unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].valid, 2);
        assert_eq!(health[0].empty, 1);

        let status = h.engine.status().await.unwrap();
        assert_eq!(status.corpus.pending, 1);

        let repair = h.engine.repair(None).await.unwrap();
        assert_eq!(repair.emptied_to_null, 1);
        let report = h.engine.backfill(None).await.unwrap();
        assert_eq!(report.dedup_hits, 1);
        assert_eq!(h.store.count_embedded().await.unwrap(), 3);
    }
}
