//! Embedding backfill: attach vectors to every pending corpus entry.
//!
//! ```text
//! pending_entries ──► batches (≤ batch_size) ──► buffer_unordered(concurrency)
//!                                                    │
//!                       cache hit ◄── content hash ──┤
//!                                                    ▼
//!                                         Embedder::embed (timeout)
//!                                                    │
//!                          set_embedding (CAS on content hash) / record_embed_failure
//! ```
//!
//! A failed batch is never fatal to the run. Its entries stay pending with
//! their retry counter bumped, and once an entry reaches `max_attempts` it is
//! parked until its content changes or an operator resets it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::{checked_vector, Embedder};
use crate::models::CorpusEntry;
use crate::store::Store;

/// Largest batch any provider is sent.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub batch_size: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
    pub max_attempts: u32,
    /// Deadline for one provider call.
    pub timeout: Duration,
    /// Stop after this many pending entries.
    pub limit: Option<usize>,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            concurrency: 4,
            max_attempts: 5,
            timeout: Duration::from_secs(30),
            limit: None,
        }
    }
}

/// Counts from one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Pending entries picked up by this run.
    pub pending: usize,
    /// Entries that received a vector from the provider.
    pub embedded: usize,
    /// Entries that reused a vector from the content-hash cache.
    pub dedup_hits: usize,
    /// Entries left pending with their retry counter incremented.
    pub failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

impl BackfillReport {
    /// Entries that gained a vector, from either path.
    pub fn written(&self) -> usize {
        self.embedded + self.dedup_hits
    }

    fn absorb(&mut self, b: BatchOutcome) {
        self.batches += 1;
        self.embedded += b.embedded;
        self.dedup_hits += b.dedup_hits;
        self.failed += b.failed;
        if b.batch_failed {
            self.failed_batches += 1;
        }
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    embedded: usize,
    dedup_hits: usize,
    failed: usize,
    batch_failed: bool,
}

/// Embed every pending entry, or up to `opts.limit` of them.
pub async fn backfill<S: Store + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    opts: &BackfillOptions,
) -> Result<BackfillReport> {
    if opts.batch_size == 0 || opts.batch_size > MAX_BATCH_SIZE {
        bail!(
            "batch_size must be between 1 and {}, got {}",
            MAX_BATCH_SIZE,
            opts.batch_size
        );
    }

    let pending = store.pending_entries(opts.limit, opts.max_attempts).await?;
    let mut report = BackfillReport {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        return Ok(report);
    }

    let batches: Vec<Vec<CorpusEntry>> = pending
        .chunks(opts.batch_size)
        .map(|c| c.to_vec())
        .collect();

    let outcomes: Vec<BatchOutcome> = stream::iter(batches)
        .map(|batch| embed_batch(store, embedder, opts, batch))
        .buffer_unordered(opts.concurrency.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        report.absorb(outcome);
    }

    info!(
        pending = report.pending,
        embedded = report.embedded,
        dedup_hits = report.dedup_hits,
        failed = report.failed,
        "backfill finished"
    );
    Ok(report)
}

/// Run one batch. A store error ends the batch early; whatever it had not
/// written yet stays pending and the batch counts as failed.
async fn embed_batch<S: Store + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    opts: &BackfillOptions,
    batch: Vec<CorpusEntry>,
) -> BatchOutcome {
    let mut out = BatchOutcome::default();
    if let Err(e) = fill_batch(store, embedder, opts, &batch, &mut out).await {
        warn!(entries = batch.len(), error = %e, "storage error during embedding batch");
        out.batch_failed = true;
        out.failed = batch.len() - out.embedded - out.dedup_hits;
    }
    out
}

async fn fill_batch<S: Store + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    opts: &BackfillOptions,
    batch: &[CorpusEntry],
    out: &mut BatchOutcome,
) -> Result<()> {
    let dims = embedder.dims();
    let model = embedder.model_name();

    let hashes: Vec<String> = batch
        .iter()
        .map(|e| e.content_hash.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let cached = store.cached_embeddings(&hashes).await?;

    let mut misses: Vec<&CorpusEntry> = Vec::new();
    for entry in batch {
        let hit = cached
            .get(&entry.content_hash)
            .filter(|v| v.len() == dims);
        match hit {
            Some(vector) => {
                if store
                    .set_embedding(&entry.id, &entry.content_hash, vector, model)
                    .await?
                {
                    out.dedup_hits += 1;
                }
            }
            None => misses.push(entry),
        }
    }
    if out.dedup_hits > 0 {
        debug!(hits = out.dedup_hits, "reused cached embeddings");
    }
    if misses.is_empty() {
        return Ok(());
    }

    // Identical texts in one batch are sent once.
    let mut unique: Vec<String> = Vec::new();
    let mut slot_of: HashMap<&str, usize> = HashMap::new();
    for &entry in &misses {
        slot_of.entry(entry.content_hash.as_str()).or_insert_with(|| {
            unique.push(entry.text.clone());
            unique.len() - 1
        });
    }

    let vectors = match call_provider(embedder, &unique, dims, opts.timeout).await {
        Ok(v) => v,
        Err(e) => {
            warn!(entries = misses.len(), error = %e, "embedding batch failed");
            let ids: Vec<String> = misses.iter().map(|e| e.id.clone()).collect();
            store.record_embed_failure(&ids).await?;
            out.failed += ids.len();
            out.batch_failed = true;
            return Ok(());
        }
    };

    let mut failed_ids = Vec::new();
    for entry in misses {
        match &vectors[slot_of[entry.content_hash.as_str()]] {
            Some(vector) => {
                if store
                    .set_embedding(&entry.id, &entry.content_hash, vector, model)
                    .await?
                {
                    out.embedded += 1;
                } else {
                    debug!(entry = %entry.id, "entry changed during backfill; skipping write");
                }
            }
            None => failed_ids.push(entry.id.clone()),
        }
    }
    if !failed_ids.is_empty() {
        warn!(entries = failed_ids.len(), "provider returned no vector for some entries");
        store.record_embed_failure(&failed_ids).await?;
        out.failed += failed_ids.len();
    }
    Ok(())
}

/// One provider call, validated as a whole: a wrong item count or a
/// non-empty vector of the wrong size fails the batch. Empty vectors come
/// back as `None`.
async fn call_provider(
    embedder: &dyn Embedder,
    texts: &[String],
    dims: usize,
    timeout: Duration,
) -> Result<Vec<Option<Vec<f32>>>> {
    let raw = match tokio::time::timeout(timeout, embedder.embed(texts)).await {
        Ok(result) => result?,
        Err(_) => bail!("embedding request timed out after {:?}", timeout),
    };
    if raw.len() != texts.len() {
        bail!(
            "provider returned {} vectors for {} texts",
            raw.len(),
            texts.len()
        );
    }
    raw.into_iter().map(|v| checked_vector(v, dims)).collect()
}
