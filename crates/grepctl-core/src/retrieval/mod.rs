//! Vector retrieval: exact or approximate K-nearest-neighbor search.
//!
//! Retrieval is chosen once per request as a [`RetrievalMode`]:
//!
//! - **Exact**: brute-force cosine distance against every embedded entry
//!   ([`exact`]). Perfect recall; used for small corpora and as the
//!   fallback whenever the approximate index is unavailable.
//! - **Approximate**: an inverted-file index ([`ivf`]) probed over its
//!   nearest lists. Used once the corpus reaches the configured threshold
//!   and a trained index has been swapped into the [`IndexSlot`].
//!
//! Filtering happens after retrieval, so the engine always asks for
//! [`candidate_budget`] candidates rather than `top_k`.

pub mod exact;
pub mod ivf;

use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::embedding::cosine_distance;
use crate::models::CorpusEntry;
use crate::store::Store;

pub use ivf::{IndexSnapshot, IvfIndex};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// Multiplier applied to `top_k` when fetching candidates.
    pub overfetch_factor: usize,
    /// Minimum number of candidates to fetch.
    pub floor_k: usize,
    /// Embedded-entry count at which the approximate index is used.
    pub approximate_threshold: usize,
    /// Number of IVF lists scanned per query.
    pub nprobe: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            overfetch_factor: 5,
            floor_k: 50,
            approximate_threshold: 5000,
            nprobe: 10,
        }
    }
}

/// Number of candidates to fetch for a request: `max(top_k * factor, floor)`.
pub fn candidate_budget(top_k: usize, params: &RetrievalParams) -> usize {
    top_k
        .saturating_mul(params.overfetch_factor)
        .max(params.floor_k)
}

/// A retrieved entry with its distance to the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: CorpusEntry,
    pub distance: f64,
}

/// Ascending distance, then ascending entry id.
pub fn by_distance(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}

/// How one request will be served.
#[derive(Debug, Clone)]
pub enum RetrievalMode {
    Exact,
    Approximate(Arc<IvfIndex>),
}

impl RetrievalMode {
    pub fn name(&self) -> &'static str {
        match self {
            RetrievalMode::Exact => "exact",
            RetrievalMode::Approximate(_) => "approximate",
        }
    }
}

/// Pick exact or approximate retrieval for a corpus of `embedded` vectors.
pub fn select_mode(
    embedded: usize,
    index: Option<Arc<IvfIndex>>,
    query_dims: usize,
    params: &RetrievalParams,
) -> RetrievalMode {
    match index {
        Some(idx) if embedded >= params.approximate_threshold && idx.dims() == query_dims => {
            RetrievalMode::Approximate(idx)
        }
        _ => RetrievalMode::Exact,
    }
}

/// Fetch up to `fetch` nearest candidates, ordered by [`by_distance`].
///
/// Returns the candidates and the name of the mode that actually served
/// them; an approximate request that cannot be satisfied is answered by
/// exact search instead.
pub async fn retrieve<S: Store + ?Sized>(
    store: &S,
    mode: &RetrievalMode,
    query_vec: &[f32],
    fetch: usize,
    nprobe: usize,
) -> Result<(Vec<Candidate>, &'static str)> {
    if let RetrievalMode::Approximate(index) = mode {
        let hits = index.search(query_vec, fetch, nprobe);
        let wanted = fetch.min(index.len());
        if hits.len() >= wanted {
            let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
            let mut entries: std::collections::HashMap<String, CorpusEntry> = store
                .get_entries(&ids)
                .await?
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect();
            // Index postings are frozen at build time; score against the
            // stored vector so changed or cleared entries are never served.
            let mut candidates: Vec<Candidate> = hits
                .into_iter()
                .filter_map(|(id, _)| {
                    let entry = entries.remove(&id)?;
                    let distance = match entry.embedding.as_deref() {
                        Some(v) if !v.is_empty() && v.len() == query_vec.len() => {
                            cosine_distance(query_vec, v)
                        }
                        _ => return None,
                    };
                    Some(Candidate { entry, distance })
                })
                .collect();
            candidates.sort_by(by_distance);
            if candidates.len() >= wanted {
                return Ok((candidates, "approximate"));
            }
        }
        debug!(fetch, "approximate index came up short; falling back to exact search");
    }

    let entries = store.embedded_entries().await?;
    Ok((exact::nearest(query_vec, entries, fetch), "exact"))
}

/// Lifecycle of the approximate index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Absent,
    Building,
    Ready,
    Stale,
    Rebuilding,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Absent => "absent",
            IndexState::Building => "building",
            IndexState::Ready => "ready",
            IndexState::Stale => "stale",
            IndexState::Rebuilding => "rebuilding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "absent" => Some(IndexState::Absent),
            "building" => Some(IndexState::Building),
            "ready" => Some(IndexState::Ready),
            "stale" => Some(IndexState::Stale),
            "rebuilding" => Some(IndexState::Rebuilding),
            _ => None,
        }
    }
}

/// Persisted index bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub state: IndexState,
    /// Unix timestamp of the last successful build.
    pub built_at: Option<i64>,
    pub size_at_build: usize,
    /// Vectors written since the last build.
    pub embedded_since_build: usize,
    pub dims: Option<usize>,
    pub nlist: usize,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            state: IndexState::Absent,
            built_at: None,
            size_at_build: 0,
            embedded_since_build: 0,
            dims: None,
            nlist: 0,
        }
    }
}

impl IndexMeta {
    /// Record `n` newly embedded vectors, moving `ready` to `stale` once
    /// they exceed `stale_fraction` of the build size.
    pub fn note_embedded(&mut self, n: usize, stale_fraction: f64) {
        self.embedded_since_build += n;
        if self.state == IndexState::Ready
            && self.embedded_since_build as f64 > self.size_at_build as f64 * stale_fraction
        {
            self.state = IndexState::Stale;
        }
    }

    /// Repair a state left behind by an interrupted build.
    pub fn recover(&mut self, has_snapshot: bool) {
        self.state = match self.state {
            IndexState::Building => IndexState::Absent,
            IndexState::Rebuilding if has_snapshot => IndexState::Stale,
            IndexState::Rebuilding => IndexState::Absent,
            other => other,
        };
    }
}

/// Holder of the live approximate index.
///
/// Readers clone the current `Arc` and keep using it for the rest of their
/// request. A rebuild trains a new index off to the side and swaps it in.
/// At most one rebuild runs at a time.
#[derive(Default)]
pub struct IndexSlot {
    current: RwLock<Option<Arc<IvfIndex>>>,
    rebuild: Mutex<()>,
}

impl IndexSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<IvfIndex>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn swap(&self, index: Option<Arc<IvfIndex>>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = index;
    }

    /// Claim the rebuild lock, or `None` if a rebuild is already in flight.
    pub fn try_begin_rebuild(&self) -> Option<MutexGuard<'_, ()>> {
        self.rebuild.try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_budget_floor_and_factor() {
        let p = RetrievalParams::default();
        assert_eq!(candidate_budget(3, &p), 50);
        assert_eq!(candidate_budget(10, &p), 50);
        assert_eq!(candidate_budget(11, &p), 55);
        assert_eq!(candidate_budget(40, &p), 200);
    }

    #[test]
    fn test_select_mode_below_threshold_is_exact() {
        let p = RetrievalParams::default();
        assert!(matches!(select_mode(10, None, 3, &p), RetrievalMode::Exact));
    }

    #[test]
    fn test_select_mode_without_index_is_exact() {
        let p = RetrievalParams {
            approximate_threshold: 1,
            ..Default::default()
        };
        assert!(matches!(select_mode(10_000, None, 3, &p), RetrievalMode::Exact));
    }

    #[test]
    fn test_index_meta_goes_stale() {
        let mut meta = IndexMeta {
            state: IndexState::Ready,
            size_at_build: 100,
            ..Default::default()
        };
        meta.note_embedded(10, 0.2);
        assert_eq!(meta.state, IndexState::Ready);
        meta.note_embedded(11, 0.2);
        assert_eq!(meta.state, IndexState::Stale);
    }

    #[test]
    fn test_index_meta_recover_interrupted_build() {
        let mut meta = IndexMeta {
            state: IndexState::Building,
            ..Default::default()
        };
        meta.recover(false);
        assert_eq!(meta.state, IndexState::Absent);

        meta.state = IndexState::Rebuilding;
        meta.recover(true);
        assert_eq!(meta.state, IndexState::Stale);
    }

    #[tokio::test]
    async fn test_single_rebuild_in_flight() {
        let slot = IndexSlot::new();
        let guard = slot.try_begin_rebuild();
        assert!(guard.is_some());
        assert!(slot.try_begin_rebuild().is_none());
        drop(guard);
        assert!(slot.try_begin_rebuild().is_some());
    }
}
