//! Brute-force nearest neighbors.

use crate::embedding::cosine_distance;
use crate::models::CorpusEntry;

use super::{by_distance, Candidate};

/// Rank `entries` by cosine distance to `query` and keep the nearest `k`.
///
/// Entries without a vector, or with a vector of another dimensionality,
/// are skipped.
pub fn nearest(query: &[f32], entries: Vec<CorpusEntry>, k: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = entries
        .into_iter()
        .filter_map(|entry| {
            let distance = match entry.embedding.as_deref() {
                Some(v) if v.len() == query.len() && !v.is_empty() => cosine_distance(query, v),
                _ => return None,
            };
            Some(Candidate { entry, distance })
        })
        .collect();

    candidates.sort_by(by_distance);
    candidates.truncate(k);
    candidates
}
