//! Optional relevance reranking by an LLM scoring provider.
//!
//! Each surviving candidate is scored independently against the query. The
//! stage fails open: a scorer error, a timeout, or a NaN leaves that
//! candidate's score as `None` and the request carries on.

use std::cmp::Ordering;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::retrieval::Candidate;

/// LLM relevance scorer.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;
    /// Relevance of `snippet` to `query`, nominally in `[0, 1]`.
    async fn score(&self, query: &str, snippet: &str) -> Result<f64>;
}

#[derive(Debug, Clone)]
pub struct RerankOptions {
    /// Snippet length sent to the scorer, in chars.
    pub snippet_chars: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    /// Nearest survivors sent for scoring, raised to `top_k` when smaller.
    pub max_candidates: usize,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            snippet_chars: 1500,
            concurrency: 8,
            timeout: Duration::from_secs(20),
            max_candidates: 50,
        }
    }
}

/// A candidate after the rerank stage.
#[derive(Debug, Clone)]
pub struct Scored {
    pub candidate: Candidate,
    pub relevance_score: Option<f64>,
}

/// First `cap` chars of `text`.
pub fn snippet(text: &str, cap: usize) -> &str {
    match text.char_indices().nth(cap) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Score `candidates` (already ordered by distance) and return them in
/// final order, together with the number of scoring failures.
pub async fn rerank(
    scorer: &dyn Scorer,
    query: &str,
    mut candidates: Vec<Candidate>,
    top_k: usize,
    opts: &RerankOptions,
) -> (Vec<Scored>, usize) {
    candidates.truncate(opts.max_candidates.max(top_k));

    let futures: Vec<_> = candidates
        .iter()
        .map(|c| score_one(scorer, query, c, opts))
        .collect();
    let scores: Vec<Option<f64>> = stream::iter(futures)
        .buffered(opts.concurrency.max(1))
        .collect()
        .await;

    let failures = scores.iter().filter(|s| s.is_none()).count();
    if failures > 0 {
        warn!(
            scorer = scorer.name(),
            failures,
            total = scores.len(),
            "rerank scoring failed for some candidates"
        );
    }

    let mut scored: Vec<Scored> = candidates
        .into_iter()
        .zip(scores)
        .map(|(candidate, relevance_score)| Scored {
            candidate,
            relevance_score,
        })
        .collect();
    scored.sort_by(final_order);
    (scored, failures)
}

async fn score_one(
    scorer: &dyn Scorer,
    query: &str,
    candidate: &Candidate,
    opts: &RerankOptions,
) -> Option<f64> {
    let text = snippet(&candidate.entry.text, opts.snippet_chars);
    match tokio::time::timeout(opts.timeout, scorer.score(query, text)).await {
        Ok(Ok(s)) if s.is_nan() => {
            debug!(entry = %candidate.entry.id, "scorer returned NaN");
            None
        }
        Ok(Ok(s)) => Some(s.clamp(0.0, 1.0)),
        Ok(Err(e)) => {
            debug!(entry = %candidate.entry.id, error = %e, "scorer failed");
            None
        }
        Err(_) => {
            debug!(entry = %candidate.entry.id, "scorer timed out");
            None
        }
    }
}

/// Score descending with unscored last, then distance ascending, then id.
pub fn final_order(a: &Scored, b: &Scored) -> Ordering {
    let by_score = match (a.relevance_score, b.relevance_score) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score
        .then_with(|| a.candidate.distance.total_cmp(&b.candidate.distance))
        .then_with(|| a.candidate.entry.id.cmp(&b.candidate.entry.id))
}
