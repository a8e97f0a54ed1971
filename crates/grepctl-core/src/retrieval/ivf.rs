//! Inverted-file (IVF) approximate nearest-neighbor index.
//!
//! Vectors are partitioned by spherical k-means into `nlist` lists, each
//! represented by a unit-length centroid. A query scans only the `nprobe`
//! lists whose centroids are closest, so cost scales with
//! `nlist + nprobe * n / nlist` instead of `n`.
//!
//! The index is immutable once built. New vectors are picked up by
//! rebuilding (or by re-hydrating from a snapshot, which assigns every
//! current vector to its nearest stored centroid).
//!
//! Training is deterministic: initial centroids are evenly spaced picks from
//! the input, which callers supply ordered by entry id.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_distance;

/// Upper bound for an automatically chosen list count.
pub const MAX_NLIST: usize = 4096;

/// Default k-means iteration cap.
pub const DEFAULT_ITERATIONS: usize = 10;

/// Pick a list count for `n` vectors: `sqrt(n)`, clamped to `[1, MAX_NLIST]`.
pub fn default_nlist(n: usize) -> usize {
    ((n as f64).sqrt().round() as usize).clamp(1, MAX_NLIST)
}

/// Persistable part of an index: the trained centroids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub dims: usize,
    pub centroids: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
struct Posting {
    id: String,
    vector: Vec<f32>,
}

/// A trained IVF index holding its own copy of the vectors.
#[derive(Debug)]
pub struct IvfIndex {
    dims: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<Posting>>,
    len: usize,
}

impl IvfIndex {
    /// Train an index over `(id, vector)` pairs.
    pub fn train(vectors: Vec<(String, Vec<f32>)>, nlist: usize, iterations: usize) -> Result<Self> {
        let dims = check_uniform(&vectors)?;
        let nlist = nlist.clamp(1, vectors.len());

        let units: Vec<Vec<f32>> = vectors.iter().map(|(_, v)| unit(v)).collect();
        let step = units.len() as f64 / nlist as f64;
        let mut centroids: Vec<Vec<f32>> = (0..nlist)
            .map(|i| units[(i as f64 * step) as usize].clone())
            .collect();

        let mut assignment = vec![usize::MAX; units.len()];
        for _ in 0..iterations.max(1) {
            let mut changed = false;
            for (slot, u) in assignment.iter_mut().zip(&units) {
                let best = nearest_centroid(&centroids, u);
                if *slot != best {
                    *slot = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dims]; nlist];
            let mut counts = vec![0usize; nlist];
            for (&c, u) in assignment.iter().zip(&units) {
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(u) {
                    *s += x;
                }
            }
            for (c, sum) in sums.into_iter().enumerate() {
                // An emptied list keeps its previous centroid.
                if counts[c] > 0 {
                    centroids[c] = unit(&sum);
                }
            }
        }

        Ok(Self::assemble(dims, centroids, vectors))
    }

    /// Rebuild an index from stored centroids and the current vectors.
    pub fn from_snapshot(snapshot: &IndexSnapshot, vectors: Vec<(String, Vec<f32>)>) -> Result<Self> {
        if snapshot.centroids.is_empty() {
            bail!("index snapshot has no centroids");
        }
        if snapshot.centroids.iter().any(|c| c.len() != snapshot.dims) {
            bail!("index snapshot centroids do not match dims {}", snapshot.dims);
        }
        let dims = check_uniform(&vectors)?;
        if dims != snapshot.dims {
            bail!(
                "index snapshot has {} dims but the corpus has {}",
                snapshot.dims,
                dims
            );
        }
        Ok(Self::assemble(dims, snapshot.centroids.clone(), vectors))
    }

    fn assemble(dims: usize, centroids: Vec<Vec<f32>>, vectors: Vec<(String, Vec<f32>)>) -> Self {
        let mut lists: Vec<Vec<Posting>> = vec![Vec::new(); centroids.len()];
        let len = vectors.len();
        for (id, vector) in vectors {
            let c = nearest_centroid(&centroids, &unit(&vector));
            lists[c].push(Posting { id, vector });
        }
        Self {
            dims,
            centroids,
            lists,
            len,
        }
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            dims: self.dims,
            centroids: self.centroids.clone(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Up to `k` `(id, distance)` pairs from the `nprobe` closest lists,
    /// ordered by distance then id.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Vec<(String, f64)> {
        if query.len() != self.dims || k == 0 {
            return Vec::new();
        }

        let mut order: Vec<(usize, f64)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_distance(query, c)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut hits: Vec<(String, f64)> = order
            .iter()
            .take(nprobe.max(1))
            .flat_map(|(list, _)| self.lists[*list].iter())
            .map(|p| (p.id.clone(), cosine_distance(query, &p.vector)))
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }
}

fn check_uniform(vectors: &[(String, Vec<f32>)]) -> Result<usize> {
    let Some((_, first)) = vectors.first() else {
        bail!("cannot build an index over zero vectors");
    };
    let dims = first.len();
    if dims == 0 {
        bail!("cannot index zero-length vectors");
    }
    if let Some((id, v)) = vectors.iter().find(|(_, v)| v.len() != dims) {
        bail!(
            "vector for {} has {} dims, expected {}",
            id,
            v.len(),
            dims
        );
    }
    Ok(dims)
}

fn unit(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn nearest_centroid(centroids: &[Vec<f32>], u: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dot = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let dot: f32 = c.iter().zip(u).map(|(a, b)| a * b).sum();
        if dot > best_dot {
            best_dot = dot;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points on four well separated directions in 3-d.
    fn clustered(n_per: usize) -> Vec<(String, Vec<f32>)> {
        let axes = [
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [-1.0, -1.0, 0.0],
        ];
        let mut out = Vec::new();
        for (a, axis) in axes.iter().enumerate() {
            for i in 0..n_per {
                let jitter = (i as f32) * 0.001;
                out.push((
                    format!("c{}-{:03}", a, i),
                    vec![axis[0] + jitter, axis[1] + jitter, axis[2] - jitter],
                ));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn test_default_nlist() {
        assert_eq!(default_nlist(0), 1);
        assert_eq!(default_nlist(10_000), 100);
        assert_eq!(default_nlist(100_000_000), MAX_NLIST);
    }

    #[test]
    fn test_train_partitions_everything() {
        let data = clustered(25);
        let index = IvfIndex::train(data, 4, DEFAULT_ITERATIONS).unwrap();
        assert_eq!(index.len(), 100);
        assert_eq!(index.nlist(), 4);
        let total: usize = index.lists.iter().map(|l| l.len()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_search_finds_query_cluster() {
        let index = IvfIndex::train(clustered(25), 4, DEFAULT_ITERATIONS).unwrap();
        let hits = index.search(&[0.0, 1.0, 0.0], 10, 1);
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().all(|(id, _)| id.starts_with("c1-")));
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn test_full_probe_matches_exact() {
        let data = clustered(10);
        let index = IvfIndex::train(data.clone(), 4, DEFAULT_ITERATIONS).unwrap();
        let query = [0.3, 0.9, -0.1];
        let approx = index.search(&query, 40, 4);
        let mut exact: Vec<(String, f64)> = data
            .iter()
            .map(|(id, v)| (id.clone(), cosine_distance(&query, v)))
            .collect();
        exact.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        assert_eq!(approx, exact);
    }

    #[test]
    fn test_snapshot_rehydrates_with_new_vectors() {
        let index = IvfIndex::train(clustered(5), 4, DEFAULT_ITERATIONS).unwrap();
        let snap = index.snapshot();
        let mut data = clustered(5);
        data.push(("new".to_string(), vec![0.0, 0.0, 2.0]));
        let rehydrated = IvfIndex::from_snapshot(&snap, data).unwrap();
        assert_eq!(rehydrated.len(), 21);
        // "new" is parallel to c2-000, so both sit at distance zero.
        let hits = rehydrated.search(&[0.0, 0.0, 1.0], 2, 1);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c2-000", "new"]);
    }

    #[test]
    fn test_rejects_mixed_dimensions() {
        let data = vec![
            ("a".to_string(), vec![1.0, 0.0]),
            ("b".to_string(), vec![1.0, 0.0, 0.0]),
        ];
        assert!(IvfIndex::train(data, 1, 1).is_err());
    }

    #[test]
    fn test_snapshot_dims_mismatch() {
        let snap = IndexSnapshot {
            dims: 2,
            centroids: vec![vec![1.0, 0.0]],
        };
        let data = vec![("a".to_string(), vec![1.0, 0.0, 0.0])];
        assert!(IvfIndex::from_snapshot(&snap, data).is_err());
    }

    #[test]
    fn test_wrong_query_dims_returns_nothing() {
        let index = IvfIndex::train(clustered(2), 2, 2).unwrap();
        assert!(index.search(&[1.0, 0.0], 5, 2).is_empty());
    }
}
