//! Token pooling: shrink a document's patch vectors before indexing.
//!
//! Multi-vector models emit one vector per patch (ColPali: ~1030 per page).
//! Many patches are near-duplicates (white margins, repeated texture), so
//! merging similar vectors cuts storage by the pool factor while MaxSim
//! quality degrades only slightly.
//!
//! ```text
//! 1030 patches × 128 dims, factor 3 → 343 pooled vectors
//! ```
//!
//! ## Invariants
//!
//! 1. `pool([], n).is_empty()`
//! 2. `pool(tokens, n).len() <= tokens.len()`
//! 3. target `>= tokens.len()` is the identity
//! 4. output vectors keep the input dimension
//! 5. same input, same output (no randomness, ties broken by index)
//!
//! ## Example
//!
//! ```rust
//! use rank_pool::pool::{HierarchicalPooler, Pooler};
//!
//! let tokens = vec![
//!     vec![1.0, 0.0],
//!     vec![0.9, 0.1],
//!     vec![0.0, 1.0],
//!     vec![0.1, 0.9],
//! ];
//! let pooled = HierarchicalPooler.pool_by_factor(&tokens, 2);
//! assert_eq!(pooled.len(), 2);
//! assert!((pooled[0][0] - 0.95).abs() < 1e-6);
//! ```

use crate::simd;

/// Target vector count for a pool factor: `max(n / factor, 1)`.
///
/// Returns `n` when there is nothing to pool.
#[inline]
#[must_use]
pub fn target_count(n: usize, factor: usize) -> usize {
    if n == 0 || factor <= 1 {
        return n;
    }
    (n / factor).max(1)
}

/// Token embedding compression (indexing-time only).
pub trait Pooler: Send + Sync {
    /// Pool to at most `target_count` vectors.
    fn pool(&self, tokens: &[Vec<f32>], target_count: usize) -> Vec<Vec<f32>>;

    /// Pool with a reduction factor (2 = half as many vectors, 3 = a third).
    fn pool_by_factor(&self, tokens: &[Vec<f32>], factor: usize) -> Vec<Vec<f32>> {
        self.pool(tokens, target_count(tokens.len(), factor))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hierarchical (Ward) pooling
// ─────────────────────────────────────────────────────────────────────────────

/// Ward-linkage agglomerative pooling.
///
/// Builds the full dendrogram with the nearest-neighbour chain algorithm
/// (O(n²·d) time, O(n·d) memory), cuts it at `target_count` clusters and
/// replaces each cluster by its mean. Clusters are emitted in order of their
/// lowest patch index.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalPooler;

impl Pooler for HierarchicalPooler {
    fn pool(&self, tokens: &[Vec<f32>], target_count: usize) -> Vec<Vec<f32>> {
        let target = target_count.max(1);
        if tokens.len() <= target {
            return tokens.to_vec();
        }
        let merges = ward_merges(tokens);
        let labels = cut(tokens.len(), &merges, target);
        mean_by_label(tokens, &labels)
    }
}

/// One agglomeration step: clusters represented by `a` and `b` merged at `cost`.
///
/// Cluster ids are the lowest patch index they contain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub a: usize,
    pub b: usize,
    pub cost: f32,
}

/// Ward merge cost between two clusters: increase in within-cluster variance.
#[inline]
fn ward_cost(ca: &[f32], na: usize, cb: &[f32], nb: usize) -> f32 {
    let (na, nb) = (na as f32, nb as f32);
    (na * nb / (na + nb)) * simd::squared_l2(ca, cb)
}

/// All `n - 1` Ward merges, sorted by ascending cost.
///
/// Ward linkage is reducible, so the nearest-neighbour chain finds exactly the
/// merges of the greedy algorithm (in a different order); sorting restores the
/// dendrogram order.
#[must_use]
pub fn ward_merges(tokens: &[Vec<f32>]) -> Vec<Merge> {
    let n = tokens.len();
    if n < 2 {
        return Vec::new();
    }

    let mut centroid: Vec<Vec<f32>> = tokens.to_vec();
    let mut size = vec![1usize; n];
    let mut active = vec![true; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut merges = Vec::with_capacity(n - 1);

    while merges.len() < n - 1 {
        if chain.is_empty() {
            // lowest active cluster starts a new chain
            if let Some(first) = active.iter().position(|&a| a) {
                chain.push(first);
            }
        }
        let top = chain[chain.len() - 1];
        let prev = chain.len().checked_sub(2).map(|i| chain[i]);

        // Prefer the previous chain element on ties so the chain terminates.
        let (mut best, mut best_cost) = match prev {
            Some(p) => (p, ward_cost(&centroid[top], size[top], &centroid[p], size[p])),
            None => (usize::MAX, f32::INFINITY),
        };
        for j in 0..n {
            if !active[j] || j == top || Some(j) == prev {
                continue;
            }
            let c = ward_cost(&centroid[top], size[top], &centroid[j], size[j]);
            if c < best_cost || (c == best_cost && j < best && Some(best) != prev) {
                best = j;
                best_cost = c;
            }
        }
        if best == usize::MAX {
            // every cost was NaN; merge with any other live cluster
            best = (0..n).find(|&j| active[j] && j != top).unwrap_or(top);
            best_cost = f32::INFINITY;
            if best == top {
                break;
            }
        }

        if Some(best) == prev {
            chain.pop();
            chain.pop();
            let (lo, hi) = if top < best { (top, best) } else { (best, top) };
            let (nl, nh) = (size[lo] as f32, size[hi] as f32);
            let total = nl + nh;
            let merged: Vec<f32> = centroid[lo]
                .iter()
                .zip(centroid[hi].iter())
                .map(|(x, y)| (x * nl + y * nh) / total)
                .collect();
            centroid[lo] = merged;
            size[lo] += size[hi];
            active[hi] = false;
            merges.push(Merge {
                a: lo,
                b: hi,
                cost: best_cost,
            });
        } else {
            chain.push(best);
        }
    }

    // stable: equal costs keep discovery order
    merges.sort_by(|x, y| x.cost.total_cmp(&y.cost));
    merges
}

/// Apply the cheapest `n - k` merges and label every token with its cluster.
///
/// Labels are dense (`0..k`) and ordered by each cluster's lowest index.
#[must_use]
pub fn cut(n: usize, merges: &[Merge], k: usize) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let take = n.saturating_sub(k.max(1)).min(merges.len());
    for m in &merges[..take] {
        let ra = find(&mut parent, m.a);
        let rb = find(&mut parent, m.b);
        if ra != rb {
            // root is always the lowest index in the set
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            parent[hi] = lo;
        }
    }

    let mut label_of_root = vec![usize::MAX; n];
    let mut next = 0;
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let r = find(&mut parent, i);
        if label_of_root[r] == usize::MAX {
            label_of_root[r] = next;
            next += 1;
        }
        labels.push(label_of_root[r]);
    }
    labels
}

fn mean_by_label(tokens: &[Vec<f32>], labels: &[usize]) -> Vec<Vec<f32>> {
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    let dim = tokens.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0f32; dim]; k];
    let mut counts = vec![0usize; k];
    for (tok, &label) in tokens.iter().zip(labels) {
        for (s, &v) in sums[label].iter_mut().zip(tok) {
            *s += v;
        }
        counts[label] += 1;
    }
    for (sum, &count) in sums.iter_mut().zip(&counts) {
        let c = count as f32;
        sum.iter_mut().for_each(|v| *v /= c);
    }
    sums
}

// ─────────────────────────────────────────────────────────────────────────────
// Sequential pooling
// ─────────────────────────────────────────────────────────────────────────────

/// Mean of consecutive windows. O(n), ignores similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialPooler;

impl Pooler for SequentialPooler {
    fn pool(&self, tokens: &[Vec<f32>], target_count: usize) -> Vec<Vec<f32>> {
        let target = target_count.max(1);
        if tokens.len() <= target {
            return tokens.to_vec();
        }
        let window = tokens.len().div_ceil(target);
        let labels: Vec<usize> = (0..tokens.len()).map(|i| i / window).collect();
        mean_by_label(tokens, &labels)
    }
}

/// Pooling strategy selected by name (`hierarchical` or `sequential`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMethod {
    #[default]
    Hierarchical,
    Sequential,
}

impl PoolMethod {
    #[must_use]
    pub fn pooler(self) -> Box<dyn Pooler> {
        match self {
            Self::Hierarchical => Box::new(HierarchicalPooler),
            Self::Sequential => Box::new(SequentialPooler),
        }
    }
}

impl std::str::FromStr for PoolMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "hierarchical" | "ward" => Ok(Self::Hierarchical),
            "sequential" => Ok(Self::Sequential),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown pool method '{other}'"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
