//! Reciprocal Rank Fusion.
//!
//! Combines independent rankings using only rank positions, so dense cosine
//! similarities and BM25 scores never need to be put on a common scale.
//! Each list contributes `1 / (k + rank)` for every id it contains, with
//! 1-based ranks.

use std::collections::HashMap;

/// Standard RRF constant.
pub const RRF_K: f64 = 60.0;

/// Map ids (already ordered best-first) to their 1-based rank.
///
/// If an id appears more than once, its best (lowest) rank is kept.
pub fn rank_map<I, S>(ids_sorted_desc: I) -> HashMap<String, usize>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ranks = HashMap::new();
    for (i, id) in ids_sorted_desc.into_iter().enumerate() {
        ranks.entry(id.into()).or_insert(i + 1);
    }
    ranks
}

/// Stable descending sort of `items` by `score`, then 1-based ranks keyed by `id`.
///
/// Items with equal scores keep their input order.
pub fn rank_by_score<T>(
    items: &[T],
    id: impl Fn(&T) -> &str,
    score: impl Fn(&T) -> f64,
) -> HashMap<String, usize> {
    let mut order: Vec<&T> = items.iter().collect();
    order.sort_by(|a, b| score(b).total_cmp(&score(a)));
    rank_map(order.into_iter().map(|item| id(item).to_string()))
}

/// Fuse two rank maps. Every id present in either map gets
/// `sum(1 / (k + rank))` over the maps that contain it.
pub fn reciprocal_rank_fusion(
    dense_rank: &HashMap<String, usize>,
    sparse_rank: &HashMap<String, usize>,
    k: f64,
) -> HashMap<String, f64> {
    let mut fused: HashMap<String, f64> = HashMap::new();
    for ranks in [dense_rank, sparse_rank] {
        for (id, rank) in ranks {
            *fused.entry(id.clone()).or_insert(0.0) += 1.0 / (k + *rank as f64);
        }
    }
    fused
}
