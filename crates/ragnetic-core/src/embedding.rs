//! Vector utilities shared by embedding providers and vector indexes.
//!
//! Concrete providers (OpenAI, Ollama, fastembed, feature hashing) live in
//! the `ragnetic` app crate; this module holds the pure math they share.

use crate::lexical::tokenize;

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Deterministic signed feature-hashing embedding of `text`.
///
/// Each token (see [`tokenize`]) is hashed with FNV-1a into one of `dims`
/// buckets; the top hash bit picks the sign. The result is L2-normalized, so
/// texts sharing vocabulary have positive cosine similarity. Returns the zero
/// vector for text with no tokens, and an empty vector when `dims == 0`.
///
/// # Example
///
/// ```rust
/// use ragnetic_core::embedding::{cosine_similarity, hash_embed};
///
/// let a = hash_embed("refund policy for orders", 64);
/// let b = hash_embed("what is the refund policy", 64);
/// assert_eq!(a.len(), 64);
/// assert!(cosine_similarity(&a, &b) > 0.0);
/// ```
pub fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    if dims == 0 {
        return v;
    }
    for token in tokenize(text) {
        let h = fnv1a(token.as_bytes());
        let bucket = (h % dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign;
    }
    l2_normalize(&mut v);
    v
}
