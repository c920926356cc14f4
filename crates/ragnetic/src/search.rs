//! Hybrid retrieval: dense similarity + BM25, fused with Reciprocal Rank
//! Fusion, optionally reranked by a cross-encoder.
//!
//! # Pipeline
//!
//! ```text
//!            ┌── dense: embed query → index.search(dense_limit) ──┐
//! query ─────┤                                                     ├─▶ RRF ─▶ rerank? ─▶ top_k
//!            └── lexical: index.scroll(≤ sparse_pool) → BM25 ─────┘
//! ```
//!
//! The two stages run concurrently and both must succeed; there is no
//! lexical-only fallback when the embedder or the index is down.
//!
//! BM25 statistics come from the scanned pool, not the whole collection, and
//! only pool entries with a positive BM25 score take part in fusion. A chunk
//! seen by both stages keeps its dense score and the larger lexical score.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use ragnetic_core::error::RagError;
use ragnetic_core::fusion::{rank_by_score, reciprocal_rank_fusion, RRF_K};
use ragnetic_core::lexical::{bm25_scores, Bm25Params};
use ragnetic_core::models::{Candidate, Metadata};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::VectorIndex;
use crate::rerank::CrossEncoder;

/// Default retrieval knobs, usually taken from `[retrieval]` config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub dense_limit: usize,
    pub sparse_pool: usize,
    pub rerank_top_n: usize,
    pub scroll_page_size: usize,
    pub bm25: Bm25Params,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for RetrievalParams {
    fn from(c: &RetrievalConfig) -> Self {
        Self {
            top_k: c.top_k,
            dense_limit: c.dense_limit,
            sparse_pool: c.sparse_pool,
            rerank_top_n: c.rerank_top_n,
            scroll_page_size: c.scroll_page_size.max(1),
            bm25: c.bm25(),
        }
    }
}

/// Per-call overrides. `None` (or `0`) falls back to [`RetrievalParams`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrieveOptions {
    pub top_k: Option<usize>,
    pub dense_limit: Option<usize>,
    pub sparse_pool: Option<usize>,
    pub rerank_top_n: Option<usize>,
}

fn pick(value: Option<usize>, default: usize) -> usize {
    value.filter(|v| *v > 0).unwrap_or(default)
}

/// One ranked passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub snippet: String,
    pub score: f64,
    pub metadata: Metadata,
    pub doc_id: Option<i64>,
    pub dense_score: f64,
    pub sparse_score: f64,
}

impl From<Candidate> for RetrievalResult {
    fn from(c: Candidate) -> Self {
        Self {
            snippet: c.text,
            score: c.final_score,
            metadata: c.metadata,
            doc_id: c.doc_id,
            dense_score: c.dense_score,
            sparse_score: c.sparse_score,
        }
    }
}

/// Stateless per call; share it behind an `Arc`.
pub struct HybridRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    params: RetrievalParams,
}

fn unavailable(e: anyhow::Error) -> RagError {
    RagError::RetrievalUnavailable(format!("{:#}", e))
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            index,
            embedder,
            cross_encoder: None,
            params,
        }
    }

    pub fn with_cross_encoder(mut self, cross_encoder: Option<Arc<dyn CrossEncoder>>) -> Self {
        self.cross_encoder = cross_encoder;
        self
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Answer `query` against knowledge base `kb_id`.
    ///
    /// Returns at most `top_k` results sorted by descending score. A blank
    /// query returns no results.
    ///
    /// # Errors
    ///
    /// [`RagError::RetrievalUnavailable`] if embedding the query, the dense
    /// search, or the scan fails.
    pub async fn retrieve(
        &self,
        kb_id: i64,
        query: &str,
        opts: &RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let top_k = pick(opts.top_k, self.params.top_k);
        let dense_limit = pick(opts.dense_limit, self.params.dense_limit);
        let sparse_pool = pick(opts.sparse_pool, self.params.sparse_pool);
        let rerank_top_n = pick(opts.rerank_top_n, self.params.rerank_top_n);

        let collection = self
            .index
            .ensure_collection(kb_id)
            .await
            .map_err(unavailable)?;

        let (dense, mut pool) = tokio::try_join!(
            self.dense_stage(&collection, query, dense_limit),
            self.lexical_stage(&collection, sparse_pool),
        )
        .map_err(unavailable)?;

        let sparse = bm25_scores(
            query,
            &pool.iter().map(|c| c.text.as_str()).collect::<Vec<_>>(),
            &self.params.bm25,
        );
        for (c, score) in pool.iter_mut().zip(sparse) {
            c.sparse_score = score;
        }
        let pool_size = pool.len();
        let lexical: Vec<Candidate> = pool.into_iter().filter(|c| c.sparse_score > 0.0).collect();

        let dense_rank = rank_by_score(&dense, |c| c.id.as_str(), |c| c.dense_score);
        let sparse_rank = rank_by_score(&lexical, |c| c.id.as_str(), |c| c.sparse_score);
        let fused = reciprocal_rank_fusion(&dense_rank, &sparse_rank, RRF_K);

        tracing::debug!(
            kb_id,
            dense = dense.len(),
            pool = pool_size,
            lexical = lexical.len(),
            "retrieval stages complete"
        );

        let mut merged = merge_candidates(dense, lexical);
        for c in merged.iter_mut() {
            c.final_score = fused.get(&c.id).copied().unwrap_or(0.0);
        }
        sort_desc(&mut merged);

        merged.truncate(top_k.max(rerank_top_n));
        self.rerank(query, &mut merged).await;
        merged.truncate(top_k);

        Ok(merged.into_iter().map(RetrievalResult::from).collect())
    }

    async fn dense_stage(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let hits = self.index.search(collection, &vector, limit).await?;
        Ok(hits
            .into_iter()
            .map(|h| {
                let mut c = Candidate::from_payload(h.id, h.payload);
                c.dense_score = h.score;
                c
            })
            .collect())
    }

    /// Bounded scan of up to `max_points` non-empty points.
    async fn lexical_stage(&self, collection: &str, max_points: usize) -> Result<Vec<Candidate>> {
        let mut gathered: Vec<Candidate> = Vec::new();
        let mut cursor: Option<String> = None;

        while gathered.len() < max_points {
            let limit = self
                .params
                .scroll_page_size
                .min(max_points - gathered.len());
            let page = self.index.scroll(collection, cursor.take(), limit).await?;
            if page.points.is_empty() {
                break;
            }
            for p in page.points {
                if p.payload.text.is_empty() {
                    continue;
                }
                gathered.push(Candidate::from_payload(p.id, p.payload));
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(gathered)
    }

    /// Cross-encoder pass over `candidates`. Any failure leaves the fused
    /// order untouched.
    async fn rerank(&self, query: &str, candidates: &mut [Candidate]) {
        let Some(ce) = &self.cross_encoder else {
            return;
        };
        if candidates.is_empty() || !ce.available().await {
            return;
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        match ce.score(query, &texts).await {
            Ok(scores) if scores.len() == candidates.len() => {
                for (c, s) in candidates.iter_mut().zip(scores) {
                    c.final_score += 2.0 * s;
                }
                sort_desc(candidates);
            }
            Ok(scores) => {
                tracing::warn!(
                    expected = candidates.len(),
                    got = scores.len(),
                    "cross-encoder returned wrong number of scores, keeping fused order"
                );
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "cross-encoder failed, keeping fused order");
            }
        }
    }
}

/// Union by id, dense hits first. On collision the dense entry is kept and
/// takes the larger lexical score.
fn merge_candidates(dense: Vec<Candidate>, lexical: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::with_capacity(dense.len() + lexical.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for c in dense.into_iter().chain(lexical) {
        match positions.get(&c.id) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                existing.sparse_score = existing.sparse_score.max(c.sparse_score);
            }
            None => {
                positions.insert(c.id.clone(), merged.len());
                merged.push(c);
            }
        }
    }
    merged
}

/// Stable: equal scores keep their order.
fn sort_desc(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
}

/// CLI entry point: retrieve and print results to stdout.
pub async fn run_search(
    retriever: &HybridRetriever,
    kb_id: i64,
    query: &str,
    opts: &RetrieveOptions,
    json: bool,
) -> Result<()> {
    let results = retriever.retrieve(kb_id, query, opts).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let source = result
            .metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("(unknown)");
        println!("{}. [{:.4}] {}", i + 1, result.score, source);
        println!(
            "    scoring: dense={:.3}  bm25={:.3}",
            result.dense_score, result.sparse_score
        );
        if let Some(doc_id) = result.doc_id {
            println!("    doc: {}", doc_id);
        }
        if let Some(idx) = result.metadata.get("chunk_index").and_then(|v| v.as_i64()) {
            println!("    chunk: {}", idx);
        }
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragnetic_core::models::PointPayload;

    fn cand(id: &str, dense: f64, sparse: f64) -> Candidate {
        let mut c = Candidate::from_payload(
            id,
            PointPayload {
                text: format!("text {}", id),
                ..Default::default()
            },
        );
        c.dense_score = dense;
        c.sparse_score = sparse;
        c
    }

    #[test]
    fn merge_keeps_dense_and_max_sparse() {
        let dense = vec![cand("a", 0.9, 0.0), cand("b", 0.5, 0.0)];
        let lexical = vec![cand("b", 0.0, 3.0), cand("c", 0.0, 1.0)];
        let merged = merge_candidates(dense, lexical);
        let ids: Vec<&str> = merged.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(merged[1].dense_score, 0.5);
        assert_eq!(merged[1].sparse_score, 3.0);
    }

    #[test]
    fn sort_is_stable_on_ties() {
        let mut cs = vec![cand("x", 0.0, 0.0), cand("y", 0.0, 0.0), cand("z", 0.0, 0.0)];
        cs[0].final_score = 0.1;
        cs[1].final_score = 0.2;
        cs[2].final_score = 0.1;
        sort_desc(&mut cs);
        let ids: Vec<&str> = cs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "x", "z"]);
    }

    #[test]
    fn options_fall_back_to_params() {
        assert_eq!(pick(None, 5), 5);
        assert_eq!(pick(Some(0), 5), 5);
        assert_eq!(pick(Some(3), 5), 3);
    }

    #[test]
    fn params_from_config() {
        let p = RetrievalParams::default();
        assert_eq!(p.top_k, 5);
        assert_eq!(p.dense_limit, 30);
        assert_eq!(p.sparse_pool, 800);
        assert_eq!(p.rerank_top_n, 12);
        assert_eq!(p.scroll_page_size, 128);
        assert_eq!(p.bm25, Bm25Params::default());
    }
}
