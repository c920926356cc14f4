//! Optional cross-encoder reranking.
//!
//! A cross-encoder scores `(query, passage)` pairs jointly and is far more
//! precise than either retrieval signal, but also far more expensive, so
//! it only ever sees the top of the fused list.
//!
//! The retriever owns an `Option<Arc<dyn CrossEncoder>>`. Heavy local models
//! are wrapped in [`LazyCrossEncoder`], which builds the model on first use
//! and reports itself unavailable if that fails; the search then falls back
//! to fused scores.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::config::RerankConfig;

/// Joint relevance scorer for `(query, text)` pairs.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Whether the model can be used. May trigger lazy construction.
    async fn available(&self) -> bool;

    /// One score per text, in input order. Higher is more relevant.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f64>>;
}

type Factory = Arc<dyn Fn() -> Result<Arc<dyn CrossEncoder>> + Send + Sync>;

/// Builds the wrapped cross-encoder at most once, on the blocking pool.
///
/// A failed build is remembered: the encoder stays unavailable for the
/// lifetime of this value instead of retrying on every query.
pub struct LazyCrossEncoder {
    factory: Factory,
    cell: OnceCell<Option<Arc<dyn CrossEncoder>>>,
}

impl LazyCrossEncoder {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CrossEncoder>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            cell: OnceCell::new(),
        }
    }

    async fn get(&self) -> Option<&Arc<dyn CrossEncoder>> {
        self.cell
            .get_or_init(|| async {
                let factory = self.factory.clone();
                match tokio::task::spawn_blocking(move || factory()).await {
                    Ok(Ok(encoder)) => Some(encoder),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %format!("{:#}", e), "cross-encoder unavailable");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cross-encoder construction panicked");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }
}

#[async_trait]
impl CrossEncoder for LazyCrossEncoder {
    async fn available(&self) -> bool {
        match self.get().await {
            Some(inner) => inner.available().await,
            None => false,
        }
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        match self.get().await {
            Some(inner) => inner.score(query, texts).await,
            None => bail!("cross-encoder unavailable"),
        }
    }
}

// ============ HTTP (text-embeddings-inference) ============

/// Cross-encoder served over HTTP with the text-embeddings-inference
/// `POST /rerank` contract.
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

#[derive(Deserialize)]
struct RerankHit {
    index: usize,
    score: f64,
}

impl HttpCrossEncoder {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build rerank HTTP client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

/// Put server hits back in input order; texts the server skipped score 0.
fn scores_in_order(hits: Vec<RerankHit>, len: usize) -> Result<Vec<f64>> {
    let mut scores = vec![0.0; len];
    for hit in hits {
        if hit.index >= len {
            bail!("rerank response index {} out of range ({} texts)", hit.index, len);
        }
        scores[hit.index] = hit.score;
    }
    Ok(scores)
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn available(&self) -> bool {
        true
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(format!("{}/rerank", self.url))
            .json(&RerankRequest {
                query,
                texts,
                raw_scores: false,
            })
            .send()
            .await
            .with_context(|| format!("rerank service unreachable at {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("rerank API error {}: {}", status, body);
        }
        let hits: Vec<RerankHit> = resp.json().await.context("invalid rerank response")?;
        scores_in_order(hits, texts.len())
    }
}

// ============ Local (fastembed) ============

/// In-process cross-encoder via fastembed's `TextRerank`.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalCrossEncoder {
    model: Arc<std::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalCrossEncoder {
    /// Loads (downloading on first use) the named model. Blocking.
    pub fn new(model_name: &str) -> Result<Self> {
        let model = match model_name {
            "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
            "bge-reranker-v2-m3" => fastembed::RerankerModel::BGERerankerV2M3,
            "jina-reranker-v1-turbo-en" => fastembed::RerankerModel::JINARerankerV1TurboEn,
            other => bail!(
                "Unknown local rerank model: '{}'. Supported models: \
                 bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en",
                other
            ),
        };
        let reranker = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local rerank model: {}", e))?;
        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(reranker)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl CrossEncoder for LocalCrossEncoder {
    async fn available(&self) -> bool {
        true
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let model = self.model.clone();
        let query = query.to_string();
        let texts = texts.to_vec();
        let len = texts.len();

        let results = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local rerank model lock poisoned"))?;
            let docs: Vec<&str> = texts.iter().map(String::as_str).collect();
            model
                .rerank(query.as_str(), docs, false, None)
                .map_err(|e| anyhow::anyhow!("Local rerank failed: {}", e))
        })
        .await??;

        let hits = results
            .into_iter()
            .map(|r| RerankHit {
                index: r.index,
                score: f64::from(r.score),
            })
            .collect();
        scores_in_order(hits, len)
    }
}

/// Build the configured cross-encoder, or `None` when reranking is disabled.
///
/// | Config Value | Encoder |
/// |-------------|---------|
/// | `"disabled"` | none |
/// | `"http"` | [`HttpCrossEncoder`] at `rerank.url` |
/// | `"local"` | `LocalCrossEncoder` behind [`LazyCrossEncoder`] (feature `local-embeddings-fastembed`) |
pub fn create_cross_encoder(config: &RerankConfig) -> Result<Option<Arc<dyn CrossEncoder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("rerank.url required for http provider"))?;
            Ok(Some(Arc::new(HttpCrossEncoder::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?)))
        }
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => {
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| "bge-reranker-base".to_string());
            Ok(Some(Arc::new(LazyCrossEncoder::new(move || {
                Ok(Arc::new(LocalCrossEncoder::new(&model)?) as Arc<dyn CrossEncoder>)
            }))))
        }
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local rerank provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown rerank provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LengthScorer;

    #[async_trait]
    impl CrossEncoder for LengthScorer {
        async fn available(&self) -> bool {
            true
        }
        async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f64>> {
            Ok(texts.iter().map(|t| t.len() as f64).collect())
        }
    }

    #[tokio::test]
    async fn lazy_builds_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let lazy = LazyCrossEncoder::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LengthScorer) as Arc<dyn CrossEncoder>)
        });
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert!(lazy.available().await);
        let scores = lazy
            .score("q", &["ab".to_string(), "abcd".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![2.0, 4.0]);
        assert!(lazy.available().await);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lazy_failure_marks_unavailable() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let lazy = LazyCrossEncoder::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            bail!("model download failed")
        });
        assert!(!lazy.available().await);
        assert!(!lazy.available().await);
        assert!(lazy.score("q", &["x".to_string()]).await.is_err());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_hits_reordered_by_index() {
        let hits = vec![
            RerankHit { index: 2, score: 0.1 },
            RerankHit { index: 0, score: 0.9 },
        ];
        assert_eq!(scores_in_order(hits, 3).unwrap(), vec![0.9, 0.0, 0.1]);
        assert!(scores_in_order(vec![RerankHit { index: 5, score: 1.0 }], 2).is_err());
    }

    #[test]
    fn create_dispatch() {
        let mut config = RerankConfig::default();
        assert!(create_cross_encoder(&config).unwrap().is_none());
        config.provider = "http".to_string();
        assert!(create_cross_encoder(&config).is_err());
        config.url = Some("http://localhost:8080".to_string());
        assert!(create_cross_encoder(&config).unwrap().is_some());
        config.provider = "cohere".to_string();
        assert!(create_cross_encoder(&config).is_err());
    }
}
