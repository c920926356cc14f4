//! Configuration parsing and validation.
//!
//! Ragnetic is configured via a TOML file (default `config/ragnetic.toml`).
//! Every section is optional and falls back to defaults, so an empty file
//! (or [`Config::minimal`]) gives a fully offline setup: the hashing
//! embedder, the in-memory vector index, and no reranker.
//!
//! # Example
//!
//! ```toml
//! [chunking]
//! max_chunk_chars = 600
//! overlap_chars = 80
//! min_chunk_chars = 180
//!
//! [retrieval]
//! top_k = 5
//! dense_limit = 30
//! sparse_pool = 800
//! rerank_top_n = 12
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [index]
//! backend = "qdrant"
//! url = "http://localhost:6333"
//!
//! [rerank]
//! provider = "http"
//! url = "http://localhost:8080"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use ragnetic_core::chunk::ChunkParams;
use ragnetic_core::lexical::Bm25Params;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// All defaults. Used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: default_overlap_chars(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ragnetic_core::Result<ChunkParams> {
        ChunkParams::new(self.max_chunk_chars, self.overlap_chars, self.min_chunk_chars)
    }
}

fn default_max_chunk_chars() -> usize {
    ChunkParams::DEFAULT_MAX_CHUNK_CHARS
}
fn default_overlap_chars() -> usize {
    ChunkParams::DEFAULT_OVERLAP_CHARS
}
fn default_min_chunk_chars() -> usize {
    ChunkParams::DEFAULT_MIN_CHUNK_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_dense_limit")]
    pub dense_limit: usize,
    #[serde(default = "default_sparse_pool")]
    pub sparse_pool: usize,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_scroll_page_size")]
    pub scroll_page_size: usize,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            dense_limit: default_dense_limit(),
            sparse_pool: default_sparse_pool(),
            rerank_top_n: default_rerank_top_n(),
            scroll_page_size: default_scroll_page_size(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
        }
    }
}

impl RetrievalConfig {
    pub fn bm25(&self) -> Bm25Params {
        Bm25Params {
            k1: self.bm25_k1,
            b: self.bm25_b,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_dense_limit() -> usize {
    30
}
fn default_sparse_pool() -> usize {
    800
}
fn default_rerank_top_n() -> usize {
    12
}
fn default_scroll_page_size() -> usize {
    128
}
fn default_bm25_k1() -> f64 {
    1.2
}
fn default_bm25_b() -> f64 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// HTTP-level retries inside the provider. Job retry belongs to `[worker]`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    0
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"memory"` or `"qdrant"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    /// Environment variable holding the Qdrant API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    #[serde(default = "default_embedding_version")]
    pub embedding_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_qdrant_url(),
            api_key_env: None,
            collection_prefix: default_collection_prefix(),
            embedding_version: default_embedding_version(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection_prefix() -> String {
    "ragnetic".to_string()
}
fn default_embedding_version() -> String {
    "v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `"disabled"`, `"http"`, or `"local"`.
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_provider() -> String {
    "disabled".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .params()
        .context("Invalid [chunking] section")?;

    let r = &config.retrieval;
    if r.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if r.dense_limit < 1 {
        bail!("retrieval.dense_limit must be >= 1");
    }
    if r.scroll_page_size < 1 {
        bail!("retrieval.scroll_page_size must be >= 1");
    }
    if r.bm25_k1 < 0.0 || !(0.0..=1.0).contains(&r.bm25_b) {
        bail!("retrieval.bm25_k1 must be >= 0 and retrieval.bm25_b in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.index.backend.as_str() {
        "memory" | "qdrant" => {}
        other => bail!("Unknown index backend: '{}'. Must be memory or qdrant.", other),
    }

    match config.rerank.provider.as_str() {
        "disabled" | "local" => {}
        "http" => {
            if config.rerank.url.is_none() {
                bail!("rerank.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }

    if config.worker.concurrency < 1 {
        bail!("worker.concurrency must be >= 1");
    }
    if config.worker.max_attempts < 1 {
        bail!("worker.max_attempts must be >= 1");
    }

    Ok(())
}
