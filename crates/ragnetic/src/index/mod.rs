//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only surface the retrieval engine and
//! the ingestion pipeline see. Each knowledge base gets its own collection,
//! named by [`CollectionNaming`]; changing the embedding model means bumping
//! the version suffix so old and new vectors never mix.
//!
//! Implementations must be `Send + Sync` and own their own timeouts.
//! Failures are reported as `anyhow` errors and classified by the caller.

pub mod memory;
pub mod qdrant;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use ragnetic_core::models::{IndexedPoint, PointPayload};

use crate::config::IndexConfig;

pub use memory::InMemoryIndex;
pub use qdrant::QdrantIndex;

/// A dense search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: PointPayload,
}

/// A point returned by a scan, without its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: String,
    pub payload: PointPayload,
}

/// One page of a scan. `next_cursor` is `None` once the collection is exhausted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    pub next_cursor: Option<String>,
}

/// Abstract vector index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_collection`](VectorIndex::ensure_collection) | Create the KB's collection if missing; return its name |
/// | [`upsert`](VectorIndex::upsert) | Insert or replace points by id |
/// | [`search`](VectorIndex::search) | Top-`limit` points by cosine similarity |
/// | [`scroll`](VectorIndex::scroll) | Cursor-paginated scan of stored points |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent: calling it for an existing collection only returns the name.
    async fn ensure_collection(&self, kb_id: i64) -> Result<String>;

    async fn upsert(&self, collection: &str, points: Vec<IndexedPoint>) -> Result<()>;

    async fn search(&self, collection: &str, vector: &[f32], limit: usize)
        -> Result<Vec<ScoredPoint>>;

    /// Read up to `limit` points starting at `cursor` (`None` = from the start).
    async fn scroll(&self, collection: &str, cursor: Option<String>, limit: usize)
        -> Result<ScrollPage>;
}

/// Collection naming scheme: `"{prefix}_kb{kb_id}_{version}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNaming {
    pub prefix: String,
    pub version: String,
}

impl CollectionNaming {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn name(&self, kb_id: i64) -> String {
        format!("{}_kb{}_{}", self.prefix, kb_id, self.version)
    }
}

impl Default for CollectionNaming {
    fn default() -> Self {
        Self::new("ragnetic", "v1")
    }
}

/// Build the configured index. `dims` is the embedding dimensionality new
/// collections are created with.
pub fn create_index(config: &IndexConfig, dims: usize) -> Result<Arc<dyn VectorIndex>> {
    let naming = CollectionNaming::new(&config.collection_prefix, &config.embedding_version);
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryIndex::new(naming))),
        "qdrant" => Ok(Arc::new(QdrantIndex::new(config, naming, dims)?)),
        other => bail!("Unknown index backend: {}", other),
    }
}
