//! Document records and raw object storage.
//!
//! The relational document table and the blob store are external
//! collaborators; this module defines the narrow async interfaces the
//! ingestion pipeline and the upload intake need, plus in-memory and
//! filesystem implementations.
//!
//! Implementations take `std::sync` locks only around map operations and
//! never hold them across an `.await`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use ragnetic_core::models::DocumentStatus;

/// An uploaded document as stored by the document collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub kb_id: i64,
    pub filename: String,
    pub object_key: String,
    pub content_hash: Option<String>,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<DocumentRecord>>;

    /// Set `status`; `error` replaces any previous error message.
    async fn set_status(&self, id: i64, status: DocumentStatus, error: Option<String>)
        -> Result<()>;

    /// First document in `kb_id` with `content_hash == hash` whose status is
    /// one of `statuses`.
    async fn find_by_hash(
        &self,
        kb_id: i64,
        hash: &str,
        statuses: &[DocumentStatus],
    ) -> Result<Option<DocumentRecord>>;

    /// Create a `Pending` record and return it.
    async fn create(
        &self,
        kb_id: i64,
        filename: &str,
        object_key: &str,
        content_hash: Option<String>,
    ) -> Result<DocumentRecord>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("document store lock poisoned")
}

// ============ In-memory document store ============

pub struct InMemoryDocumentStore {
    next_id: AtomicI64,
    docs: RwLock<HashMap<i64, DocumentRecord>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            docs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self.docs.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: i64,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("document {} not found", id))?;
        doc.status = status;
        doc.error_message = error;
        Ok(())
    }

    async fn find_by_hash(
        &self,
        kb_id: i64,
        hash: &str,
        statuses: &[DocumentStatus],
    ) -> Result<Option<DocumentRecord>> {
        let docs = self.docs.read().map_err(poisoned)?;
        // Newest first.
        Ok(docs
            .values()
            .filter(|d| {
                d.kb_id == kb_id
                    && d.content_hash.as_deref() == Some(hash)
                    && statuses.contains(&d.status)
            })
            .max_by_key(|d| d.id)
            .cloned())
    }

    async fn create(
        &self,
        kb_id: i64,
        filename: &str,
        object_key: &str,
        content_hash: Option<String>,
    ) -> Result<DocumentRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = DocumentRecord {
            id,
            kb_id,
            filename: filename.to_string(),
            object_key: object_key.to_string(),
            content_hash,
            status: DocumentStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
        };
        self.docs
            .write()
            .map_err(poisoned)?
            .insert(id, record.clone());
        Ok(record)
    }
}

// ============ In-memory object storage ============

#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(poisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object '{}' not found", key))
    }

    async fn write(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

// ============ Filesystem object storage ============

/// Objects stored as files under a root directory, keyed by relative path.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `key` under the root, rejecting absolute paths and `..`.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object key '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {}", path.display()))
    }

    async fn write(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", path.display()))
    }
}
