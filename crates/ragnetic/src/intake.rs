//! Upload intake: content-hash dedup, raw object write, job enqueue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use ragnetic_core::models::DocumentStatus;

use crate::documents::{DocumentStore, ObjectStorage};

/// Statuses under which an existing upload with the same bytes is reused.
const LIVE_STATUSES: [DocumentStatus; 3] = [
    DocumentStatus::Pending,
    DocumentStatus::Processing,
    DocumentStatus::Indexed,
];

/// Accepts ingestion jobs. Implemented by [`WorkerHandle`](crate::worker::WorkerHandle).
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, document_id: i64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub document_id: i64,
    /// True when an identical live upload already existed and no job was queued.
    pub deduplicated: bool,
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

type ContentKey = (i64, String);

pub struct Intake {
    docs: Arc<dyn DocumentStore>,
    storage: Arc<dyn ObjectStorage>,
    queue: Arc<dyn JobQueue>,
    /// One lock per (kb_id, hash) with a submit in flight.
    in_flight: Mutex<HashMap<ContentKey, Arc<AsyncMutex<()>>>>,
}

impl Intake {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        storage: Arc<dyn ObjectStorage>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            docs,
            storage,
            queue,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Store `bytes` as a new document in `kb_id` and queue it for ingestion.
    ///
    /// A document in the same knowledge base with identical content that is
    /// pending, processing, or indexed is returned instead. Failed uploads
    /// do not block a re-upload. Concurrent submits of the same content to
    /// one `Intake` are serialised, so only one of them creates a document.
    pub async fn submit(
        &self,
        kb_id: i64,
        filename: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadReceipt> {
        let hash = content_hash(bytes);
        let key_lock = self.content_lock(kb_id, &hash)?;
        let result = {
            let _guard = key_lock.lock().await;
            self.submit_exclusive(kb_id, filename, bytes, content_type, hash)
                .await
        };
        drop(key_lock);
        self.release_idle_locks();
        result
    }

    fn content_lock(&self, kb_id: i64, hash: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("intake lock poisoned"))?;
        Ok(in_flight
            .entry((kb_id, hash.to_string()))
            .or_default()
            .clone())
    }

    fn release_idle_locks(&self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
    }

    async fn submit_exclusive(
        &self,
        kb_id: i64,
        filename: &str,
        bytes: &[u8],
        content_type: &str,
        hash: String,
    ) -> Result<UploadReceipt> {
        if let Some(existing) = self.docs.find_by_hash(kb_id, &hash, &LIVE_STATUSES).await? {
            tracing::warn!(
                kb_id,
                filename,
                existing_id = existing.id,
                existing_status = %existing.status,
                "duplicate upload, reusing existing document"
            );
            return Ok(UploadReceipt {
                document_id: existing.id,
                deduplicated: true,
            });
        }

        let object_key = format!("uploads/{}/{}", Uuid::new_v4().simple(), filename);
        self.storage
            .write(&object_key, bytes, content_type)
            .await
            .with_context(|| format!("Failed to store upload {}", filename))?;
        let doc = self
            .docs
            .create(kb_id, filename, &object_key, Some(hash))
            .await?;

        // A pending record nobody will process would swallow every re-upload.
        if let Err(e) = self.queue.enqueue(doc.id) {
            if let Err(status_err) = self
                .docs
                .set_status(doc.id, DocumentStatus::Failed, Some(e.to_string()))
                .await
            {
                tracing::warn!(
                    document_id = doc.id,
                    error = %status_err,
                    "could not mark unqueued document as failed"
                );
            }
            return Err(e.context(format!("Failed to queue {}", filename)));
        }
        tracing::info!(kb_id, document_id = doc.id, filename, "upload accepted");

        Ok(UploadReceipt {
            document_id: doc.id,
            deduplicated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{InMemoryDocumentStore, InMemoryObjectStorage};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue(Mutex<Vec<i64>>);

    impl JobQueue for RecordingQueue {
        fn enqueue(&self, document_id: i64) -> Result<()> {
            self.0.lock().unwrap().push(document_id);
            Ok(())
        }
    }

    fn intake() -> (Intake, Arc<InMemoryDocumentStore>, Arc<InMemoryObjectStorage>, Arc<RecordingQueue>) {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let queue = Arc::new(RecordingQueue::default());
        (
            Intake::new(docs.clone(), storage.clone(), queue.clone()),
            docs,
            storage,
            queue,
        )
    }

    #[test]
    fn content_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn new_upload_is_stored_and_queued() {
        let (intake, docs, storage, queue) = intake();
        let receipt = intake.submit(3, "faq.md", b"# FAQ", "text/markdown").await.unwrap();
        assert!(!receipt.deduplicated);

        let doc = docs.get(receipt.document_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.kb_id, 3);
        assert!(doc.object_key.starts_with("uploads/"));
        assert!(doc.object_key.ends_with("/faq.md"));
        assert_eq!(doc.content_hash.as_deref(), Some(content_hash(b"# FAQ").as_str()));
        assert_eq!(storage.read(&doc.object_key).await.unwrap(), b"# FAQ");
        assert_eq!(*queue.0.lock().unwrap(), vec![receipt.document_id]);
    }

    #[tokio::test]
    async fn identical_live_upload_is_deduplicated() {
        let (intake, docs, _storage, queue) = intake();
        let first = intake.submit(1, "a.txt", b"same", "text/plain").await.unwrap();
        let second = intake.submit(1, "b.txt", b"same", "text/plain").await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.document_id, first.document_id);
        assert_eq!(queue.0.lock().unwrap().len(), 1);

        // Other knowledge bases are independent.
        let other = intake.submit(2, "a.txt", b"same", "text/plain").await.unwrap();
        assert!(!other.deduplicated);

        // A failed upload can be retried with the same bytes.
        docs.set_status(first.document_id, DocumentStatus::Failed, Some("x".into()))
            .await
            .unwrap();
        let retry = intake.submit(1, "a.txt", b"same", "text/plain").await.unwrap();
        assert!(!retry.deduplicated);
        assert_ne!(retry.document_id, first.document_id);
    }

    struct ClosedQueue;

    impl JobQueue for ClosedQueue {
        fn enqueue(&self, _document_id: i64) -> Result<()> {
            anyhow::bail!("ingest worker is shut down")
        }
    }

    #[tokio::test]
    async fn failed_enqueue_does_not_block_reupload() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let closed = Intake::new(docs.clone(), storage.clone(), Arc::new(ClosedQueue));

        let err = closed.submit(1, "a.txt", b"same", "text/plain").await.unwrap_err();
        assert!(format!("{:#}", err).contains("shut down"));
        let orphan = docs.get(1).await.unwrap().unwrap();
        assert_eq!(orphan.status, DocumentStatus::Failed);
        assert!(orphan.error_message.unwrap().contains("shut down"));

        let queue = Arc::new(RecordingQueue::default());
        let open = Intake::new(docs.clone(), storage, queue.clone());
        let receipt = open.submit(1, "a.txt", b"same", "text/plain").await.unwrap();
        assert!(!receipt.deduplicated);
        assert_ne!(receipt.document_id, orphan.id);
        assert_eq!(*queue.0.lock().unwrap(), vec![receipt.document_id]);
    }

    /// Storage that yields before writing so concurrent submits interleave.
    struct YieldingStorage(InMemoryObjectStorage);

    #[async_trait::async_trait]
    impl ObjectStorage for YieldingStorage {
        async fn read(&self, key: &str) -> Result<Vec<u8>> {
            self.0.read(key).await
        }
        async fn write(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.write(key, bytes, content_type).await
        }
    }

    #[tokio::test]
    async fn concurrent_identical_uploads_create_one_document() {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let storage = Arc::new(YieldingStorage(InMemoryObjectStorage::new()));
        let queue = Arc::new(RecordingQueue::default());
        let intake = Intake::new(docs, storage, queue.clone());

        let (a, b) = tokio::join!(
            intake.submit(1, "a.txt", b"same", "text/plain"),
            intake.submit(1, "b.txt", b"same", "text/plain"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.document_id, b.document_id);
        assert_eq!([a.deduplicated, b.deduplicated].iter().filter(|d| **d).count(), 1);
        assert_eq!(queue.0.lock().unwrap().len(), 1);
        assert!(intake.in_flight.lock().unwrap().is_empty());
    }
}
