//! Ingestion pipeline orchestration.
//!
//! Coordinates one document through fetch → parse → chunk → embed → index,
//! moving its status `pending → processing → {indexed, failed}` and emitting
//! a progress event after each stage. Every collaborator failure is
//! classified into a [`RagError`] by the stage that produced it, and
//! [`IngestionPipeline::run_job`] decides from that kind whether the job
//! is finished or worth retrying.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use ragnetic_core::chunk::{chunk_text, ChunkParams};
use ragnetic_core::error::RagError;
use ragnetic_core::models::{DocumentStatus, IndexedPoint, Metadata, PointPayload};

use crate::documents::{DocumentStore, ObjectStorage};
use crate::embedding::EmbeddingProvider;
use crate::extract::DocumentParser;
use crate::index::VectorIndex;
use crate::progress::{IngestProgress, IngestStage, NoProgress, ProgressReporter};

/// Outcome of one ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub chunks_indexed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct IngestionPipeline {
    docs: Arc<dyn DocumentStore>,
    storage: Arc<dyn ObjectStorage>,
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    chunk_params: ChunkParams,
    progress: Arc<dyn ProgressReporter>,
}

impl IngestionPipeline {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        storage: Arc<dyn ObjectStorage>,
        parser: Arc<dyn DocumentParser>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        chunk_params: ChunkParams,
    ) -> Self {
        Self {
            docs,
            storage,
            parser,
            embedder,
            index,
            chunk_params,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    fn emit(&self, document_id: i64, stage: IngestStage) {
        self.progress.report(IngestProgress::new(document_id, stage));
    }

    /// Best-effort status write: a failure is logged and never aborts the job.
    async fn set_status(&self, document_id: i64, status: DocumentStatus, error: Option<String>) {
        if let Err(e) = self.docs.set_status(document_id, status, error).await {
            tracing::warn!(
                document_id,
                status = %status,
                error = %format!("{:#}", e),
                "failed to update document status"
            );
        }
    }

    /// Run every stage for `document_id`.
    ///
    /// On success the document is `indexed` and the report carries the
    /// number of points written (zero when the parsed text has no content).
    /// On error the status is left at `processing`; [`run_job`](Self::run_job)
    /// is the entry point that records failures.
    pub async fn process(&self, document_id: i64) -> Result<IngestReport, RagError> {
        self.emit(document_id, IngestStage::Started);
        self.set_status(document_id, DocumentStatus::Processing, None)
            .await;
        tracing::info!(document_id, "ingestion started");

        let doc = self
            .docs
            .get(document_id)
            .await
            .map_err(|e| RagError::StorageUnavailable(format!("{:#}", e)))?
            .ok_or(RagError::DocumentNotFound(document_id))?;

        let bytes = self
            .storage
            .read(&doc.object_key)
            .await
            .map_err(|e| RagError::StorageUnavailable(format!("{:#}", e)))?;
        self.emit(document_id, IngestStage::Fetched);
        tracing::debug!(document_id, bytes = bytes.len(), "fetched object");

        let parser = self.parser.clone();
        let filename = doc.filename.clone();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&bytes, &filename))
            .await
            .map_err(|e| RagError::ParseFailure(format!("parser task failed: {}", e)))?
            .map_err(|e| RagError::ParseFailure(format!("{:#}", e)))?;
        self.emit(document_id, IngestStage::Parsed);

        let mut base = Metadata::new();
        base.insert("source".to_string(), doc.filename.clone().into());
        base.insert("doc_id".to_string(), document_id.into());
        base.extend(parsed.metadata);

        let chunks = chunk_text(&parsed.text, &self.chunk_params, &base);
        tracing::debug!(document_id, chunks = chunks.len(), "chunked");
        if chunks.is_empty() {
            self.set_status(document_id, DocumentStatus::Indexed, None)
                .await;
            self.emit(document_id, IngestStage::Indexed);
            tracing::info!(document_id, "no content to index");
            return Ok(IngestReport {
                document_id,
                status: DocumentStatus::Indexed,
                chunks_indexed: 0,
                error: None,
            });
        }
        self.emit(document_id, IngestStage::Chunked);

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| RagError::EmbeddingFailure(format!("{:#}", e)))?;
        if vectors.len() != chunks.len() {
            return Err(RagError::EmbeddingFailure(format!(
                "embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        self.emit(document_id, IngestStage::Embedded);

        let collection = self
            .index
            .ensure_collection(doc.kb_id)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("{:#}", e)))?;
        let points: Vec<IndexedPoint> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedPoint {
                id: Uuid::new_v4().to_string(),
                vector,
                payload: PointPayload {
                    text: chunk.text,
                    metadata: chunk.metadata,
                    doc_id: Some(document_id),
                },
            })
            .collect();
        let count = points.len();
        self.index
            .upsert(&collection, points)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("{:#}", e)))?;
        self.emit(document_id, IngestStage::Indexed);

        self.set_status(document_id, DocumentStatus::Indexed, None)
            .await;
        tracing::info!(document_id, collection = %collection, points = count, "document indexed");

        Ok(IngestReport {
            document_id,
            status: DocumentStatus::Indexed,
            chunks_indexed: count,
            error: None,
        })
    }

    /// Job-runner boundary around [`process`](Self::process).
    ///
    /// Every failure marks the document `failed` with the error message.
    /// Job-fatal kinds (storage, parse, missing document) then resolve to
    /// `Ok` with a failed report; retryable kinds return `Err` so the
    /// caller can apply its retry policy.
    pub async fn run_job(&self, document_id: i64) -> Result<IngestReport, RagError> {
        match self.process(document_id).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(document_id, error = %message, "ingestion failed");
                self.set_status(document_id, DocumentStatus::Failed, Some(message.clone()))
                    .await;
                self.emit(document_id, IngestStage::Failed);
                if e.is_job_fatal() {
                    Ok(IngestReport {
                        document_id,
                        status: DocumentStatus::Failed,
                        chunks_indexed: 0,
                        error: Some(message),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{InMemoryDocumentStore, InMemoryObjectStorage};
    use crate::embedding::HashingProvider;
    use crate::extract::FormatParser;
    use crate::index::{CollectionNaming, InMemoryIndex};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(i64, u8)>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: IngestProgress) {
            self.0.lock().unwrap().push((event.document_id, event.percent));
        }
    }

    struct ShortEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ShortEmbedder {
        fn model_name(&self) -> &str {
            "short"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0, 0.0, 0.0]])
        }
    }

    struct Fixture {
        docs: Arc<InMemoryDocumentStore>,
        storage: Arc<InMemoryObjectStorage>,
        index: Arc<InMemoryIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                docs: Arc::new(InMemoryDocumentStore::new()),
                storage: Arc::new(InMemoryObjectStorage::new()),
                index: Arc::new(InMemoryIndex::new(CollectionNaming::default())),
            }
        }

        fn pipeline(&self, embedder: Arc<dyn EmbeddingProvider>) -> IngestionPipeline {
            IngestionPipeline::new(
                self.docs.clone(),
                self.storage.clone(),
                Arc::new(FormatParser),
                embedder,
                self.index.clone(),
                ChunkParams::new(120, 20, 40).unwrap(),
            )
        }

        async fn upload(&self, kb_id: i64, filename: &str, body: &[u8]) -> i64 {
            let key = format!("uploads/test/{}", filename);
            self.storage.write(&key, body, "text/plain").await.unwrap();
            self.docs.create(kb_id, filename, &key, None).await.unwrap().id
        }
    }

    fn sample_text() -> String {
        (0..6)
            .map(|i| format!("Paragraph {} talks about shipping rates and delivery windows.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn indexes_chunks_with_source_metadata() {
        let fx = Fixture::new();
        let id = fx.upload(4, "shipping.md", sample_text().as_bytes()).await;
        let recorder = Arc::new(Recorder::default());
        let pipeline = fx
            .pipeline(Arc::new(HashingProvider::new(32)))
            .with_progress(recorder.clone());

        let report = pipeline.run_job(id).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Indexed);
        assert!(report.chunks_indexed > 1);

        let collection = fx.index.collection_name(4);
        assert_eq!(fx.index.point_count(&collection), report.chunks_indexed);

        let page = fx.index.scroll(&collection, None, 100).await.unwrap();
        let first = &page.points[0].payload;
        assert_eq!(first.doc_id, Some(id));
        assert_eq!(first.metadata["source"].as_str(), Some("shipping.md"));
        assert_eq!(first.metadata["doc_id"].as_i64(), Some(id));
        assert_eq!(first.metadata["format"].as_str(), Some("md"));

        let percents: Vec<u8> = recorder.0.lock().unwrap().iter().map(|(_, p)| *p).collect();
        assert_eq!(percents, vec![0, 10, 30, 50, 70, 100]);

        let doc = fx.docs.get(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
    }

    #[tokio::test]
    async fn vector_count_mismatch_is_embedding_failure() {
        let fx = Fixture::new();
        let id = fx.upload(1, "notes.txt", sample_text().as_bytes()).await;
        let pipeline = fx.pipeline(Arc::new(ShortEmbedder));

        let err = pipeline.run_job(id).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailure(_)));
        assert!(err.is_retryable());

        let doc = fx.docs.get(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error_message.unwrap().contains("vectors for"));
        assert_eq!(fx.index.point_count(&fx.index.collection_name(1)), 0);
    }

    #[tokio::test]
    async fn missing_document_is_job_fatal() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(HashingProvider::new(8)));

        assert!(matches!(
            pipeline.process(42).await.unwrap_err(),
            RagError::DocumentNotFound(42)
        ));
        let report = pipeline.run_job(42).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("document 42 not found"));
    }

    #[tokio::test]
    async fn missing_object_is_storage_failure() {
        let fx = Fixture::new();
        let doc = fx.docs.create(1, "gone.txt", "uploads/x/gone.txt", None).await.unwrap();
        let pipeline = fx.pipeline(Arc::new(HashingProvider::new(8)));

        let report = pipeline.run_job(doc.id).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert!(report.error.unwrap().starts_with("storage unavailable"));
    }
}
