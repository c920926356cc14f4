//! Background ingestion worker.
//!
//! Document ids arrive on an unbounded queue; a dispatcher task runs up to
//! `concurrency` jobs at once, each job strictly sequential inside
//! [`IngestionPipeline::run_job`]. Retryable failures are re-run up to
//! `max_attempts` times in total with exponential backoff. Re-running a job
//! regenerates the same chunks under fresh point ids; points left by a
//! partially failed attempt are not cleaned up.
//!
//! Every finished job publishes its final [`IngestReport`] on a broadcast
//! channel. Subscribe before enqueueing to be sure of seeing a report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;

use ragnetic_core::models::DocumentStatus;

use crate::config::WorkerConfig;
use crate::ingest::{IngestReport, IngestionPipeline};
use crate::intake::JobQueue;

const REPORT_CHANNEL_CAPACITY: usize = 1024;

pub struct IngestWorker;

impl IngestWorker {
    /// Start the dispatcher on the current tokio runtime.
    pub fn spawn(pipeline: Arc<IngestionPipeline>, config: WorkerConfig) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let dispatcher = tokio::spawn(dispatch(pipeline, config, rx, reports.clone()));
        tracing::debug!(
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            "ingest worker started"
        );
        WorkerHandle {
            tx: Mutex::new(Some(tx)),
            reports,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}

pub struct WorkerHandle {
    tx: Mutex<Option<mpsc::UnboundedSender<i64>>>,
    reports: broadcast::Sender<IngestReport>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn enqueue(&self, document_id: i64) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| anyhow!("worker queue lock poisoned"))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(document_id)
                .map_err(|_| anyhow!("ingest worker has stopped")),
            None => Err(anyhow!("ingest worker is shut down")),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestReport> {
        self.reports.subscribe()
    }

    /// Close the queue and wait for every queued and in-flight job.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::warn!(error = %e, "ingest dispatcher ended abnormally");
            }
        }
    }
}

impl JobQueue for WorkerHandle {
    fn enqueue(&self, document_id: i64) -> Result<()> {
        WorkerHandle::enqueue(self, document_id)
    }
}

async fn dispatch(
    pipeline: Arc<IngestionPipeline>,
    config: WorkerConfig,
    mut rx: mpsc::UnboundedReceiver<i64>,
    reports: broadcast::Sender<IngestReport>,
) {
    let concurrency = config.concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(document_id) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let pipeline = pipeline.clone();
        let reports = reports.clone();
        tokio::spawn(async move {
            let report = run_with_retries(&pipeline, document_id, config).await;
            // No subscribers is fine.
            let _ = reports.send(report);
            drop(permit);
        });
    }

    // Queue closed: every permit back means every job has finished.
    let _ = permits.acquire_many(concurrency as u32).await;
    tracing::debug!("ingest worker drained");
}

async fn run_with_retries(
    pipeline: &IngestionPipeline,
    document_id: i64,
    config: WorkerConfig,
) -> IngestReport {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match pipeline.run_job(document_id).await {
            Ok(report) => return report,
            Err(e) if attempt < max_attempts => {
                let delay = config
                    .retry_backoff_ms
                    .saturating_mul(1u64 << (attempt - 1).min(10));
                tracing::warn!(
                    document_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay,
                    error = %e,
                    "ingestion failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(document_id, attempts = attempt, error = %e, "ingestion gave up");
                return IngestReport {
                    document_id,
                    status: DocumentStatus::Failed,
                    chunks_indexed: 0,
                    error: Some(e.to_string()),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{DocumentStore, InMemoryDocumentStore, InMemoryObjectStorage, ObjectStorage};
    use crate::embedding::{EmbeddingProvider, HashingProvider};
    use crate::extract::FormatParser;
    use crate::index::{CollectionNaming, InMemoryIndex};
    use async_trait::async_trait;
    use ragnetic_core::chunk::ChunkParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then embeds by hashing.
    struct FlakyEmbedder {
        failures: usize,
        calls: AtomicUsize,
        inner: HashingProvider,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("503 from embedding service");
            }
            self.inner.embed(texts).await
        }
    }

    async fn setup(failures: usize) -> (Arc<IngestionPipeline>, Arc<InMemoryDocumentStore>, Vec<i64>) {
        let docs = Arc::new(InMemoryDocumentStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let mut ids = Vec::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let key = format!("uploads/t/{}", name);
            storage
                .write(&key, format!("Contents of {}.", name).as_bytes(), "text/plain")
                .await
                .unwrap();
            ids.push(docs.create(1, name, &key, None).await.unwrap().id);
        }
        let pipeline = IngestionPipeline::new(
            docs.clone(),
            storage,
            Arc::new(FormatParser),
            Arc::new(FlakyEmbedder {
                failures,
                calls: AtomicUsize::new(0),
                inner: HashingProvider::new(16),
            }),
            Arc::new(InMemoryIndex::new(CollectionNaming::default())),
            ChunkParams::default(),
        );
        (Arc::new(pipeline), docs, ids)
    }

    fn config(max_attempts: u32) -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_attempts,
            retry_backoff_ms: 0,
        }
    }

    async fn collect(rx: &mut broadcast::Receiver<IngestReport>, n: usize) -> Vec<IngestReport> {
        let mut out = Vec::new();
        while out.len() < n {
            out.push(rx.recv().await.unwrap());
        }
        out.sort_by_key(|r| r.document_id);
        out
    }

    #[tokio::test]
    async fn runs_all_jobs_and_publishes_reports() {
        let (pipeline, docs, ids) = setup(0).await;
        let worker = IngestWorker::spawn(pipeline, config(1));
        let mut rx = worker.subscribe();
        for id in &ids {
            worker.enqueue(*id).unwrap();
        }
        let reports = collect(&mut rx, ids.len()).await;
        worker.shutdown().await;

        assert!(reports
            .iter()
            .all(|r| r.status == DocumentStatus::Indexed && r.chunks_indexed == 1));
        for id in ids {
            let doc = docs.get(id).await.unwrap().unwrap();
            assert_eq!(doc.status, DocumentStatus::Indexed);
        }
    }

    #[tokio::test]
    async fn retryable_failure_is_retried() {
        let (pipeline, docs, ids) = setup(2).await;
        let worker = IngestWorker::spawn(pipeline, WorkerConfig { concurrency: 1, ..config(3) });
        let mut rx = worker.subscribe();
        worker.enqueue(ids[0]).unwrap();
        let report = rx.recv().await.unwrap();
        worker.shutdown().await;

        assert_eq!(report.status, DocumentStatus::Indexed);
        let doc = docs.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (pipeline, docs, ids) = setup(10).await;
        let worker = IngestWorker::spawn(pipeline, config(2));
        let mut rx = worker.subscribe();
        worker.enqueue(ids[0]).unwrap();
        let report = rx.recv().await.unwrap();
        worker.shutdown().await;

        assert_eq!(report.status, DocumentStatus::Failed);
        assert!(report.error.unwrap().starts_with("embedding failure"));
        let doc = docs.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_rejects_new_jobs() {
        let (pipeline, docs, ids) = setup(0).await;
        let worker = IngestWorker::spawn(pipeline, config(1));
        for id in &ids {
            worker.enqueue(*id).unwrap();
        }
        worker.shutdown().await;

        for id in &ids {
            let doc = docs.get(*id).await.unwrap().unwrap();
            assert!(doc.status.is_terminal());
        }
        assert!(worker.enqueue(ids[0]).is_err());
        worker.shutdown().await;
    }
}
