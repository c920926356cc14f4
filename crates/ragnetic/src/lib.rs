//! # Ragnetic
//!
//! **Knowledge-base ingestion and hybrid retrieval.**
//!
//! Ragnetic turns uploaded files into indexed, retrievable passages and
//! answers queries against a knowledge base by fusing dense vector
//! similarity with BM25 over a bounded scan of the same collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────────────────────┐   ┌─────────────┐
//! │  Intake  │──▶│  Worker  │──▶│  Pipeline                  │──▶│ VectorIndex │
//! │ sha dedup│   │ mpsc+sem │   │ fetch▸parse▸chunk▸embed    │   │ memory/qdrant│
//! └──────────┘   └──────────┘   └────────────────────────────┘   └──────┬──────┘
//!                                                                       │
//!                        ┌──────────────────────────────────────────────┘
//!                        ▼
//!                 ┌───────────────────────────────┐
//!                 │ HybridRetriever               │
//!                 │ dense ∥ scan+BM25 ▸ RRF ▸ CE  │
//!                 └───────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`intake::Intake`] hashes the upload, short-circuits duplicates, writes
//!    the bytes to [`documents::ObjectStorage`], and queues a job.
//! 2. [`worker::IngestWorker`] runs jobs concurrently with retry.
//! 3. [`ingest::IngestionPipeline`] parses ([`extract`]), chunks
//!    ([`ragnetic_core::chunk`]), embeds ([`embedding`]), and upserts into
//!    the knowledge base's collection ([`index`]).
//! 4. [`search::HybridRetriever`] runs the dense search and the lexical scan
//!    concurrently, fuses them with Reciprocal Rank Fusion, and optionally
//!    reranks the head of the list with a cross-encoder ([`rerank`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`documents`] | Document records and raw object storage |
//! | [`embedding`] | Embedding provider trait and backends |
//! | [`extract`] | Text extraction (plain text, PDF, OOXML) |
//! | [`index`] | Vector index trait, in-memory and Qdrant backends |
//! | [`ingest`] | Ingestion pipeline and job-runner boundary |
//! | [`intake`] | Upload intake with content-hash dedup |
//! | [`progress`] | Ingestion progress reporting |
//! | [`rerank`] | Optional cross-encoder reranking |
//! | [`search`] | Hybrid retrieval engine |
//! | [`worker`] | Background ingestion worker |

pub mod config;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod intake;
pub mod progress;
pub mod rerank;
pub mod search;
pub mod worker;

pub use ragnetic_core::{chunk, error, fusion, lexical, models};
pub use ragnetic_core::{RagError, Result};
