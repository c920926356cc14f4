//! # Ragnetic CLI (`ragnetic`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragnetic chunk <file>` | Parse and chunk a file, print chunks as JSON lines |
//! | `ragnetic ingest <path> --kb <id>` | Ingest a file or directory into a knowledge base |
//! | `ragnetic search --kb <id> "<query>"` | Hybrid search over a knowledge base |
//! | `ragnetic completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Inspect how a document will be chunked
//! ragnetic chunk ./docs/handbook.pdf --max 400
//!
//! # Ingest a directory and query the in-process index in one run
//! ragnetic ingest ./docs --kb 1 --query "refund policy"
//!
//! # Search a Qdrant-backed knowledge base
//! ragnetic --config ./config/ragnetic.toml search --kb 1 "refund policy" --json
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, default `ragnetic=info`); stdout carries
//! only command output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use ragnetic::chunk::{chunk_text, ChunkParams};
use ragnetic::config::{self, Config};
use ragnetic::documents::{FsObjectStorage, InMemoryDocumentStore};
use ragnetic::embedding::{create_provider, EmbeddingProvider};
use ragnetic::extract::{self, DocumentParser, FormatParser};
use ragnetic::index::{create_index, VectorIndex};
use ragnetic::ingest::{IngestReport, IngestionPipeline};
use ragnetic::intake::Intake;
use ragnetic::models::Metadata;
use ragnetic::progress::ProgressMode;
use ragnetic::rerank::create_cross_encoder;
use ragnetic::search::{run_search, HybridRetriever, RetrievalParams, RetrieveOptions};
use ragnetic::worker::IngestWorker;

/// Ragnetic: knowledge-base ingestion and hybrid retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, offline defaults are used.
#[derive(Parser)]
#[command(name = "ragnetic", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragnetic.toml")]
    config: PathBuf,

    /// Ingestion progress on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and chunk a file; print one JSON object per chunk.
    Chunk {
        file: PathBuf,
        /// Soft maximum chunk size in characters.
        #[arg(long)]
        max: Option<usize>,
        /// Characters carried over between consecutive chunks.
        #[arg(long)]
        overlap: Option<usize>,
        /// Minimum chunk size before a flush is allowed.
        #[arg(long)]
        min: Option<usize>,
    },

    /// Ingest a file or every supported file under a directory.
    ///
    /// Uploads are deduplicated by content hash within the run. With the
    /// in-memory index, pass `--query` to search what was just ingested.
    Ingest {
        path: PathBuf,
        /// Knowledge base id.
        #[arg(long)]
        kb: i64,
        /// Run a search against the knowledge base after ingesting.
        #[arg(long)]
        query: Option<String>,
        /// Print reports and results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Hybrid search over a knowledge base.
    Search {
        query: String,
        /// Knowledge base id.
        #[arg(long)]
        kb: i64,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        dense_limit: Option<usize>,
        #[arg(long)]
        sparse_pool: Option<usize>,
        #[arg(long)]
        rerank_top_n: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Print shell completions to stdout.
    Completions { shell: clap_complete::Shell },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ragnetic=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = load(&cli.config)?;
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Chunk {
            file,
            max,
            overlap,
            min,
        } => run_chunk(&cfg, &file, max, overlap, min),
        Commands::Ingest {
            path,
            kb,
            query,
            json,
        } => run_ingest(&cfg, &path, kb, query.as_deref(), json, progress).await,
        Commands::Search {
            query,
            kb,
            top_k,
            dense_limit,
            sparse_pool,
            rerank_top_n,
            json,
        } => {
            let (embedder, index) = build_backends(&cfg)?;
            if cfg.index.backend == "memory" {
                tracing::warn!(
                    "index.backend is \"memory\": a fresh process has nothing indexed; \
                     use `ingest --query` or a qdrant backend"
                );
            }
            let retriever = build_retriever(&cfg, embedder, index)?;
            let opts = RetrieveOptions {
                top_k,
                dense_limit,
                sparse_pool,
                rerank_top_n,
            };
            run_search(&retriever, kb, &query, &opts, json).await
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn run_chunk(
    cfg: &Config,
    file: &Path,
    max: Option<usize>,
    overlap: Option<usize>,
    min: Option<usize>,
) -> Result<()> {
    let defaults = &cfg.chunking;
    let params = ChunkParams::new(
        max.unwrap_or(defaults.max_chunk_chars),
        overlap.unwrap_or(defaults.overlap_chars),
        min.unwrap_or(defaults.min_chunk_chars),
    )?;

    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file_name(file);
    let parsed = FormatParser.parse(&bytes, &filename)?;

    let mut base = Metadata::new();
    base.insert("source".to_string(), filename.into());
    base.extend(parsed.metadata);

    for chunk in chunk_text(&parsed.text, &params, &base) {
        println!("{}", serde_json::to_string(&chunk)?);
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn build_backends(cfg: &Config) -> Result<(Arc<dyn EmbeddingProvider>, Arc<dyn VectorIndex>)> {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&cfg.embedding)?);
    let index = create_index(&cfg.index, embedder.dims())?;
    Ok((embedder, index))
}

fn build_retriever(
    cfg: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
) -> Result<HybridRetriever> {
    Ok(
        HybridRetriever::new(index, embedder, RetrievalParams::from(&cfg.retrieval))
            .with_cross_encoder(create_cross_encoder(&cfg.rerank)?),
    )
}

/// Supported files under `path`, in a stable order.
fn collect_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| extract::is_supported(&file_name(p)))
        .collect();
    files.sort();
    files
}

async fn run_ingest(
    cfg: &Config,
    path: &Path,
    kb: i64,
    query: Option<&str>,
    json: bool,
    progress: ProgressMode,
) -> Result<()> {
    let files = collect_files(path);
    if files.is_empty() {
        anyhow::bail!("no supported files found at {}", path.display());
    }

    let (embedder, index) = build_backends(cfg)?;
    let docs = Arc::new(InMemoryDocumentStore::new());
    let storage = Arc::new(FsObjectStorage::new(&cfg.storage.root));
    let pipeline = IngestionPipeline::new(
        docs.clone(),
        storage.clone(),
        Arc::new(FormatParser),
        embedder.clone(),
        index.clone(),
        cfg.chunking.params()?,
    )
    .with_progress(Arc::from(progress.reporter()));

    let worker = Arc::new(IngestWorker::spawn(Arc::new(pipeline), cfg.worker));
    let collector = tokio::spawn(collect_reports(worker.subscribe()));
    let intake = Intake::new(docs, storage, worker.clone());

    let mut names: HashMap<i64, String> = HashMap::new();
    for file in &files {
        let filename = file_name(file);
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let receipt = intake
            .submit(kb, &filename, &bytes, extract::content_type_for(&filename))
            .await?;
        if receipt.deduplicated {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "document_id": receipt.document_id,
                        "filename": filename,
                        "status": "duplicate",
                    })
                );
            } else {
                println!("doc {}  duplicate  {}", receipt.document_id, filename);
            }
        } else {
            names.insert(receipt.document_id, filename);
        }
    }

    worker.shutdown().await;
    drop(intake);
    drop(worker);
    let reports = collector.await.context("report collector failed")?;

    let mut failed = 0usize;
    for report in &reports {
        let filename = names.get(&report.document_id).map(String::as_str).unwrap_or("?");
        if report.error.is_some() {
            failed += 1;
        }
        if json {
            let mut value = serde_json::to_value(report)?;
            value["filename"] = serde_json::Value::from(filename);
            println!("{}", value);
        } else {
            match &report.error {
                Some(err) => println!(
                    "doc {}  {}  {}  ({})",
                    report.document_id, report.status, filename, err
                ),
                None => println!(
                    "doc {}  {}  {}  {} chunks",
                    report.document_id, report.status, filename, report.chunks_indexed
                ),
            }
        }
    }
    tracing::info!(
        files = files.len(),
        ingested = reports.len(),
        failed,
        "ingest finished"
    );

    if let Some(query) = query {
        let retriever = build_retriever(cfg, embedder, index)?;
        if !json {
            println!();
        }
        run_search(&retriever, kb, query, &RetrieveOptions::default(), json).await?;
    }
    Ok(())
}

/// Gather reports until every sender is gone, sorted by document id.
async fn collect_reports(mut rx: broadcast::Receiver<IngestReport>) -> Vec<IngestReport> {
    let mut reports = Vec::new();
    loop {
        match rx.recv().await {
            Ok(report) => reports.push(report),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "dropped ingest reports");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    reports.sort_by_key(|r| r.document_id);
    reports
}
