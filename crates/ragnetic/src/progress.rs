//! Ingestion progress reporting.
//!
//! The pipeline emits one [`IngestProgress`] event per completed stage.
//! CLI reporters write to **stderr** so stdout remains parseable for
//! scripts; [`ChannelProgress`] exposes a per-document `watch` channel for
//! in-process callers that want to poll a job's latest state.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;

/// Pipeline stage reached by a document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Started,
    Fetched,
    Parsed,
    Chunked,
    Embedded,
    Indexed,
    Failed,
}

impl IngestStage {
    /// Percent complete once this stage is reached.
    pub fn percent(&self) -> u8 {
        match self {
            IngestStage::Started => 0,
            IngestStage::Fetched => 10,
            IngestStage::Parsed => 30,
            IngestStage::Chunked => 50,
            IngestStage::Embedded => 70,
            IngestStage::Indexed | IngestStage::Failed => 100,
        }
    }

    /// `indexed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestStage::Indexed | IngestStage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Started => "started",
            IngestStage::Fetched => "fetched",
            IngestStage::Parsed => "parsed",
            IngestStage::Chunked => "chunked",
            IngestStage::Embedded => "embedded",
            IngestStage::Indexed => "indexed",
            IngestStage::Failed => "failed",
        }
    }
}

/// A single progress event for one document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct IngestProgress {
    pub document_id: i64,
    pub percent: u8,
    pub stage: IngestStage,
}

impl IngestProgress {
    pub fn new(document_id: i64, stage: IngestStage) -> Self {
        Self {
            document_id,
            percent: stage.percent(),
            stage,
        }
    }
}

/// Receives progress events. Called from the ingestion pipeline; must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgress);
}

/// Human-friendly progress on stderr: "ingest doc 12  parsed  30%".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgress) {
        let line = format!(
            "ingest doc {}  {:<8}  {:>3}%\n",
            event.document_id,
            event.stage.as_str(),
            event.percent
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgress) {
        let obj = serde_json::json!({
            "event": "progress",
            "document_id": event.document_id,
            "stage": event.stage,
            "percent": event.percent,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgress) {}
}

/// Keeps the latest event per document in a `watch` channel.
///
/// Subscribing before or during a job works: the receiver always sees the
/// most recent state. A terminal event (`indexed`, `failed`) is delivered
/// and then the channel is dropped, so receivers keep the final value and
/// `changed()` errors afterwards. A retried job opens a fresh channel.
#[derive(Default)]
pub struct ChannelProgress {
    channels: Mutex<HashMap<i64, watch::Sender<Option<IngestProgress>>>>,
}

impl ChannelProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, document_id: i64) -> watch::Receiver<Option<IngestProgress>> {
        match self.channels.lock() {
            Ok(mut channels) => channels
                .entry(document_id)
                .or_insert_with(|| watch::channel(None).0)
                .subscribe(),
            // Poisoned: hand back a detached receiver that never updates.
            Err(_) => watch::channel(None).1,
        }
    }

    /// Latest event for a document whose job has not finished yet.
    pub fn latest(&self, document_id: i64) -> Option<IngestProgress> {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(&document_id).and_then(|tx| *tx.borrow()))
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: IngestProgress) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        if event.stage.is_terminal() {
            if let Some(tx) = channels.remove(&event.document_id) {
                tx.send_replace(Some(event));
            }
        } else {
            channels
                .entry(event.document_id)
                .or_insert_with(|| watch::channel(None).0)
                .send_replace(Some(event));
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
