//! Core data models shared by the chunker, the retrieval engine, and the
//! ingestion pipeline.
//!
//! Metadata attached to chunks and indexed points is a closed variant type
//! ([`MetadataValue`]) stored in a [`BTreeMap`], so serialized payloads have
//! a stable key order and compare byte-for-byte across runs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered string-keyed metadata map.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata value.
///
/// Serialized untagged, so a `Metadata` map round-trips through plain JSON
/// objects (vector-index payloads, CLI output) without wrapper tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::String(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Integer(v)
    }
}

impl From<usize> for MetadataValue {
    fn from(v: usize) -> Self {
        MetadataValue::Integer(v as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<Metadata> for MetadataValue {
    fn from(v: Metadata) -> Self {
        MetadataValue::Map(v)
    }
}

/// A bounded, overlapping unit of document text.
///
/// Produced only by [`chunk_text`](crate::chunk::chunk_text). Offsets are
/// measured in `char`s (Unicode scalar values) into the source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub metadata: Metadata,
    pub start_char: usize,
    pub end_char: usize,
}

impl Chunk {
    /// Position of this chunk within its document's chunk sequence.
    pub fn chunk_index(&self) -> Option<i64> {
        self.metadata.get("chunk_index").and_then(|v| v.as_i64())
    }

    /// Total number of chunks emitted for the document.
    pub fn chunk_count(&self) -> Option<i64> {
        self.metadata.get("chunk_count").and_then(|v| v.as_i64())
    }
}

/// Transient ranking record built fresh for every retrieval call.
///
/// `id` is the identifier of the underlying indexed point, so dense and
/// lexical observations of the same chunk merge onto one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub doc_id: Option<i64>,
    pub dense_score: f64,
    pub sparse_score: f64,
    pub final_score: f64,
}

impl Candidate {
    /// Build an unscored candidate from an indexed point's id and payload.
    pub fn from_payload(id: impl Into<String>, payload: PointPayload) -> Self {
        Self {
            id: id.into(),
            text: payload.text,
            metadata: payload.metadata,
            doc_id: payload.doc_id,
            dense_score: 0.0,
            sparse_score: 0.0,
            final_score: 0.0,
        }
    }
}

/// Payload stored alongside every vector in the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub doc_id: Option<i64>,
}

/// One embedded chunk as written to the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// Lifecycle state of an uploaded document.
///
/// `Pending` is set at upload time; the ingestion pipeline moves it to
/// `Processing` and then to one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
