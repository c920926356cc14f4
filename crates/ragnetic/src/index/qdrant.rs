//! Qdrant [`VectorIndex`] over the REST API.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | ensure collection | `GET /collections/{name}`, then `PUT /collections/{name}` on 404 |
//! | upsert | `PUT /collections/{name}/points?wait=true` |
//! | search | `POST /collections/{name}/points/search` |
//! | scroll | `POST /collections/{name}/points/scroll` |
//!
//! Collections are created with cosine distance. The client does no
//! retrying of its own; the ingestion worker owns retry policy.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ragnetic_core::models::{IndexedPoint, PointPayload};

use super::{CollectionNaming, ScoredPoint, ScrollPage, StoredPoint, VectorIndex};
use crate::config::IndexConfig;

pub struct QdrantIndex {
    client: reqwest::Client,
    base_url: String,
    naming: CollectionNaming,
    dims: usize,
    known: Mutex<HashSet<String>>,
}

impl QdrantIndex {
    pub fn new(config: &IndexConfig, naming: CollectionNaming, dims: usize) -> Result<Self> {
        anyhow::ensure!(
            config.url.starts_with("http://") || config.url.starts_with("https://"),
            "index.url must be an http(s) URL"
        );
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(var) = &config.api_key_env {
            let key = std::env::var(var)
                .with_context(|| format!("index.api_key_env is set but {} is not", var))?;
            headers.insert(
                "api-key",
                HeaderValue::from_str(key.trim()).context("invalid Qdrant API key")?,
            );
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            naming,
            dims,
            known: Mutex::new(HashSet::new()),
        })
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{}", self.base_url, name)
    }

    fn is_known(&self, name: &str) -> bool {
        self.known.lock().map(|k| k.contains(name)).unwrap_or(false)
    }

    fn mark_known(&self, name: &str) {
        if let Ok(mut known) = self.known.lock() {
            known.insert(name.to_string());
        }
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Serialize)]
struct ScrollRequest {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<Value>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct RawHit {
    id: Value,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    payload: Option<PointPayload>,
}

#[derive(Deserialize)]
struct RawScroll {
    #[serde(default)]
    points: Vec<RawHit>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

/// Qdrant point ids are either unsigned integers or UUID strings.
fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cursor_to_id(cursor: String) -> Value {
    match cursor.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(cursor),
    }
}

async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    bail!("Qdrant {} failed ({}): {}", what, status, body)
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, kb_id: i64) -> Result<String> {
        let name = self.naming.name(kb_id);
        if self.is_known(&name) {
            return Ok(name);
        }

        let resp = self
            .client
            .get(self.collection_url(&name))
            .send()
            .await
            .with_context(|| format!("Qdrant unreachable at {}", self.base_url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            let body = serde_json::json!({
                "vectors": { "size": self.dims, "distance": "Cosine" }
            });
            let created = self
                .client
                .put(self.collection_url(&name))
                .json(&body)
                .send()
                .await?;
            // A concurrent creator may have won the race.
            if created.status() != StatusCode::CONFLICT {
                check(created, "create collection").await?;
            }
            tracing::info!(collection = %name, dims = self.dims, "created Qdrant collection");
        } else {
            check(resp, "get collection").await?;
        }

        self.mark_known(&name);
        Ok(name)
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexedPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "points": points });
        let resp = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url(collection)))
            .json(&body)
            .send()
            .await?;
        check(resp, "upsert").await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let resp = self
            .client
            .post(format!("{}/points/search", self.collection_url(collection)))
            .json(&SearchRequest {
                vector,
                limit,
                with_payload: true,
            })
            .send()
            .await?;
        let envelope: Envelope<Vec<RawHit>> = check(resp, "search")
            .await?
            .json()
            .await
            .map_err(|e| anyhow!("invalid Qdrant search response: {}", e))?;

        Ok(envelope
            .result
            .into_iter()
            .map(|h| ScoredPoint {
                id: id_to_string(&h.id),
                score: h.score,
                payload: h.payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<ScrollPage> {
        let resp = self
            .client
            .post(format!("{}/points/scroll", self.collection_url(collection)))
            .json(&ScrollRequest {
                limit,
                offset: cursor.map(cursor_to_id),
                with_payload: true,
                with_vector: false,
            })
            .send()
            .await?;
        let envelope: Envelope<RawScroll> = check(resp, "scroll")
            .await?
            .json()
            .await
            .map_err(|e| anyhow!("invalid Qdrant scroll response: {}", e))?;

        Ok(ScrollPage {
            points: envelope
                .result
                .points
                .into_iter()
                .map(|p| StoredPoint {
                    id: id_to_string(&p.id),
                    payload: p.payload.unwrap_or_default(),
                })
                .collect(),
            next_cursor: envelope
                .result
                .next_page_offset
                .filter(|v| !v.is_null())
                .map(|v| id_to_string(&v)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip_as_cursors() {
        assert_eq!(id_to_string(&serde_json::json!(42)), "42");
        assert_eq!(
            id_to_string(&serde_json::json!("1b4e28ba-2fa1-11d2-883f-0016d3cca427")),
            "1b4e28ba-2fa1-11d2-883f-0016d3cca427"
        );
        assert_eq!(cursor_to_id("42".to_string()), serde_json::json!(42));
        assert_eq!(
            cursor_to_id("abc-def".to_string()),
            serde_json::json!("abc-def")
        );
    }

    #[test]
    fn parses_search_and_scroll_envelopes() {
        let search: Envelope<Vec<RawHit>> = serde_json::from_str(
            r#"{"result":[{"id":"a","version":3,"score":0.9,
                "payload":{"text":"hello","metadata":{"chunk_index":0},"doc_id":7}}],
               "status":"ok","time":0.001}"#,
        )
        .unwrap();
        let hit = &search.result[0];
        assert_eq!(hit.score, 0.9);
        let payload = hit.payload.clone().unwrap();
        assert_eq!(payload.doc_id, Some(7));
        assert_eq!(payload.metadata["chunk_index"].as_i64(), Some(0));

        let scroll: Envelope<RawScroll> = serde_json::from_str(
            r#"{"result":{"points":[{"id":1,"payload":{"text":"x"}}],"next_page_offset":null}}"#,
        )
        .unwrap();
        assert_eq!(scroll.result.points.len(), 1);
        assert!(scroll.result.next_page_offset.is_none());
    }

    #[test]
    fn scroll_request_omits_missing_offset() {
        let body = serde_json::to_value(ScrollRequest {
            limit: 128,
            offset: None,
            with_payload: true,
            with_vector: false,
        })
        .unwrap();
        assert!(body.get("offset").is_none());
        assert_eq!(body["limit"], 128);
    }

    #[test]
    fn rejects_non_http_url() {
        let config = IndexConfig {
            url: "localhost:6333".to_string(),
            ..IndexConfig::default()
        };
        assert!(QdrantIndex::new(&config, CollectionNaming::default(), 4).is_err());
    }
}
