//! In-memory [`VectorIndex`] for tests and single-process runs.
//!
//! Collections are `Vec`s behind `std::sync::RwLock`, kept in insertion
//! order; scan cursors are the id of the next point. Search is brute-force
//! cosine similarity. Locks are never held across an `.await`.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use ragnetic_core::embedding::cosine_similarity;
use ragnetic_core::models::IndexedPoint;

use super::{CollectionNaming, ScoredPoint, ScrollPage, StoredPoint, VectorIndex};

#[derive(Default)]
struct Collection {
    points: Vec<IndexedPoint>,
    positions: HashMap<String, usize>,
}

pub struct InMemoryIndex {
    naming: CollectionNaming,
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryIndex {
    pub fn new(naming: CollectionNaming) -> Self {
        Self {
            naming,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of points in `collection` (0 if it does not exist).
    pub fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, |col| col.points.len()))
            .unwrap_or(0)
    }

    pub fn collection_name(&self, kb_id: i64) -> String {
        self.naming.name(kb_id)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new(CollectionNaming::default())
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collection(&self, kb_id: i64) -> Result<String> {
        let name = self.naming.name(kb_id);
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexedPoint>) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let col = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;
        for point in points {
            match col.positions.get(&point.id) {
                Some(&pos) => col.points[pos] = point,
                None => {
                    col.positions.insert(point.id.clone(), col.points.len());
                    col.points.push(point);
                }
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let col = collections
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let mut hits: Vec<ScoredPoint> = col
            .points
            .iter()
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: f64::from(cosine_similarity(vector, &p.vector)),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<ScrollPage> {
        let collections = self.collections.read().map_err(poisoned)?;
        let col = collections
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let start = match cursor {
            None => 0,
            Some(id) => *col
                .positions
                .get(&id)
                .ok_or_else(|| anyhow!("unknown scroll cursor '{}'", id))?,
        };
        let end = start.saturating_add(limit).min(col.points.len());
        let points = col.points[start.min(end)..end]
            .iter()
            .map(|p| StoredPoint {
                id: p.id.clone(),
                payload: p.payload.clone(),
            })
            .collect();
        let next_cursor = col.points.get(end).map(|p| p.id.clone());
        Ok(ScrollPage {
            points,
            next_cursor,
        })
    }
}
