//! In-process vector store
//!
//! Same contract as the Qdrant store: a single named collection with a
//! fixed schema, upsert by id, and brute-force similarity search.

use async_trait::async_trait;
use imgidx_core::{
    CollectionSchema, DistanceMetric, ImgIdxError, RecordPayload, Result, ScoredRecord,
    VectorRecord,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Collection {
    schema: CollectionSchema,
    records: HashMap<Uuid, VectorRecord>,
}

/// Vector store held entirely in memory
pub struct MemoryVectorStore {
    name: String,
    collection: RwLock<Option<Collection>>,
}

impl MemoryVectorStore {
    /// Create a store with no collection yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: RwLock::new(None),
        }
    }

    /// Full record stored under `id`, including its vector
    pub async fn record(&self, id: Uuid) -> Option<VectorRecord> {
        self.collection
            .read()
            .await
            .as_ref()
            .and_then(|c| c.records.get(&id).cloned())
    }
}

#[async_trait]
impl super::VectorStore for MemoryVectorStore {
    fn collection(&self) -> &str {
        &self.name
    }

    async fn collection_schema(&self) -> Result<Option<CollectionSchema>> {
        Ok(self.collection.read().await.as_ref().map(|c| c.schema))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        let mut guard = self.collection.write().await;
        if guard.is_some() {
            return Err(ImgIdxError::Database(format!(
                "Collection {} already exists",
                self.name
            )));
        }
        *guard = Some(Collection {
            schema: *schema,
            records: HashMap::new(),
        });
        Ok(())
    }

    async fn drop_collection(&self) -> Result<()> {
        *self.collection.write().await = None;
        Ok(())
    }

    async fn upsert(&self, record: &VectorRecord) -> Result<()> {
        let mut guard = self.collection.write().await;
        let collection = guard
            .as_mut()
            .ok_or_else(|| ImgIdxError::Database(format!("Collection {} not found", self.name)))?;

        collection.schema.ensure_vector(&record.vector)?;
        collection.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RecordPayload>> {
        Ok(self.record(id).await.map(|r| r.payload))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self
            .collection
            .read()
            .await
            .as_ref()
            .map(|c| c.records.len() as u64)
            .unwrap_or(0))
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredRecord>> {
        let guard = self.collection.read().await;
        let collection = guard
            .as_ref()
            .ok_or_else(|| ImgIdxError::Database(format!("Collection {} not found", self.name)))?;
        collection.schema.ensure_vector(vector)?;

        let metric = collection.schema.distance;
        let mut scored: Vec<ScoredRecord> = collection
            .records
            .values()
            .map(|r| ScoredRecord {
                id: r.id,
                score: score(metric, vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();

        // Distances rank ascending, similarities descending
        match metric {
            DistanceMetric::Euclid | DistanceMetric::Manhattan => {
                scored.sort_by(|a, b| a.score.total_cmp(&b.score))
            }
            DistanceMetric::Cosine | DistanceMetric::Dot => {
                scored.sort_by(|a, b| b.score.total_cmp(&a.score))
            }
        }
        scored.truncate(limit);
        Ok(scored)
    }
}

fn score(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Dot => dot(a, b),
        DistanceMetric::Cosine => {
            let norm = dot(a, a).sqrt() * dot(b, b).sqrt();
            if norm == 0.0 {
                0.0
            } else {
                dot(a, b) / norm
            }
        }
        DistanceMetric::Euclid => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
