//! Qdrant implementation for vector storage
//!
//! Provides connection management and point operations
//! for the image embedding collection.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use imgidx_core::{
    CollectionSchema, DistanceMetric, ImgIdxError, RecordPayload, Result, ScoredRecord,
    VectorConfig, VectorRecord,
};
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfigKind;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, Distance, GetPointsBuilder, PointId,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Qdrant vector store implementation
pub struct QdrantStore {
    client: Qdrant,
    collection: String,
}

impl QdrantStore {
    /// Create a new Qdrant client
    ///
    /// The gRPC channel is opened lazily; call `ping` to fail fast at startup.
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.qdrant_url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ImgIdxError::Database(format!("Qdrant connection failed: {e}")))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
        })
    }

    /// Check that the server is reachable
    pub async fn ping(&self) -> Result<()> {
        self.client
            .health_check()
            .await
            .map_err(|e| ImgIdxError::Database(format!("Qdrant health check failed: {e}")))?;
        Ok(())
    }
}

fn to_qdrant_distance(metric: DistanceMetric) -> Distance {
    match metric {
        DistanceMetric::Cosine => Distance::Cosine,
        DistanceMetric::Dot => Distance::Dot,
        DistanceMetric::Euclid => Distance::Euclid,
        DistanceMetric::Manhattan => Distance::Manhattan,
    }
}

fn from_qdrant_distance(raw: i32) -> Option<DistanceMetric> {
    [
        DistanceMetric::Cosine,
        DistanceMetric::Dot,
        DistanceMetric::Euclid,
        DistanceMetric::Manhattan,
    ]
    .into_iter()
    .find(|m| to_qdrant_distance(*m) as i32 == raw)
}

fn payload_string(payload: &HashMap<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

fn record_payload(payload: &HashMap<String, Value>) -> RecordPayload {
    RecordPayload {
        path: payload_string(payload, "path"),
        src_url: payload_string(payload, "src_url"),
    }
}

fn point_uuid(id: Option<PointId>) -> Option<Uuid> {
    match id?.point_id_options? {
        PointIdOptions::Uuid(s) => Uuid::parse_str(&s).ok(),
        PointIdOptions::Num(_) => None,
    }
}

#[async_trait]
impl super::VectorStore for QdrantStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn collection_schema(&self) -> Result<Option<CollectionSchema>> {
        // Check if collection exists
        let collections =
            self.client.list_collections().await.map_err(|e| {
                ImgIdxError::Database(format!("Failed to list collections: {e}"))
            })?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);
        if !exists {
            return Ok(None);
        }

        let info = self
            .client
            .collection_info(self.collection.as_str())
            .await
            .map_err(|e| ImgIdxError::Database(format!("Failed to read collection info: {e}")))?;

        let params = info
            .result
            .and_then(|i| i.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);

        match params {
            Some(VectorsConfigKind::Params(params)) => {
                let distance = from_qdrant_distance(params.distance).ok_or_else(|| {
                    ImgIdxError::SchemaMismatch(format!(
                        "collection {} uses unknown distance {}",
                        self.collection, params.distance
                    ))
                })?;
                Ok(Some(CollectionSchema::new(params.size, distance)))
            }
            _ => Err(ImgIdxError::SchemaMismatch(format!(
                "collection {} has no single unnamed vector config",
                self.collection
            ))),
        }
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(schema.dimension, to_qdrant_distance(schema.distance)),
                ),
            )
            .await
            .map_err(|e| ImgIdxError::Database(format!("Failed to create collection: {e}")))?;

        Ok(())
    }

    async fn drop_collection(&self) -> Result<()> {
        self.client
            .delete_collection(self.collection.as_str())
            .await
            .map_err(|e| ImgIdxError::Database(format!("Failed to delete collection: {e}")))?;

        Ok(())
    }

    async fn upsert(&self, record: &VectorRecord) -> Result<()> {
        let payload: HashMap<String, Value> = HashMap::from([
            ("path".to_string(), record.payload.path.clone().into()),
            ("src_url".to_string(), record.payload.src_url.clone().into()),
        ]);

        let point = PointStruct::new(record.id.to_string(), record.vector.clone(), payload);

        // wait(true): the write is applied before we return, so acking afterwards is safe
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(|e| ImgIdxError::Database(format!("Failed to upsert vector: {e}")))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RecordPayload>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, vec![PointId::from(id.to_string())])
                    .with_payload(true),
            )
            .await
            .map_err(|e| ImgIdxError::Database(format!("Failed to get point: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .next()
            .map(|point| record_payload(&point.payload)))
    }

    async fn count(&self) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(|e| ImgIdxError::Database(format!("Failed to count points: {e}")))?;

        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredRecord>> {
        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), limit as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| ImgIdxError::Database(format!("Vector search failed: {e}")))?;

        Ok(results
            .result
            .into_iter()
            .filter_map(|point| {
                Some(ScoredRecord {
                    id: point_uuid(point.id)?,
                    score: point.score,
                    payload: record_payload(&point.payload),
                })
            })
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
