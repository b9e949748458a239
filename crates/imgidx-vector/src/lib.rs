//! imgidx Vector - Embedding client and vector database abstraction
//!
//! Provides the inference RPC client that turns images and text into
//! embeddings, and the vector store the index writer upserts into.

use async_trait::async_trait;
use imgidx_core::{CollectionSchema, RecordPayload, Result, ScoredRecord, VectorRecord};
use uuid::Uuid;

pub mod embedding;
pub mod memory_store;
pub mod qdrant_store;

pub use embedding::{EmbedRequest, EmbeddingClient, HttpEmbeddingClient};
pub use memory_store::MemoryVectorStore;
pub use qdrant_store::QdrantStore;

/// Trait for vector database operations on a single collection
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Collection name
    fn collection(&self) -> &str;

    /// Schema of the existing collection, `None` if it does not exist
    async fn collection_schema(&self) -> Result<Option<CollectionSchema>>;

    /// Create the collection
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()>;

    /// Drop the collection and every record in it
    async fn drop_collection(&self) -> Result<()>;

    /// Insert or overwrite the record with the same id
    async fn upsert(&self, record: &VectorRecord) -> Result<()>;

    /// Payload stored under `id`
    async fn get(&self, id: Uuid) -> Result<Option<RecordPayload>>;

    /// Number of records in the collection
    async fn count(&self) -> Result<u64>;

    /// Nearest records to `vector`, best first
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredRecord>>;
}
