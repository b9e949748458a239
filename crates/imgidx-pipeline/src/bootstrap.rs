//! Collection bootstrap
//!
//! Runs before the index writer starts consuming. `CreateIfAbsent` keeps
//! data across restarts and refuses to start against a collection whose
//! vector size or metric disagrees with the configured embedding.
//! `Recreate` wipes the collection on every start.

use std::sync::Arc;

use imgidx_core::{CollectionPolicy, CollectionSchema, Result};
use imgidx_vector::VectorStore;

/// What `ensure` did to the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Collection did not exist and was created
    Created,
    /// Collection existed with a matching schema and was kept
    Existing,
    /// Collection existed and was dropped and created again
    Recreated,
}

pub struct CollectionBootstrapper {
    store: Arc<dyn VectorStore>,
    schema: CollectionSchema,
}

impl CollectionBootstrapper {
    pub fn new(store: Arc<dyn VectorStore>, schema: CollectionSchema) -> Self {
        Self { store, schema }
    }

    /// Make sure the collection exists with the expected schema
    pub async fn ensure(&self, policy: CollectionPolicy) -> Result<BootstrapOutcome> {
        let collection = self.store.collection().to_string();
        let existing = self.store.collection_schema().await?;

        let outcome = match (policy, existing) {
            (_, None) => {
                self.store.create_collection(&self.schema).await?;
                BootstrapOutcome::Created
            }
            (CollectionPolicy::CreateIfAbsent, Some(found)) => {
                self.schema.ensure_matches(&found)?;
                BootstrapOutcome::Existing
            }
            (CollectionPolicy::Recreate, Some(_)) => {
                tracing::warn!(
                    collection = %collection,
                    "Recreating collection, all previously indexed vectors are deleted"
                );
                self.store.drop_collection().await?;
                self.store.create_collection(&self.schema).await?;
                BootstrapOutcome::Recreated
            }
        };

        tracing::info!(
            collection = %collection,
            policy = %policy,
            dimension = self.schema.dimension,
            distance = %self.schema.distance,
            outcome = ?outcome,
            "Collection ready"
        );
        Ok(outcome)
    }
}
