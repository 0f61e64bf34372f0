//! Schema registry.
//!
//! Resolves (owner, bar name) to the bar's current schema, caching results
//! process-locally. Mutations go through the registry so the cache is
//! replaced in the same call as the durable write: readers observe either
//! the old schema or the new one, never a torn mix.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use pbar_common::{BarSchema, StepSpec};

use crate::durable::DurableStore;
use crate::error::{with_store_retry, EngineError, RetryPolicy};

/// Caching schema resolver.
#[derive(Debug)]
pub struct SchemaRegistry {
    durable: Arc<dyn DurableStore>,
    cache: DashMap<(String, String), Arc<BarSchema>>,
    retry: RetryPolicy,
}

impl SchemaRegistry {
    /// Create a registry over the durable store.
    pub fn new(durable: Arc<dyn DurableStore>, retry: RetryPolicy) -> Self {
        Self {
            durable,
            cache: DashMap::new(),
            retry,
        }
    }

    /// Resolve a bar's current schema. Misses surface [`EngineError::NoSuchBar`].
    pub async fn resolve(&self, owner: &str, name: &str) -> Result<Arc<BarSchema>, EngineError> {
        let key = (owner.to_string(), name.to_string());
        if let Some(schema) = self.cache.get(&key) {
            return Ok(Arc::clone(&schema));
        }
        let loaded = with_store_retry(self.retry, "registry.load_bar", || {
            self.durable.load_bar(owner, name)
        })
        .await?;
        let Some(schema) = loaded else {
            return Err(EngineError::NoSuchBar {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        };
        let schema = Arc::new(schema);
        self.cache.insert(key, Arc::clone(&schema));
        debug!(owner, name, version = schema.version, "schema cached");
        Ok(schema)
    }

    /// Drop a cached schema. The next resolve re-reads the durable store.
    pub fn invalidate(&self, owner: &str, name: &str) {
        self.cache.remove(&(owner.to_string(), name.to_string()));
    }

    /// Create a bar and prime the cache.
    pub async fn register(&self, schema: BarSchema) -> Result<Arc<BarSchema>, EngineError> {
        schema
            .check_integrity()
            .map_err(EngineError::Internal)?;
        with_store_retry(self.retry, "registry.create_bar", || {
            self.durable.create_bar(&schema)
        })
        .await?;
        let key = (schema.owner.clone(), schema.name.clone());
        let schema = Arc::new(schema);
        self.cache.insert(key, Arc::clone(&schema));
        info!(
            owner = %schema.owner,
            name = %schema.name,
            steps = schema.steps.len(),
            "bar registered"
        );
        Ok(schema)
    }

    /// Bump the bar's version, replacing its steps, and swap the cache to
    /// the new schema in the same call.
    pub async fn rotate(
        &self,
        owner: &str,
        name: &str,
        steps: Vec<StepSpec>,
    ) -> Result<Arc<BarSchema>, EngineError> {
        let rotated = with_store_retry(self.retry, "registry.rotate_bar", || {
            self.durable.rotate_bar(owner, name, steps.clone())
        })
        .await?;
        info!(owner, name, version = rotated.version, "bar rotated");
        let schema = Arc::new(rotated);
        self.cache
            .insert((owner.to_string(), name.to_string()), Arc::clone(&schema));
        Ok(schema)
    }
}
