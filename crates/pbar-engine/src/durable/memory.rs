//! In-memory durable store for tests and single-process runs.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use pbar_common::{BarSchema, CompletedTrace, StepSpec};

use super::{DurableStore, StepSample};
use crate::error::StoreError;
use crate::hot_store::StoreResult;

#[derive(Debug, Default)]
struct Inner {
    // (owner, name) -> schema at current version
    bars: HashMap<(String, String), BarSchema>,
    // trace uid -> retained trace
    traces: HashMap<String, CompletedTrace>,
}

/// In-memory `DurableStore` implementation.
#[derive(Default)]
pub struct MemoryDurableStore {
    inner: RwLock<Inner>,
}

impl fmt::Debug for MemoryDurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemoryDurableStore")
            .field("bars", &inner.bars.len())
            .field("traces", &inner.traces.len())
            .finish()
    }
}

impl MemoryDurableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn retained_of(inner: &Inner, bar_uid: &str, version: u32) -> Vec<CompletedTrace> {
        let mut traces: Vec<CompletedTrace> = inner
            .traces
            .values()
            .filter(|t| t.bar_uid.as_str() == bar_uid && t.bar_version == version)
            .cloned()
            .collect();
        traces.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        traces
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn load_bar(&self, owner: &str, name: &str) -> StoreResult<Option<BarSchema>> {
        Ok(self
            .inner
            .read()
            .bars
            .get(&(owner.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_bar(&self, schema: &BarSchema) -> StoreResult<()> {
        schema
            .check_integrity()
            .map_err(StoreError::Integrity)?;
        let mut inner = self.inner.write();
        let key = (schema.owner.clone(), schema.name.clone());
        if inner.bars.contains_key(&key) {
            return Err(StoreError::Integrity(format!(
                "bar {}/{} already exists",
                schema.owner, schema.name
            )));
        }
        inner.bars.insert(key, schema.clone());
        Ok(())
    }

    async fn rotate_bar(
        &self,
        owner: &str,
        name: &str,
        steps: Vec<StepSpec>,
    ) -> StoreResult<BarSchema> {
        let mut inner = self.inner.write();
        let schema = inner
            .bars
            .get_mut(&(owner.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::Integrity(format!("no bar {owner}/{name} to rotate")))?;
        schema.version += 1;
        schema.steps = steps;
        schema
            .check_integrity()
            .map_err(StoreError::Integrity)?;
        Ok(schema.clone())
    }

    async fn trace_exists(&self, trace_uid: &str) -> StoreResult<bool> {
        Ok(self.inner.read().traces.contains_key(trace_uid))
    }

    async fn insert_trace(&self, trace: &CompletedTrace) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        if inner.traces.contains_key(trace.uid.as_str()) {
            return Ok(false);
        }
        inner
            .traces
            .insert(trace.uid.as_str().to_string(), trace.clone());
        Ok(true)
    }

    async fn load_trace(&self, trace_uid: &str) -> StoreResult<Option<CompletedTrace>> {
        Ok(self.inner.read().traces.get(trace_uid).cloned())
    }

    async fn latest_retained_at(&self, bar_uid: &str, version: u32) -> StoreResult<Option<f64>> {
        let inner = self.inner.read();
        Ok(Self::retained_of(&inner, bar_uid, version)
            .last()
            .map(|t| t.created_at))
    }

    async fn retained_count(&self, bar_uid: &str, version: u32) -> StoreResult<u64> {
        let inner = self.inner.read();
        Ok(Self::retained_of(&inner, bar_uid, version).len() as u64)
    }

    async fn evict_oldest_beyond(
        &self,
        bar_uid: &str,
        version: u32,
        keep: u32,
    ) -> StoreResult<Vec<CompletedTrace>> {
        let mut inner = self.inner.write();
        let all = Self::retained_of(&inner, bar_uid, version);
        if all.len() <= keep as usize {
            return Ok(Vec::new());
        }
        let evicted: Vec<CompletedTrace> = all[..all.len() - keep as usize].to_vec();
        for trace in &evicted {
            inner.traces.remove(trace.uid.as_str());
        }
        Ok(evicted)
    }

    async fn step_samples(
        &self,
        bar_uid: &str,
        version: u32,
        position: u32,
        min_created_at: f64,
    ) -> StoreResult<Vec<StepSample>> {
        let inner = self.inner.read();
        let mut samples: Vec<StepSample> = Self::retained_of(&inner, bar_uid, version)
            .iter()
            .filter(|t| t.created_at >= min_created_at)
            .filter_map(|t| {
                let step = t.steps.iter().find(|s| s.position == position)?;
                Some(StepSample {
                    trace_uid: t.uid.as_str().to_string(),
                    iterations: step.iterations,
                    duration: step.duration()?,
                })
            })
            .collect();
        samples.sort_by(|a, b| a.duration.total_cmp(&b.duration));
        Ok(samples)
    }
}
