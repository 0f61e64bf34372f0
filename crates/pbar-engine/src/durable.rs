//! Durable store contract.
//!
//! The relational store keeps progress bar schemas and the retained trace
//! set. The core only needs the narrow interface below; the SQLite
//! implementation backs real deployments and `MemoryDurableStore` backs
//! tests. Retained traces are partitioned by (bar, version): traces from
//! older versions stay readable but are never touched by new fits.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::fmt;

use pbar_common::{BarSchema, CompletedTrace, StepSpec};

use crate::hot_store::StoreResult;

pub use memory::MemoryDurableStore;
pub use sqlite::SqliteDurableStore;

/// One retained observation of a step, for predictor fits.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSample {
    /// Uid of the retained trace the sample came from.
    pub trace_uid: String,
    /// Declared iterations; `None` for one-off steps.
    pub iterations: Option<u32>,
    /// Wall-clock duration in seconds.
    pub duration: f64,
}

/// Transactional relational store for schemas and retained traces.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    /// Load a bar's current schema by (owner, name).
    async fn load_bar(&self, owner: &str, name: &str) -> StoreResult<Option<BarSchema>>;

    /// Create a bar with its default spec and steps. Fails on a duplicate
    /// (owner, name).
    async fn create_bar(&self, schema: &BarSchema) -> StoreResult<()>;

    /// Bump the bar's version and replace its real steps, keeping the
    /// default spec. Returns the new schema.
    async fn rotate_bar(
        &self,
        owner: &str,
        name: &str,
        steps: Vec<StepSpec>,
    ) -> StoreResult<BarSchema>;

    /// Whether any trace (any bar, any version) already uses this uid.
    async fn trace_exists(&self, trace_uid: &str) -> StoreResult<bool>;

    /// Insert a retained trace with its steps in one transaction. Returns
    /// `false` when the uid is already present, making retention retries
    /// idempotent.
    async fn insert_trace(&self, trace: &CompletedTrace) -> StoreResult<bool>;

    /// Reload a retained trace by uid.
    async fn load_trace(&self, trace_uid: &str) -> StoreResult<Option<CompletedTrace>>;

    /// `created_at` of the most recently retained trace for (bar, version).
    async fn latest_retained_at(&self, bar_uid: &str, version: u32) -> StoreResult<Option<f64>>;

    /// Number of retained traces for (bar, version).
    async fn retained_count(&self, bar_uid: &str, version: u32) -> StoreResult<u64>;

    /// Delete the oldest retained traces beyond `keep`, returning them
    /// (oldest first) so the predictor can unlearn them.
    async fn evict_oldest_beyond(
        &self,
        bar_uid: &str,
        version: u32,
        keep: u32,
    ) -> StoreResult<Vec<CompletedTrace>>;

    /// Samples of one step across the retained set, restricted to traces
    /// created at or after `min_created_at`, ordered by duration.
    async fn step_samples(
        &self,
        bar_uid: &str,
        version: u32,
        position: u32,
        min_created_at: f64,
    ) -> StoreResult<Vec<StepSample>>;
}
