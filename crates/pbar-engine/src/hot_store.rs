//! Hot-state store adapter.
//!
//! The hot store holds the mutable state of in-flight traces plus the
//! published predictor parameters, and fans out change notifications. The
//! interface is deliberately narrow so both a networked key-value store and
//! the in-memory fake can satisfy it:
//! - hashes with per-field get/set and atomic increment
//! - a guarded multi-key write conditioned on one hash field (the
//!   compare-and-set that linearizes trace mutations)
//! - sorted sets scored by `created_at`, trimmed by score floor
//! - key TTLs
//! - pub/sub with exact-channel and prefix subscriptions
//!
//! ## Keyspace
//!
//! - `trace:{owner}:{bar}:{uid}`: hash {created_at, last_updated_at,
//!   current_step, done}
//! - `trace:{owner}:{bar}:{uid}:step:{position}`: hash {step_name,
//!   iteration, iterations, started_at, finished_at}
//! - `stats:{owner}:{bar}:{version}:{technique_key}`: scalar whole-trace
//!   estimate (seconds)
//! - `stats:{owner}:{bar}:{version}:{position}:{technique_key}`: hash {a, b?}
//! - `tcount:{owner}:{bar}:{version}`: sorted set, score = created_at
//! - `tcount:{utc_year}:{utc_month}`: hash of owner to completion count
//! - channel `ps:trace:{owner}:{bar}:{uid}`: one notification per trace
//!   mutation

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::StoreError;

pub use memory::MemoryHotStore;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Opaque payload.
    pub payload: String,
}

/// Condition for a guarded write: the hash field at `key` must currently
/// hold `expected` (`None` = the field must be absent).
#[derive(Debug, Clone)]
pub struct Guard {
    pub key: String,
    pub field: String,
    pub expected: Option<String>,
}

impl Guard {
    /// Require `field` at `key` to hold exactly `value`.
    pub fn equals(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            expected: Some(value.into()),
        }
    }

    /// Require `field` at `key` to be absent (key missing counts).
    pub fn absent(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            expected: None,
        }
    }
}

/// One hash mutation within a guarded write.
#[derive(Debug, Clone)]
pub struct HashWrite {
    pub key: String,
    pub fields: Vec<(String, String)>,
    /// TTL applied to the key after the write, if any.
    pub ttl_seconds: Option<f64>,
}

impl HashWrite {
    /// Build a write for `key` with the given fields.
    pub fn new(key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            key: key.into(),
            fields,
            ttl_seconds: None,
        }
    }

    /// Attach a TTL refresh to this write.
    pub fn with_ttl(mut self, ttl_seconds: f64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }
}

/// Abstract key-value + pub/sub store.
#[async_trait]
pub trait HotStore: Send + Sync + fmt::Debug {
    /// Read the given fields of a hash. Missing key yields all-`None`.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>>;

    /// Set fields of a hash, creating the key if needed.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    /// Atomically add `delta` to an integer hash field, creating it at 0.
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Atomically apply `writes` iff `guard` holds. Returns whether the
    /// writes were applied.
    async fn guarded_write(&self, guard: Guard, writes: Vec<HashWrite>) -> StoreResult<bool>;

    /// Add (or rescore) a member of a sorted set.
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Remove members with score strictly below `floor`; returns how many.
    async fn zset_trim_below(&self, key: &str, floor: f64) -> StoreResult<u64>;

    /// Number of members in a sorted set.
    async fn zset_count(&self, key: &str) -> StoreResult<u64>;

    /// Highest-scored member, if any.
    async fn zset_latest(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

    /// Set a key's TTL. Non-positive TTLs delete the key.
    async fn expire(&self, key: &str, ttl_seconds: f64) -> StoreResult<()>;

    /// Delete a key outright.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Set a scalar string value.
    async fn scalar_set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Read a scalar string value.
    async fn scalar_get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Publish a fire-and-forget message.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to one channel.
    async fn subscribe(&self, channel: &str) -> StoreResult<broadcast::Receiver<PubSubMessage>>;

    /// Subscribe to every channel starting with `prefix`.
    async fn subscribe_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<broadcast::Receiver<PubSubMessage>>;
}

/// Keyspace builders.
pub mod keys {
    /// `trace:{owner}:{bar}:{uid}`
    pub fn trace(owner: &str, bar_name: &str, trace_uid: &str) -> String {
        format!("trace:{owner}:{bar_name}:{trace_uid}")
    }

    /// `trace:{owner}:{bar}:{uid}:step:{position}`
    pub fn trace_step(owner: &str, bar_name: &str, trace_uid: &str, position: u32) -> String {
        format!("trace:{owner}:{bar_name}:{trace_uid}:step:{position}")
    }

    /// `stats:{owner}:{bar}:{version}:{technique_key}`
    pub fn stats_whole(owner: &str, bar_name: &str, version: u32, technique_key: &str) -> String {
        format!("stats:{owner}:{bar_name}:{version}:{technique_key}")
    }

    /// `stats:{owner}:{bar}:{version}:{position}:{technique_key}`
    pub fn stats_step(
        owner: &str,
        bar_name: &str,
        version: u32,
        position: u32,
        technique_key: &str,
    ) -> String {
        format!("stats:{owner}:{bar_name}:{version}:{position}:{technique_key}")
    }

    /// `tcount:{owner}:{bar}:{version}`
    pub fn trace_count(owner: &str, bar_name: &str, version: u32) -> String {
        format!("tcount:{owner}:{bar_name}:{version}")
    }

    /// `tcount:{utc_year}:{utc_month}`
    pub fn monthly_count(year: i32, month: u32) -> String {
        format!("tcount:{year}:{month}")
    }

    /// `ps:trace:{owner}:{bar}:{uid}`
    pub fn trace_channel(owner: &str, bar_name: &str, trace_uid: &str) -> String {
        format!("ps:trace:{owner}:{bar_name}:{trace_uid}")
    }

    /// Prefix covering every trace channel of a bar.
    pub fn bar_channel_prefix(owner: &str, bar_name: &str) -> String {
        format!("ps:trace:{owner}:{bar_name}:")
    }
}

/// Parsed `trace:{owner}:{bar}:{uid}` hash.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceHash {
    pub created_at: f64,
    pub last_updated_at: f64,
    pub current_step: u32,
    pub done: bool,
}

/// Parsed `...:step:{position}` hash.
///
/// `iterations` is stored as `0` for one-off steps, mirroring the wire
/// encoding; the parsed form uses `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepHash {
    pub step_name: String,
    pub iteration: u32,
    pub iterations: Option<u32>,
    pub started_at: f64,
    pub finished_at: Option<f64>,
}

fn parse_field<T: std::str::FromStr>(key: &str, field: &str, raw: &str) -> StoreResult<T> {
    raw.parse().map_err(|_| {
        StoreError::Integrity(format!("unparseable field {field}={raw:?} at {key}"))
    })
}

/// Read and parse a trace hash, also returning the raw `last_updated_at`
/// string. Writers use the raw form as the compare-and-set token so the
/// guard compares exactly what the store holds, not a re-rendered float.
/// `None` when the key is absent.
pub async fn read_trace_hash_raw(
    store: &dyn HotStore,
    key: &str,
) -> StoreResult<Option<(TraceHash, String)>> {
    let fields = store
        .hash_get(key, &["created_at", "last_updated_at", "current_step", "done"])
        .await?;
    let [created_at, last_updated_at, current_step, done] = fields.as_slice() else {
        return Err(StoreError::Integrity(format!("short hash read at {key}")));
    };
    let Some(created_at) = created_at else {
        return Ok(None);
    };
    let (Some(raw_updated), Some(current_step), Some(done)) =
        (last_updated_at, current_step, done)
    else {
        return Err(StoreError::Integrity(format!("partial trace hash at {key}")));
    };
    let hash = TraceHash {
        created_at: parse_field(key, "created_at", created_at)?,
        last_updated_at: parse_field(key, "last_updated_at", raw_updated)?,
        current_step: parse_field(key, "current_step", current_step)?,
        done: done == "1",
    };
    Ok(Some((hash, raw_updated.clone())))
}

/// Read and parse a trace hash. `None` when the key is absent.
pub async fn read_trace_hash(
    store: &dyn HotStore,
    key: &str,
) -> StoreResult<Option<TraceHash>> {
    Ok(read_trace_hash_raw(store, key).await?.map(|(hash, _)| hash))
}

/// Read and parse a step hash. `None` when the key is absent.
pub async fn read_step_hash(store: &dyn HotStore, key: &str) -> StoreResult<Option<StepHash>> {
    let fields = store
        .hash_get(
            key,
            &["step_name", "iteration", "iterations", "started_at", "finished_at"],
        )
        .await?;
    let [step_name, iteration, iterations, started_at, finished_at] = fields.as_slice() else {
        return Err(StoreError::Integrity(format!("short hash read at {key}")));
    };
    let Some(step_name) = step_name else {
        return Ok(None);
    };
    let (Some(iteration), Some(iterations), Some(started_at)) =
        (iteration, iterations, started_at)
    else {
        return Err(StoreError::Integrity(format!("partial step hash at {key}")));
    };
    let iterations: u32 = parse_field(key, "iterations", iterations)?;
    Ok(Some(StepHash {
        step_name: step_name.clone(),
        iteration: parse_field(key, "iteration", iteration)?,
        iterations: (iterations != 0).then_some(iterations),
        started_at: parse_field(key, "started_at", started_at)?,
        finished_at: match finished_at {
            Some(raw) => Some(parse_field(key, "finished_at", raw)?),
            None => None,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_matches_contract() {
        assert_eq!(keys::trace("u1", "upload", "pbt_x"), "trace:u1:upload:pbt_x");
        assert_eq!(
            keys::trace_step("u1", "upload", "pbt_x", 2),
            "trace:u1:upload:pbt_x:step:2"
        );
        assert_eq!(
            keys::stats_whole("u1", "upload", 3, "arithmetic_mean"),
            "stats:u1:upload:3:arithmetic_mean"
        );
        assert_eq!(
            keys::stats_step("u1", "upload", 3, 2, "percentile_90"),
            "stats:u1:upload:3:2:percentile_90"
        );
        assert_eq!(keys::trace_count("u1", "upload", 3), "tcount:u1:upload:3");
        assert_eq!(keys::monthly_count(2024, 7), "tcount:2024:7");
        assert_eq!(
            keys::trace_channel("u1", "upload", "pbt_x"),
            "ps:trace:u1:upload:pbt_x"
        );
        assert!(keys::trace_channel("u1", "upload", "pbt_x")
            .starts_with(&keys::bar_channel_prefix("u1", "upload")));
    }
}
