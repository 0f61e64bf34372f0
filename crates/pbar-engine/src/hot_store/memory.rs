//! In-memory hot store.
//!
//! Backs tests and single-node deployments. TTLs are evaluated lazily
//! against the injected clock, so virtual-clock tests can expire keys by
//! advancing time. Guarded writes serialize behind one mutex, which is the
//! in-process equivalent of the networked store's transactional
//! compare-and-set.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use pbar_common::Clock;

use super::{Guard, HashWrite, HotStore, PubSubMessage, StoreResult};
use crate::error::StoreError;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    ZSet(BTreeMap<String, f64>),
    Scalar(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

/// In-memory `HotStore` implementation.
pub struct MemoryHotStore {
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Entry>,
    // Serializes guarded writes across keys.
    txn_lock: Mutex<()>,
    exact: DashMap<String, broadcast::Sender<PubSubMessage>>,
    prefixes: DashMap<String, broadcast::Sender<PubSubMessage>>,
    // Test hook: fail this many upcoming operations with Unavailable.
    fail_budget: AtomicU32,
}

impl fmt::Debug for MemoryHotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHotStore")
            .field("keys", &self.entries.len())
            .finish()
    }
}

impl MemoryHotStore {
    /// Create a store reading TTLs from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
            txn_lock: Mutex::new(()),
            exact: DashMap::new(),
            prefixes: DashMap::new(),
            fail_budget: AtomicU32::new(0),
        }
    }

    /// Make the next `n` operations fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Whether a key currently exists (TTL respected).
    pub fn contains_key(&self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    fn check_failure(&self) -> StoreResult<()> {
        let mut current = self.fail_budget.load(Ordering::SeqCst);
        while current > 0 {
            match self.fail_budget.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(StoreError::Unavailable("injected failure".to_string())),
                Err(observed) => current = observed,
            }
        }
        Ok(())
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) if at <= now => true,
                _ => return Some(entry.clone()),
            },
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn apply_hash_write(&self, write: &HashWrite) {
        let mut entry = self
            .live_entry(&write.key)
            .unwrap_or(Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
        if let Value::Hash(ref mut map) = entry.value {
            for (field, value) in &write.fields {
                map.insert(field.clone(), value.clone());
            }
        }
        if let Some(ttl) = write.ttl_seconds {
            entry.expires_at = Some(self.clock.now() + ttl);
        }
        self.entries.insert(write.key.clone(), entry);
    }

    fn guard_holds(&self, guard: &Guard) -> bool {
        let current = self.live_entry(&guard.key).and_then(|e| match e.value {
            Value::Hash(map) => map.get(&guard.field).cloned(),
            _ => None,
        });
        current == guard.expected
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn hash_get(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        self.check_failure()?;
        let map = match self.live_entry(key) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => map,
            _ => return Ok(vec![None; fields.len()]),
        };
        Ok(fields.iter().map(|f| map.get(*f).cloned()).collect())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        self.check_failure()?;
        self.apply_hash_write(&HashWrite::new(
            key,
            fields
                .iter()
                .map(|(f, v)| (f.to_string(), v.clone()))
                .collect(),
        ));
        Ok(())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.check_failure()?;
        let _guard = self.txn_lock.lock();
        let mut entry = self.live_entry(key).unwrap_or(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let next = match entry.value {
            Value::Hash(ref mut map) => {
                let current: i64 = map
                    .get(field)
                    .map(|raw| {
                        raw.parse().map_err(|_| {
                            StoreError::Integrity(format!(
                                "non-integer counter field {field}={raw:?} at {key}"
                            ))
                        })
                    })
                    .transpose()?
                    .unwrap_or(0);
                let next = current + delta;
                map.insert(field.to_string(), next.to_string());
                next
            }
            _ => {
                return Err(StoreError::Integrity(format!(
                    "counter key {key} holds a non-hash value"
                )))
            }
        };
        self.entries.insert(key.to_string(), entry);
        Ok(next)
    }

    async fn guarded_write(&self, guard: Guard, writes: Vec<HashWrite>) -> StoreResult<bool> {
        self.check_failure()?;
        let _txn = self.txn_lock.lock();
        if !self.guard_holds(&guard) {
            return Ok(false);
        }
        for write in &writes {
            self.apply_hash_write(write);
        }
        Ok(true)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.check_failure()?;
        let mut entry = self.live_entry(key).unwrap_or(Entry {
            value: Value::ZSet(BTreeMap::new()),
            expires_at: None,
        });
        match entry.value {
            Value::ZSet(ref mut set) => {
                set.insert(member.to_string(), score);
            }
            _ => {
                return Err(StoreError::Integrity(format!(
                    "sorted-set key {key} holds a non-zset value"
                )))
            }
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn zset_trim_below(&self, key: &str, floor: f64) -> StoreResult<u64> {
        self.check_failure()?;
        let Some(mut entry) = self.live_entry(key) else {
            return Ok(0);
        };
        let removed = match entry.value {
            Value::ZSet(ref mut set) => {
                let before = set.len();
                set.retain(|_, score| *score >= floor);
                (before - set.len()) as u64
            }
            _ => 0,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(removed)
    }

    async fn zset_count(&self, key: &str) -> StoreResult<u64> {
        self.check_failure()?;
        Ok(match self.live_entry(key) {
            Some(Entry {
                value: Value::ZSet(set),
                ..
            }) => set.len() as u64,
            _ => 0,
        })
    }

    async fn zset_latest(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        self.check_failure()?;
        Ok(match self.live_entry(key) {
            Some(Entry {
                value: Value::ZSet(set),
                ..
            }) => set
                .iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(m, s)| (m.clone(), *s)),
            _ => None,
        })
    }

    async fn expire(&self, key: &str, ttl_seconds: f64) -> StoreResult<()> {
        self.check_failure()?;
        if ttl_seconds <= 0.0 {
            self.entries.remove(key);
            return Ok(());
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(self.clock.now() + ttl_seconds);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_failure()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn scalar_set(&self, key: &str, value: String) -> StoreResult<()> {
        self.check_failure()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn scalar_get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_failure()?;
        Ok(match self.live_entry(key) {
            Some(Entry {
                value: Value::Scalar(v),
                ..
            }) => Some(v),
            _ => None,
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check_failure()?;
        let message = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        if let Some(sender) = self.exact.get(channel) {
            // Fire and forget; nobody listening is fine.
            let _ = sender.send(message.clone());
        }
        for entry in self.prefixes.iter() {
            if channel.starts_with(entry.key()) {
                let _ = entry.value().send(message.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<broadcast::Receiver<PubSubMessage>> {
        self.check_failure()?;
        Ok(self
            .exact
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe())
    }

    async fn subscribe_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<broadcast::Receiver<PubSubMessage>> {
        self.check_failure()?;
        Ok(self
            .prefixes
            .entry(prefix.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe())
    }
}
