//! Sampling policy.
//!
//! Decides, per completed trace, whether it joins the retained set that
//! feeds the predictor engine. Both techniques are parameterized by the
//! bar's `sampling_max_count` (N) and `sampling_max_age_seconds` (A, one
//! week when unbounded):
//!
//! - **systematic** retains a trace iff at least `A / N` seconds passed
//!   since the last retained trace, and evicts oldest-first beyond N.
//!   Oversamples quiet periods but the retained count is hard-bounded.
//! - **simple_random** retains each trace with probability `min(1, N / n)`,
//!   where n counts completions in the rolling window of width A. No hard
//!   bound; the expected count tends to N.
//!
//! Every completion is recorded in the rolling trace-count sorted set
//! (trimmed on insert) regardless of technique, so window counts are
//! available to both.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use pbar_common::{BarSchema, Clock, CompletedTrace, SamplingTechnique};

use crate::durable::DurableStore;
use crate::error::{with_store_retry, EngineError, RetryPolicy};
use crate::hot_store::{keys, HotStore};
use crate::predictor::PredictorEngine;

/// SplitMix64 pseudo-random number generator for the retention draw.
/// Seedable so retention decisions are reproducible in tests.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Create a generator seeded from entropy.
    pub fn from_entropy() -> Self {
        Self::new(uuid::Uuid::new_v4().as_u128() as u64)
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Outcome of the retention decision for one completed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionDecision {
    /// Persisted and fed to the predictor; `evicted` counts traces dropped
    /// to honor the systematic bound.
    Retained { evicted: usize },
    /// Not retained.
    Dropped,
}

/// Retain-or-drop policy over completed traces.
#[derive(Debug)]
pub struct SamplingPolicy {
    durable: Arc<dyn DurableStore>,
    hot: Arc<dyn HotStore>,
    predictor: Arc<PredictorEngine>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    draw: Mutex<SplitMix64>,
}

impl SamplingPolicy {
    /// Create a policy. `draw_seed` pins the retention draw for tests.
    pub fn new(
        durable: Arc<dyn DurableStore>,
        hot: Arc<dyn HotStore>,
        predictor: Arc<PredictorEngine>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        draw_seed: Option<u64>,
    ) -> Self {
        let draw = match draw_seed {
            Some(seed) => SplitMix64::new(seed),
            None => SplitMix64::from_entropy(),
        };
        Self {
            durable,
            hot,
            predictor,
            clock,
            retry,
            draw: Mutex::new(draw),
        }
    }

    /// Decide and, when retained, perform the retention writes: durable
    /// trace + steps insert, trace-count update, predictor refresh, and
    /// systematic eviction.
    pub async fn handle_completed(
        &self,
        schema: &BarSchema,
        trace: &CompletedTrace,
    ) -> Result<RetentionDecision, EngineError> {
        let now = self.clock.now();
        let zkey = keys::trace_count(&schema.owner, &schema.name, schema.version);
        let hot = self.hot.as_ref();
        let member = trace.uid.as_str();
        let score = trace.created_at;
        let floor = now - schema.sampling_window_seconds();
        let zkey_ref = zkey.as_str();
        with_store_retry(self.retry, "sampling.trace_count_add", || async move {
            hot.zset_add(zkey_ref, member, score).await?;
            hot.zset_trim_below(zkey_ref, floor).await?;
            Ok(())
        })
        .await?;

        let retain = match schema.sampling_technique {
            SamplingTechnique::Systematic => self.decide_systematic(schema, now).await?,
            SamplingTechnique::SimpleRandom => self.decide_simple_random(schema, &zkey).await?,
        };
        if !retain {
            debug!(
                bar = schema.bar_uid.as_str(),
                trace = trace.uid.as_str(),
                technique = %schema.sampling_technique,
                "trace dropped by sampling"
            );
            return Ok(RetentionDecision::Dropped);
        }
        self.retain(schema, trace).await
    }

    /// Retain iff no trace was retained within the last `A / N` seconds.
    async fn decide_systematic(
        &self,
        schema: &BarSchema,
        now: f64,
    ) -> Result<bool, EngineError> {
        let interval =
            schema.sampling_window_seconds() / f64::from(schema.sampling_max_count.max(1));
        let last = with_store_retry(self.retry, "sampling.latest_retained_at", || {
            self.durable
                .latest_retained_at(schema.bar_uid.as_str(), schema.version)
        })
        .await?;
        Ok(match last {
            None => true,
            Some(at) => now - at >= interval,
        })
    }

    /// Retain with probability `min(1, N / n)`; always while n is within N.
    async fn decide_simple_random(
        &self,
        schema: &BarSchema,
        zkey: &str,
    ) -> Result<bool, EngineError> {
        let n = with_store_retry(self.retry, "sampling.trace_count", || {
            self.hot.zset_count(zkey)
        })
        .await? as f64;
        let cap = f64::from(schema.sampling_max_count);
        if n <= cap {
            return Ok(true);
        }
        let p = (cap / n).min(1.0);
        let draw = self.draw.lock().next_f64();
        Ok(draw < p)
    }

    async fn retain(
        &self,
        schema: &BarSchema,
        trace: &CompletedTrace,
    ) -> Result<RetentionDecision, EngineError> {
        let inserted = with_store_retry(self.retry, "sampling.insert_trace", || {
            self.durable.insert_trace(trace)
        })
        .await?;
        if !inserted {
            // A retried retention; the earlier attempt already landed.
            debug!(trace = trace.uid.as_str(), "retention retry ignored");
            return Ok(RetentionDecision::Retained { evicted: 0 });
        }
        self.predictor.observe_retained(schema, trace).await?;

        let mut evicted_count = 0;
        if schema.sampling_technique == SamplingTechnique::Systematic {
            let evicted = with_store_retry(self.retry, "sampling.evict", || {
                self.durable.evict_oldest_beyond(
                    schema.bar_uid.as_str(),
                    schema.version,
                    schema.sampling_max_count,
                )
            })
            .await?;
            evicted_count = evicted.len();
            for old in &evicted {
                self.predictor.observe_evicted(schema, old).await?;
            }
        }
        info!(
            bar = schema.bar_uid.as_str(),
            trace = trace.uid.as_str(),
            evicted = evicted_count,
            "trace retained"
        );
        Ok(RetentionDecision::Retained {
            evicted: evicted_count,
        })
    }
}
