//! Per-owner usage accounting and the entitlement seam.
//!
//! Completed traces increment a monthly counter hashed by owner; billing
//! reads it elsewhere. The `Entitlements` collaborator is consulted before
//! a trace starts; the core only surfaces its verdict as `RateLimited`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike};

use pbar_common::Clock;

use crate::error::EngineError;
use crate::hot_store::{keys, HotStore};

/// UTC (year, month) bucket for an epoch timestamp.
pub fn utc_year_month(epoch_seconds: f64) -> (i32, u32) {
    match DateTime::from_timestamp(epoch_seconds as i64, 0) {
        Some(dt) => (dt.year(), dt.month()),
        None => (1970, 1),
    }
}

/// Monthly per-owner completion counter.
#[derive(Debug)]
pub struct UsageTracker {
    hot: Arc<dyn HotStore>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    /// Create a tracker over the hot store.
    pub fn new(hot: Arc<dyn HotStore>, clock: Arc<dyn Clock>) -> Self {
        Self { hot, clock }
    }

    /// Count one completed trace for `owner` in the current UTC month.
    /// Returns the owner's new total for the month.
    pub async fn record_completion(&self, owner: &str) -> Result<i64, EngineError> {
        let (year, month) = utc_year_month(self.clock.now());
        Ok(self
            .hot
            .hash_incr_by(&keys::monthly_count(year, month), owner, 1)
            .await?)
    }

    /// Read an owner's completion count for a month.
    pub async fn month_count(
        &self,
        owner: &str,
        year: i32,
        month: u32,
    ) -> Result<i64, EngineError> {
        let raw = self
            .hot
            .hash_get(&keys::monthly_count(year, month), &[owner])
            .await?;
        Ok(raw[0]
            .as_deref()
            .map(|v| v.parse().unwrap_or(0))
            .unwrap_or(0))
    }
}

/// External entitlement check consulted before a trace starts.
#[async_trait]
pub trait Entitlements: Send + Sync + fmt::Debug {
    /// Deny with [`EngineError::RateLimited`] to refuse the trace.
    async fn check_trace_allowed(&self, owner: &str) -> Result<(), EngineError>;
}

/// Entitlement policy that always allows; the default when billing is not
/// wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Entitlements for AllowAll {
    async fn check_trace_allowed(&self, _owner: &str) -> Result<(), EngineError> {
        Ok(())
    }
}
