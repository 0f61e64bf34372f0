//! Shared types and utilities for the progress-bar telemetry service.
//!
//! This crate contains:
//! - External identifiers (prefixed 128-bit ids)
//! - The wall-clock seam (`Clock`, `SystemClock`, `VirtualClock`)
//! - Schema types (bars, step specs, traces) and statistical techniques

pub mod clock;
pub mod ids;
pub mod types;

pub use clock::{reconcile_client_now, Clock, SystemClock, VirtualClock};
pub use ids::ExternalId;
pub use types::*;
