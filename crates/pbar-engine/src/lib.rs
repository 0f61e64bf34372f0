//! Prediction and sampling core of the progress-bar telemetry service.
//!
//! Clients define named progress bars (ordered step sequences); each run
//! emits a trace of per-step timings. This crate validates and applies the
//! event stream, retains a bounded statistical sample of completed traces,
//! keeps per-step fitted predictors consistent with the retained set, and
//! fans live trace updates out to subscribers.
//!
//! ## Modules
//!
//! - `config`: configuration loading and validation
//! - `registry`: (owner, bar name) -> schema resolution with caching
//! - `hot_store`: key-value + pub/sub adapter and the in-memory fake
//! - `durable`: relational store contract, in-memory and SQLite backends
//! - `intake`: the per-trace event state machine
//! - `sampling`: systematic and simple-random retention
//! - `predictor`: incremental per-step and whole-trace estimators
//! - `fabric`: bounded-queue pub/sub fan-out to long-poll readers
//! - `usage`: monthly usage counters and the entitlement seam

pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod hot_store;
pub mod intake;
pub mod predictor;
pub mod registry;
pub mod sampling;
pub mod usage;

pub use config::{EngineConfig, FabricConfig, IntakeConfig, PredictorConfig, SamplingConfig};
pub use durable::{DurableStore, MemoryDurableStore, SqliteDurableStore, StepSample};
pub use engine::{Engine, EstimateTarget};
pub use error::{EngineError, RetryPolicy, StoreError, ValidationError};
pub use fabric::{Subscription, SubscriptionEvent, SubscriptionFabric};
pub use hot_store::{
    keys, Guard, HashWrite, HotStore, MemoryHotStore, PubSubMessage, StepHash, StoreResult,
    TraceHash,
};
pub use intake::{IntakeOutcome, StepEvent, TraceIntake};
pub use predictor::{CellKey, CellTarget, FittedParams, Prediction, PredictorEngine};
pub use registry::SchemaRegistry;
pub use sampling::{RetentionDecision, SamplingPolicy, SplitMix64};
pub use usage::{AllowAll, Entitlements, UsageTracker};
