//! Error types for the telemetry core.
//!
//! Two recovery classes:
//! - `Conflict` and `StoreUnavailable` are retried locally with bounded
//!   budgets before surfacing.
//! - Everything else surfaces to the caller immediately.
//!
//! No error leaks partial state: retention writes are transactional and
//! hot-state writes are idempotent by key.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Errors from the underlying stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O failure; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store returned data that violates an invariant (e.g. a trace
    /// hash without its current step). Never retried.
    #[error("store integrity violation: {0}")]
    Integrity(String),
}

/// Validation failures raised by the trace intake state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("there is no in-progress trace with that uid for that progress bar")]
    TraceNotFound,

    #[error("that trace uid is already taken")]
    UidTaken,

    #[error("trace uid must be non-empty and free of ':' and whitespace")]
    UnsafeUid,

    #[error("the trace has already completed")]
    TraceCompleted,

    #[error("event targets position {got} but the trace is at position {expected}")]
    WrongPosition { expected: u32, got: u32 },

    #[error("the step is not iterated")]
    NotIterated,

    #[error("iteration went backwards: stored {stored}, got {got}")]
    BackwardsProgress { stored: u32, got: u32 },

    #[error("iteration {got} exceeds the declared {iterations} iterations")]
    IterationsOutOfRange { iterations: u32, got: u32 },

    #[error("an iterated step must declare at least one iteration")]
    ZeroIterations,

    #[error("step {position} has already finished")]
    StepAlreadyFinished { position: u32 },

    #[error("event time {got} precedes the trace's last update at {last}")]
    TimestampRegression { last: f64, got: f64 },
}

/// Error kinds produced by the core.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such progress bar: {owner}/{name}")]
    NoSuchBar { owner: String, name: String },

    #[error("schema drift at position {position}: expected {expected}, got {got}")]
    SchemaDrift {
        position: u32,
        /// Shape of the step the schema expects (name/iterated).
        expected: String,
        /// Shape the event carried.
        got: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("lost the trace update race after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    StoreUnavailable(StoreError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => EngineError::StoreUnavailable(e),
            StoreError::Integrity(msg) => EngineError::Internal(msg),
        }
    }
}

impl EngineError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::StoreUnavailable(_)
        )
    }
}

/// Retry budget for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt (milliseconds); doubles per retry.
    pub base_backoff_ms: u64,
    /// Backoff ceiling (milliseconds).
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based; attempt 1 has none).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Run a store operation, retrying `StoreError::Unavailable` with capped
/// exponential backoff. Integrity errors and successes pass through on the
/// first occurrence.
pub async fn with_store_retry<T, F, Fut>(
    policy: RetryPolicy,
    op: &str,
    mut f: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(StoreError::Unavailable(msg)) if attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt + 1);
                warn!(op, attempt, error = %msg, backoff_ms = backoff.as_millis() as u64, "transient store failure, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
