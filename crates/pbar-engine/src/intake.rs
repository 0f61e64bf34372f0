//! Trace intake state machine.
//!
//! Consumes the per-trace stream of step events, validating each against
//! the bar's schema and advancing the hot-state projection. Per-trace
//! writes are linearized by a compare-and-set on `last_updated_at`: a
//! losing writer re-reads and retries up to the configured budget, then
//! surfaces `Conflict`.
//!
//! States per trace: fresh -> running(step=i) -> completed | aborted.
//! Completion hands the trace to the sampling policy and counts usage;
//! aborts (schema drift, idle expiry) never reach sampling.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pbar_common::{reconcile_client_now, BarSchema, Clock, CompletedTrace, ExternalId, TraceStep};

use crate::config::IntakeConfig;
use crate::error::{with_store_retry, EngineError, RetryPolicy, StoreError, ValidationError};
use crate::hot_store::{
    keys, read_step_hash, read_trace_hash_raw, Guard, HashWrite, HotStore, StepHash, TraceHash,
};
use crate::registry::SchemaRegistry;
use crate::sampling::{RetentionDecision, SamplingPolicy};
use crate::usage::{Entitlements, UsageTracker};

/// One step event within a trace stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    /// The step at `position` began. `iterations` is present iff the step
    /// is iterated.
    Start {
        position: u32,
        step_name: String,
        iterations: Option<u32>,
    },
    /// Progress within the active iterated step.
    Progress { position: u32, iteration: u32 },
    /// The step at `position` finished.
    Finish { position: u32 },
}

impl StepEvent {
    /// The position the event targets.
    pub fn position(&self) -> u32 {
        match self {
            StepEvent::Start { position, .. }
            | StepEvent::Progress { position, .. }
            | StepEvent::Finish { position } => *position,
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntakeOutcome {
    /// Whether this event completed the trace.
    pub completed: bool,
    /// The sampling decision, when the trace completed.
    pub retention: Option<RetentionDecision>,
}

enum Attempt {
    Applied { completed: bool },
    LostRace,
}

/// The per-trace state machine.
#[derive(Debug)]
pub struct TraceIntake {
    registry: Arc<SchemaRegistry>,
    hot: Arc<dyn HotStore>,
    durable: Arc<dyn crate::durable::DurableStore>,
    clock: Arc<dyn Clock>,
    sampler: Arc<SamplingPolicy>,
    usage: Arc<UsageTracker>,
    entitlements: Arc<dyn Entitlements>,
    config: IntakeConfig,
    retry: RetryPolicy,
}

impl TraceIntake {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SchemaRegistry>,
        hot: Arc<dyn HotStore>,
        durable: Arc<dyn crate::durable::DurableStore>,
        clock: Arc<dyn Clock>,
        sampler: Arc<SamplingPolicy>,
        usage: Arc<UsageTracker>,
        entitlements: Arc<dyn Entitlements>,
        config: IntakeConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            hot,
            durable,
            clock,
            sampler,
            usage,
            entitlements,
            config,
            retry,
        }
    }

    /// Apply one event to a trace, creating it on the first event.
    ///
    /// `client_now` is the client-reported event time; it is used when
    /// within clock-skew tolerance of the server clock.
    pub async fn apply(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        event: StepEvent,
        client_now: f64,
    ) -> Result<IntakeOutcome, EngineError> {
        let schema = self.registry.resolve(owner, bar_name).await?;
        let now = reconcile_client_now(self.clock.now(), client_now);

        let mut attempts = 0;
        let completed = loop {
            attempts += 1;
            match self
                .try_apply_once(&schema, owner, bar_name, trace_uid, &event, now)
                .await?
            {
                Attempt::Applied { completed } => break completed,
                Attempt::LostRace if attempts < self.config.cas_retry_limit => {
                    debug!(trace = trace_uid, attempts, "lost update race, retrying");
                }
                Attempt::LostRace => return Err(EngineError::Conflict { attempts }),
            }
        };

        let retention = if completed {
            Some(self.complete(&schema, owner, bar_name, trace_uid).await?)
        } else {
            None
        };
        Ok(IntakeOutcome {
            completed,
            retention,
        })
    }

    /// Abort the trace when it has sat idle past the bar's bound. Returns
    /// whether an abort happened. Aborted traces are never sampled.
    pub async fn abort_if_idle(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
    ) -> Result<bool, EngineError> {
        let trace_key = keys::trace(owner, bar_name, trace_uid);
        let Some((trace, _)) = self.read_trace(&trace_key).await? else {
            return Ok(false);
        };
        if trace.done {
            return Ok(false);
        }
        if self.clock.now() - trace.last_updated_at <= self.config.idle_expiry_seconds {
            return Ok(false);
        }
        warn!(trace = trace_uid, "aborting idle trace");
        self.abort(owner, bar_name, trace_uid, trace.current_step)
            .await?;
        Ok(true)
    }

    async fn try_apply_once(
        &self,
        schema: &BarSchema,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        event: &StepEvent,
        now: f64,
    ) -> Result<Attempt, EngineError> {
        let trace_key = keys::trace(owner, bar_name, trace_uid);
        let existing = self.read_trace(&trace_key).await?;

        let Some((trace, cas_token)) = existing else {
            return match event {
                StepEvent::Start {
                    position: 1,
                    step_name,
                    iterations,
                } => {
                    self.create_trace(schema, owner, bar_name, trace_uid, step_name, *iterations, now)
                        .await
                }
                _ => Err(ValidationError::TraceNotFound.into()),
            };
        };

        if trace.done {
            return Err(ValidationError::TraceCompleted.into());
        }
        if self.clock.now() - trace.last_updated_at > self.config.idle_expiry_seconds {
            warn!(trace = trace_uid, "event arrived for idle trace, aborting");
            self.abort(owner, bar_name, trace_uid, trace.current_step)
                .await?;
            return Err(ValidationError::TraceNotFound.into());
        }
        if now < trace.last_updated_at {
            return Err(ValidationError::TimestampRegression {
                last: trace.last_updated_at,
                got: now,
            }
            .into());
        }

        let step_key = keys::trace_step(owner, bar_name, trace_uid, trace.current_step);
        let step = with_store_retry(self.retry, "intake.read_step", || {
            read_step_hash(self.hot.as_ref(), &step_key)
        })
        .await?
        .ok_or_else(|| {
            EngineError::from(StoreError::Integrity(format!(
                "trace {trace_uid} exists but its current step {} does not",
                trace.current_step
            )))
        })?;

        match event {
            StepEvent::Start {
                position,
                step_name,
                iterations,
            } => {
                self.start_next_step(
                    schema,
                    owner,
                    bar_name,
                    trace_uid,
                    &trace_key,
                    cas_token,
                    trace.current_step,
                    &step,
                    *position,
                    step_name,
                    *iterations,
                    now,
                )
                .await
            }
            StepEvent::Progress {
                position,
                iteration,
            } => {
                let attempt = self
                    .progress_step(
                        &trace_key,
                        &step_key,
                        cas_token,
                        trace.current_step,
                        &step,
                        *position,
                        *iteration,
                        now,
                    )
                    .await?;
                self.publish(owner, bar_name, trace_uid, "updated", &attempt)
                    .await;
                Ok(attempt)
            }
            StepEvent::Finish { position } => {
                let attempt = self
                    .finish_step(
                        schema,
                        &trace_key,
                        &step_key,
                        cas_token,
                        trace.current_step,
                        &step,
                        *position,
                        now,
                    )
                    .await?;
                self.publish(owner, bar_name, trace_uid, "updated", &attempt)
                    .await;
                Ok(attempt)
            }
        }
    }

    /// Publish one notification for an applied mutation; lost messages are
    /// logged, never surfaced.
    async fn publish(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        payload: &str,
        attempt: &Attempt,
    ) {
        if !matches!(attempt, Attempt::Applied { .. }) {
            return;
        }
        let channel = keys::trace_channel(owner, bar_name, trace_uid);
        if let Err(e) = self.hot.publish(&channel, payload).await {
            warn!(channel = %channel, error = %e, "failed to publish trace update");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_trace(
        &self,
        schema: &BarSchema,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        step_name: &str,
        iterations: Option<u32>,
        now: f64,
    ) -> Result<Attempt, EngineError> {
        self.entitlements.check_trace_allowed(owner).await?;
        if !ExternalId::from(trace_uid).is_key_safe() {
            return Err(ValidationError::UnsafeUid.into());
        }
        let taken = with_store_retry(self.retry, "intake.trace_exists", || {
            self.durable.trace_exists(trace_uid)
        })
        .await?;
        if taken {
            return Err(ValidationError::UidTaken.into());
        }
        validate_start(schema, 1, step_name, iterations)?;

        let trace_key = keys::trace(owner, bar_name, trace_uid);
        let step_key = keys::trace_step(owner, bar_name, trace_uid, 1);
        let ttl = self.config.inflight_ttl_seconds;
        let applied = self
            .hot
            .guarded_write(
                Guard::absent(trace_key.as_str(), "created_at"),
                vec![
                    HashWrite::new(
                        trace_key.as_str(),
                        vec![
                            ("created_at".to_string(), now.to_string()),
                            ("last_updated_at".to_string(), now.to_string()),
                            ("current_step".to_string(), "1".to_string()),
                            ("done".to_string(), "0".to_string()),
                        ],
                    )
                    .with_ttl(ttl),
                    HashWrite::new(
                        step_key.as_str(),
                        vec![
                            ("step_name".to_string(), step_name.to_string()),
                            ("iteration".to_string(), "0".to_string()),
                            (
                                "iterations".to_string(),
                                iterations.unwrap_or(0).to_string(),
                            ),
                            ("started_at".to_string(), now.to_string()),
                        ],
                    )
                    .with_ttl(ttl),
                ],
            )
            .await
            .map_err(EngineError::from)?;
        if !applied {
            return Ok(Attempt::LostRace);
        }
        info!(owner, bar = bar_name, trace = trace_uid, "trace started");
        let attempt = Attempt::Applied { completed: false };
        self.publish(owner, bar_name, trace_uid, "created", &attempt)
            .await;
        Ok(attempt)
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_next_step(
        &self,
        schema: &BarSchema,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        trace_key: &str,
        cas_token: String,
        current_step: u32,
        current: &StepHash,
        position: u32,
        step_name: &str,
        iterations: Option<u32>,
        now: f64,
    ) -> Result<Attempt, EngineError> {
        if position != current_step + 1 {
            return Err(if position == 1 {
                ValidationError::UidTaken.into()
            } else {
                ValidationError::WrongPosition {
                    expected: current_step + 1,
                    got: position,
                }
                .into()
            });
        }
        if let Err(drift) = validate_start(schema, position, step_name, iterations) {
            if matches!(drift, EngineError::SchemaDrift { .. }) {
                // Drift aborts the trace; the event never lands.
                self.abort(owner, bar_name, trace_uid, current_step).await?;
            }
            return Err(drift);
        }

        let current_key = keys::trace_step(owner, bar_name, trace_uid, current_step);
        let next_key = keys::trace_step(owner, bar_name, trace_uid, position);
        let ttl = self.config.inflight_ttl_seconds;

        // Close out the running step; an explicit Finish may already have.
        let mut current_fields = Vec::new();
        if current.finished_at.is_none() {
            if let Some(n) = current.iterations {
                current_fields.push(("iteration".to_string(), n.to_string()));
            }
            current_fields.push(("finished_at".to_string(), now.to_string()));
        }

        let mut writes = Vec::new();
        if !current_fields.is_empty() {
            writes.push(HashWrite::new(current_key.as_str(), current_fields).with_ttl(ttl));
        } else {
            writes.push(HashWrite::new(current_key.as_str(), Vec::new()).with_ttl(ttl));
        }
        writes.push(
            HashWrite::new(
                trace_key,
                vec![
                    ("last_updated_at".to_string(), now.to_string()),
                    ("current_step".to_string(), position.to_string()),
                ],
            )
            .with_ttl(ttl),
        );
        writes.push(
            HashWrite::new(
                next_key.as_str(),
                vec![
                    ("step_name".to_string(), step_name.to_string()),
                    ("iteration".to_string(), "0".to_string()),
                    (
                        "iterations".to_string(),
                        iterations.unwrap_or(0).to_string(),
                    ),
                    ("started_at".to_string(), now.to_string()),
                ],
            )
            .with_ttl(ttl),
        );

        let applied = self
            .hot
            .guarded_write(
                Guard::equals(trace_key, "last_updated_at", cas_token),
                writes,
            )
            .await
            .map_err(EngineError::from)?;
        if !applied {
            return Ok(Attempt::LostRace);
        }
        let attempt = Attempt::Applied { completed: false };
        self.publish(owner, bar_name, trace_uid, "updated", &attempt)
            .await;
        Ok(attempt)
    }

    #[allow(clippy::too_many_arguments)]
    async fn progress_step(
        &self,
        trace_key: &str,
        step_key: &str,
        cas_token: String,
        current_step: u32,
        current: &StepHash,
        position: u32,
        iteration: u32,
        now: f64,
    ) -> Result<Attempt, EngineError> {
        if position != current_step {
            return Err(ValidationError::WrongPosition {
                expected: current_step,
                got: position,
            }
            .into());
        }
        if current.finished_at.is_some() {
            return Err(ValidationError::StepAlreadyFinished { position }.into());
        }
        let Some(iterations) = current.iterations else {
            return Err(ValidationError::NotIterated.into());
        };
        if iteration <= current.iteration {
            return Err(ValidationError::BackwardsProgress {
                stored: current.iteration,
                got: iteration,
            }
            .into());
        }
        if iteration > iterations {
            return Err(ValidationError::IterationsOutOfRange {
                iterations,
                got: iteration,
            }
            .into());
        }

        let ttl = self.config.inflight_ttl_seconds;
        let applied = self
            .hot
            .guarded_write(
                Guard::equals(trace_key, "last_updated_at", cas_token),
                vec![
                    HashWrite::new(
                        step_key,
                        vec![("iteration".to_string(), iteration.to_string())],
                    )
                    .with_ttl(ttl),
                    HashWrite::new(
                        trace_key,
                        vec![("last_updated_at".to_string(), now.to_string())],
                    )
                    .with_ttl(ttl),
                ],
            )
            .await
            .map_err(EngineError::from)?;
        if !applied {
            return Ok(Attempt::LostRace);
        }
        Ok(Attempt::Applied { completed: false })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_step(
        &self,
        schema: &BarSchema,
        trace_key: &str,
        step_key: &str,
        cas_token: String,
        current_step: u32,
        current: &StepHash,
        position: u32,
        now: f64,
    ) -> Result<Attempt, EngineError> {
        if position != current_step {
            return Err(ValidationError::WrongPosition {
                expected: current_step,
                got: position,
            }
            .into());
        }
        if current.finished_at.is_some() {
            return Err(ValidationError::StepAlreadyFinished { position }.into());
        }
        let is_final = position == schema.final_position();

        let mut step_fields = vec![("finished_at".to_string(), now.to_string())];
        if let Some(n) = current.iterations {
            // Finish implicitly completes the remaining iterations.
            step_fields.push(("iteration".to_string(), n.to_string()));
        }
        let trace_fields = if is_final {
            vec![
                ("last_updated_at".to_string(), now.to_string()),
                ("done".to_string(), "1".to_string()),
            ]
        } else {
            vec![("last_updated_at".to_string(), now.to_string())]
        };
        let ttl = if is_final {
            self.config.completion_grace_seconds
        } else {
            self.config.inflight_ttl_seconds
        };

        let applied = self
            .hot
            .guarded_write(
                Guard::equals(trace_key, "last_updated_at", cas_token),
                vec![
                    HashWrite::new(step_key, step_fields).with_ttl(ttl),
                    HashWrite::new(trace_key, trace_fields).with_ttl(ttl),
                ],
            )
            .await
            .map_err(EngineError::from)?;
        if !applied {
            return Ok(Attempt::LostRace);
        }
        Ok(Attempt::Applied {
            completed: is_final,
        })
    }

    /// Build the completed-trace projection, cut hot TTLs to the grace
    /// window, and hand the trace to usage accounting and sampling.
    async fn complete(
        &self,
        schema: &BarSchema,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
    ) -> Result<RetentionDecision, EngineError> {
        let trace_key = keys::trace(owner, bar_name, trace_uid);
        let (trace, _) = self
            .read_trace(&trace_key)
            .await?
            .ok_or_else(|| {
                EngineError::from(StoreError::Integrity(format!(
                    "completed trace {trace_uid} vanished before retention"
                )))
            })?;

        let mut steps = Vec::with_capacity(schema.steps.len());
        for position in 1..=schema.final_position() {
            let step_key = keys::trace_step(owner, bar_name, trace_uid, position);
            let step = with_store_retry(self.retry, "intake.read_completed_step", || {
                read_step_hash(self.hot.as_ref(), &step_key)
            })
            .await?
            .ok_or_else(|| {
                EngineError::from(StoreError::Integrity(format!(
                    "completed trace {trace_uid} is missing step {position}"
                )))
            })?;
            steps.push(TraceStep {
                position,
                step_name: step.step_name,
                iterations: step.iterations,
                started_at: step.started_at,
                finished_at: step.finished_at,
            });
            // Late readers can still snapshot during the grace window.
            self.hot
                .expire(&step_key, self.config.completion_grace_seconds)
                .await
                .map_err(EngineError::from)?;
        }
        self.hot
            .expire(&trace_key, self.config.completion_grace_seconds)
            .await
            .map_err(EngineError::from)?;

        let completed = CompletedTrace {
            uid: ExternalId::from(trace_uid),
            bar_uid: schema.bar_uid.clone(),
            bar_version: schema.version,
            created_at: trace.created_at,
            steps,
        };
        info!(owner, bar = bar_name, trace = trace_uid, "trace completed");
        self.usage.record_completion(owner).await?;
        self.sampler.handle_completed(schema, &completed).await
    }

    /// Remove the trace's hot state and announce the abort.
    async fn abort(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        current_step: u32,
    ) -> Result<(), EngineError> {
        for position in 1..=current_step {
            self.hot
                .delete(&keys::trace_step(owner, bar_name, trace_uid, position))
                .await
                .map_err(EngineError::from)?;
        }
        self.hot
            .delete(&keys::trace(owner, bar_name, trace_uid))
            .await
            .map_err(EngineError::from)?;
        self.hot
            .publish(&keys::trace_channel(owner, bar_name, trace_uid), "aborted")
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// Read the trace hash, returning the parsed form plus the raw
    /// `last_updated_at` string used as the compare-and-set token.
    async fn read_trace(
        &self,
        trace_key: &str,
    ) -> Result<Option<(TraceHash, String)>, EngineError> {
        with_store_retry(self.retry, "intake.read_trace", || {
            read_trace_hash_raw(self.hot.as_ref(), trace_key)
        })
        .await
    }
}

/// Check a StepStart against the schema. Any disagreement in position,
/// name, or iterated-ness is schema drift.
fn validate_start(
    schema: &BarSchema,
    position: u32,
    step_name: &str,
    iterations: Option<u32>,
) -> Result<(), EngineError> {
    if iterations == Some(0) {
        return Err(ValidationError::ZeroIterations.into());
    }
    let Some(spec) = schema.step_at(position) else {
        return Err(EngineError::SchemaDrift {
            position,
            expected: "no step at this position".to_string(),
            got: format!("{step_name} (iterated={})", iterations.is_some()),
        });
    };
    if spec.name != step_name || spec.iterated != iterations.is_some() {
        return Err(EngineError::SchemaDrift {
            position,
            expected: format!("{} (iterated={})", spec.name, spec.iterated),
            got: format!("{step_name} (iterated={})", iterations.is_some()),
        });
    }
    Ok(())
}
