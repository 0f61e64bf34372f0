//! Engine facade.
//!
//! Wires the registry, intake state machine, sampling policy, predictor,
//! usage tracking, and subscription fabric over a durable store, a hot
//! store, and a clock, and exposes the logical ingest operations:
//! begin_step, progress_step, finish_step, query_estimate, subscribe_trace.

use std::sync::Arc;

use pbar_common::Clock;

use crate::config::EngineConfig;
use crate::durable::DurableStore;
use crate::error::EngineError;
use crate::fabric::{Subscription, SubscriptionFabric};
use crate::hot_store::HotStore;
use crate::intake::{IntakeOutcome, StepEvent, TraceIntake};
use crate::predictor::{Prediction, PredictorEngine};
use crate::registry::SchemaRegistry;
use crate::sampling::SamplingPolicy;
use crate::usage::{Entitlements, UsageTracker};

/// What an estimate query targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EstimateTarget {
    /// The whole-trace estimate.
    Whole,
    /// One step, optionally at a known iteration count.
    Step {
        position: u32,
        iterations: Option<u32>,
    },
}

/// The assembled telemetry core.
#[derive(Debug)]
pub struct Engine {
    registry: Arc<SchemaRegistry>,
    predictor: Arc<PredictorEngine>,
    sampler: Arc<SamplingPolicy>,
    usage: Arc<UsageTracker>,
    intake: TraceIntake,
    fabric: SubscriptionFabric,
}

impl Engine {
    /// Assemble an engine over the given stores and collaborators.
    pub fn new(
        config: EngineConfig,
        durable: Arc<dyn DurableStore>,
        hot: Arc<dyn HotStore>,
        clock: Arc<dyn Clock>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Self {
        let registry = Arc::new(SchemaRegistry::new(Arc::clone(&durable), config.retry));
        let predictor = Arc::new(PredictorEngine::new(
            Arc::clone(&durable),
            Arc::clone(&hot),
            Arc::clone(&clock),
            config.predictor,
            config.retry,
        ));
        let sampler = Arc::new(SamplingPolicy::new(
            Arc::clone(&durable),
            Arc::clone(&hot),
            Arc::clone(&predictor),
            Arc::clone(&clock),
            config.retry,
            config.sampling.draw_seed,
        ));
        let usage = Arc::new(UsageTracker::new(Arc::clone(&hot), Arc::clone(&clock)));
        let intake = TraceIntake::new(
            Arc::clone(&registry),
            Arc::clone(&hot),
            Arc::clone(&durable),
            Arc::clone(&clock),
            Arc::clone(&sampler),
            Arc::clone(&usage),
            entitlements,
            config.intake,
            config.retry,
        );
        let fabric = SubscriptionFabric::new(Arc::clone(&hot), config.fabric);
        Self {
            registry,
            predictor,
            sampler,
            usage,
            intake,
            fabric,
        }
    }

    /// The schema registry, for bar registration and rotation.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The predictor engine, for direct estimate access.
    pub fn predictor(&self) -> &PredictorEngine {
        &self.predictor
    }

    /// The sampling policy.
    pub fn sampler(&self) -> &SamplingPolicy {
        &self.sampler
    }

    /// The usage tracker.
    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// The intake state machine, for idle sweeps.
    pub fn intake(&self) -> &TraceIntake {
        &self.intake
    }

    /// Begin a step (position 1 starts the trace).
    pub async fn begin_step(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        position: u32,
        step_name: &str,
        iterations: Option<u32>,
        client_now: f64,
    ) -> Result<IntakeOutcome, EngineError> {
        self.intake
            .apply(
                owner,
                bar_name,
                trace_uid,
                StepEvent::Start {
                    position,
                    step_name: step_name.to_string(),
                    iterations,
                },
                client_now,
            )
            .await
    }

    /// Report progress within the active iterated step.
    pub async fn progress_step(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        position: u32,
        iteration: u32,
        client_now: f64,
    ) -> Result<IntakeOutcome, EngineError> {
        self.intake
            .apply(
                owner,
                bar_name,
                trace_uid,
                StepEvent::Progress {
                    position,
                    iteration,
                },
                client_now,
            )
            .await
    }

    /// Finish the active step; finishing the final step completes the
    /// trace and runs the retention pipeline.
    pub async fn finish_step(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
        position: u32,
        client_now: f64,
    ) -> Result<IntakeOutcome, EngineError> {
        self.intake
            .apply(
                owner,
                bar_name,
                trace_uid,
                StepEvent::Finish { position },
                client_now,
            )
            .await
    }

    /// Query a fitted estimate for a bar's current version.
    pub async fn query_estimate(
        &self,
        owner: &str,
        bar_name: &str,
        target: EstimateTarget,
    ) -> Result<Prediction, EngineError> {
        let schema = self.registry.resolve(owner, bar_name).await?;
        match target {
            EstimateTarget::Whole => self.predictor.predict_whole(&schema).await,
            EstimateTarget::Step {
                position,
                iterations,
            } => {
                self.predictor
                    .predict_step(&schema, position, iterations)
                    .await
            }
        }
    }

    /// Subscribe to one trace's live updates.
    pub async fn subscribe_trace(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
    ) -> Result<Subscription, EngineError> {
        self.fabric.subscribe_trace(owner, bar_name, trace_uid).await
    }

    /// Subscribe to every trace of a bar.
    pub async fn subscribe_bar(
        &self,
        owner: &str,
        bar_name: &str,
    ) -> Result<Subscription, EngineError> {
        self.fabric.subscribe_bar(owner, bar_name).await
    }
}
