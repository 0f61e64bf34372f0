//! Integration tests for the trace intake state machine.
//!
//! These drive the assembled engine end-to-end against the in-memory
//! stores and a virtual clock: trace lifecycle, validation failures,
//! schema drift, idle expiry, and the hot-state TTL windows.

use std::sync::Arc;

use async_trait::async_trait;
use pbar_common::{
    BarSchema, Clock, ExternalId, SamplingTechnique, StepSpec, Technique, VirtualClock,
    DEFAULT_PERCENTILE,
};
use pbar_engine::{
    keys, AllowAll, DurableStore, EngineConfig, EngineError, Entitlements, MemoryDurableStore,
    MemoryHotStore, RetentionDecision, ValidationError,
};

fn step(name: &str, position: u32, iterated: bool) -> StepSpec {
    StepSpec {
        uid: ExternalId::step(),
        name: name.to_string(),
        position,
        iterated,
        one_off_technique: Technique::ArithmeticMean,
        one_off_percentile: DEFAULT_PERCENTILE,
        iterated_technique: Technique::ArithmeticMean,
        iterated_percentile: DEFAULT_PERCENTILE,
        created_at: 0.0,
    }
}

fn schema(steps: Vec<StepSpec>) -> BarSchema {
    BarSchema {
        bar_uid: ExternalId::bar(),
        owner: "u1".to_string(),
        name: "job".to_string(),
        version: 1,
        sampling_max_count: 100,
        sampling_max_age_seconds: Some(3_600),
        sampling_technique: SamplingTechnique::Systematic,
        default_spec: StepSpec::default_spec(0.0),
        steps,
        created_at: 0.0,
    }
}

struct Fixture {
    engine: pbar_engine::Engine,
    durable: Arc<MemoryDurableStore>,
    hot: Arc<MemoryHotStore>,
    clock: VirtualClock,
}

impl Fixture {
    async fn new(steps: Vec<StepSpec>) -> Self {
        Self::with_entitlements(steps, Arc::new(AllowAll)).await
    }

    async fn with_entitlements(
        steps: Vec<StepSpec>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Self {
        let clock = VirtualClock::new(1_000.0);
        let durable = Arc::new(MemoryDurableStore::new());
        let hot = Arc::new(MemoryHotStore::new(Arc::new(clock.clone())));
        let engine = pbar_engine::Engine::new(
            EngineConfig::default(),
            durable.clone(),
            hot.clone(),
            Arc::new(clock.clone()),
            entitlements,
        );
        engine.registry().register(schema(steps)).await.unwrap();
        Fixture {
            engine,
            durable,
            hot,
            clock,
        }
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }
}

#[tokio::test]
async fn full_lifecycle_completes_and_retains() {
    let f = Fixture::new(vec![step("parse", 1, false), step("convert", 2, true)]).await;

    let out = f
        .engine
        .begin_step("u1", "job", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap();
    assert!(!out.completed);

    f.clock.advance(2.0);
    f.engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap();

    f.engine
        .begin_step("u1", "job", "pbt_1", 2, "convert", Some(4), f.now())
        .await
        .unwrap();
    f.clock.advance(1.0);
    f.engine
        .progress_step("u1", "job", "pbt_1", 2, 2, f.now())
        .await
        .unwrap();
    f.clock.advance(1.0);
    let out = f
        .engine
        .finish_step("u1", "job", "pbt_1", 2, f.now())
        .await
        .unwrap();
    assert!(out.completed);
    assert_eq!(out.retention, Some(RetentionDecision::Retained { evicted: 0 }));

    // The trace landed durably with both steps finished in order.
    let retained = f.durable.load_trace("pbt_1").await.unwrap().unwrap();
    assert_eq!(retained.steps.len(), 2);
    assert_eq!(retained.created_at, 1_000.0);
    assert_eq!(retained.steps[0].finished_at, Some(1_002.0));
    assert_eq!(retained.steps[1].iterations, Some(4));
    assert_eq!(retained.steps[1].finished_at, Some(1_004.0));

    // Completion counted toward the owner's monthly usage.
    let (year, month) = pbar_engine::usage::utc_year_month(f.now());
    assert_eq!(
        f.engine.usage().month_count("u1", year, month).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn hot_state_follows_the_contract_keyspace() {
    let f = Fixture::new(vec![step("parse", 1, false)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap();

    assert!(f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
    assert!(f.hot.contains_key(&keys::trace_step("u1", "job", "pbt_1", 1)));
}

#[tokio::test]
async fn completion_cuts_ttl_to_the_grace_window() {
    let f = Fixture::new(vec![step("parse", 1, false)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap();
    f.clock.advance(1.0);
    f.engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap();

    // Within the 5-minute grace window late readers still see the trace.
    f.clock.advance(200.0);
    assert!(f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));

    f.clock.advance(200.0);
    assert!(!f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
    assert!(!f.hot.contains_key(&keys::trace_step("u1", "job", "pbt_1", 1)));
}

#[tokio::test]
async fn events_on_unknown_traces_are_rejected() {
    let f = Fixture::new(vec![step("parse", 1, false)]).await;

    let err = f
        .engine
        .finish_step("u1", "job", "pbt_missing", 1, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TraceNotFound)
    ));

    // First event must be a position-1 start.
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_missing", 2, "parse", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TraceNotFound)
    ));
}

#[tokio::test]
async fn unknown_bars_surface_no_such_bar() {
    let f = Fixture::new(vec![step("parse", 1, false)]).await;
    let err = f
        .engine
        .begin_step("u1", "nope", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchBar { .. }));
}

#[tokio::test]
async fn duplicate_uids_are_rejected() {
    let f = Fixture::new(vec![step("parse", 1, false)]).await;

    // In-flight duplicate.
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap();
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UidTaken)
    ));

    // Retained duplicate: complete it, then try to reuse the uid.
    f.clock.advance(1.0);
    f.engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap();
    f.clock.advance(400.0); // grace window expires the hot keys
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 1, "parse", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UidTaken)
    ));
}

#[tokio::test]
async fn unsafe_uids_are_rejected() {
    let f = Fixture::new(vec![step("parse", 1, false)]).await;
    let err = f
        .engine
        .begin_step("u1", "job", "bad:uid", 1, "parse", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnsafeUid)
    ));
}

#[tokio::test]
async fn ordering_rules_are_enforced() {
    let f = Fixture::new(vec![
        step("a", 1, false),
        step("b", 2, false),
        step("c", 3, false),
    ])
    .await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap();
    f.clock.advance(1.0);

    // Skipping a position is rejected.
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 3, "c", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::WrongPosition {
            expected: 2,
            got: 3
        })
    ));

    // Finishing a non-current position is rejected.
    let err = f
        .engine
        .finish_step("u1", "job", "pbt_1", 2, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::WrongPosition { .. })
    ));

    // Double finish is rejected.
    f.engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap();
    let err = f
        .engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::StepAlreadyFinished { position: 1 })
    ));
}

#[tokio::test]
async fn iteration_rules_are_enforced() {
    let f = Fixture::new(vec![step("a", 1, false), step("b", 2, true)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap();

    // Progress on a one-off step.
    let err = f
        .engine
        .progress_step("u1", "job", "pbt_1", 1, 1, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::NotIterated)
    ));

    f.clock.advance(1.0);
    f.engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap();
    f.engine
        .begin_step("u1", "job", "pbt_1", 2, "b", Some(3), f.now())
        .await
        .unwrap();
    f.engine
        .progress_step("u1", "job", "pbt_1", 2, 2, f.now())
        .await
        .unwrap();

    // Progress must strictly increase.
    let err = f
        .engine
        .progress_step("u1", "job", "pbt_1", 2, 2, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::BackwardsProgress { stored: 2, got: 2 })
    ));

    // And stay within the declared count.
    let err = f
        .engine
        .progress_step("u1", "job", "pbt_1", 2, 4, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::IterationsOutOfRange {
            iterations: 3,
            got: 4
        })
    ));

    // Finish implicitly completes the remaining iteration.
    let out = f
        .engine
        .finish_step("u1", "job", "pbt_1", 2, f.now())
        .await
        .unwrap();
    assert!(out.completed);
    let retained = f.durable.load_trace("pbt_1").await.unwrap().unwrap();
    assert_eq!(retained.steps[1].iterations, Some(3));
}

#[tokio::test]
async fn completed_traces_reject_further_events() {
    let f = Fixture::new(vec![step("a", 1, false)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap();
    f.clock.advance(1.0);
    f.engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap();

    let err = f
        .engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TraceCompleted)
    ));
}

#[tokio::test]
async fn timestamps_must_not_regress_within_a_trace() {
    let f = Fixture::new(vec![step("a", 1, false)]).await;
    // Client clock runs 200s ahead, within skew tolerance, so it is
    // trusted.
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now() + 200.0)
        .await
        .unwrap();

    // The next event reports an earlier time.
    let err = f
        .engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TimestampRegression { .. })
    ));
}

#[tokio::test]
async fn schema_drift_mid_trace_aborts_without_persisting() {
    // Scenario: bar has steps [a, b]; the trace starts a, then sends c at
    // position 2.
    let f = Fixture::new(vec![step("a", 1, false), step("b", 2, false)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap();
    f.clock.advance(1.0);

    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 2, "c", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaDrift { position: 2, .. }));

    // The trace is gone from the hot state and never reached the durable
    // store.
    assert!(!f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
    assert!(!f.hot.contains_key(&keys::trace_step("u1", "job", "pbt_1", 1)));
    assert!(!f.durable.trace_exists("pbt_1").await.unwrap());
}

#[tokio::test]
async fn schema_drift_on_first_event_creates_nothing() {
    let f = Fixture::new(vec![step("a", 1, false)]).await;
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 1, "other", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaDrift { position: 1, .. }));
    assert!(!f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
}

#[tokio::test]
async fn iterated_flag_mismatch_is_drift() {
    let f = Fixture::new(vec![step("a", 1, false)]).await;
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 1, "a", Some(5), f.now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaDrift { .. }));
}

#[tokio::test]
async fn idle_traces_abort_and_never_sample() {
    let f = Fixture::new(vec![step("a", 1, false)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap();

    // Idle past the 1-hour default.
    f.clock.advance(3_700.0);
    let err = f
        .engine
        .finish_step("u1", "job", "pbt_1", 1, f.now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TraceNotFound)
    ));
    assert!(!f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
    assert!(!f.durable.trace_exists("pbt_1").await.unwrap());
}

#[tokio::test]
async fn idle_sweep_aborts_quiet_traces() {
    let f = Fixture::new(vec![step("a", 1, false)]).await;
    f.engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap();

    assert!(!f
        .engine
        .intake()
        .abort_if_idle("u1", "job", "pbt_1")
        .await
        .unwrap());

    f.clock.advance(3_700.0);
    assert!(f
        .engine
        .intake()
        .abort_if_idle("u1", "job", "pbt_1")
        .await
        .unwrap());
    assert!(!f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
}

#[derive(Debug)]
struct DenyAll;

#[async_trait]
impl Entitlements for DenyAll {
    async fn check_trace_allowed(&self, _owner: &str) -> Result<(), EngineError> {
        Err(EngineError::RateLimited("plan limit reached".to_string()))
    }
}

#[tokio::test]
async fn entitlement_denial_surfaces_rate_limited() {
    let f = Fixture::with_entitlements(vec![step("a", 1, false)], Arc::new(DenyAll)).await;
    let err = f
        .engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, f.now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RateLimited(_)));
    assert!(!f.hot.contains_key(&keys::trace("u1", "job", "pbt_1")));
}
