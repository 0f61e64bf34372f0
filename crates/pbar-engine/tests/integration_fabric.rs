//! Pub/sub fan-out through the assembled engine: every trace mutation
//! publishes one notification, and slow subscribers learn they lagged.

use std::sync::Arc;
use std::time::Duration;

use pbar_common::{
    BarSchema, Clock, ExternalId, SamplingTechnique, StepSpec, Technique, VirtualClock,
    DEFAULT_PERCENTILE,
};
use pbar_engine::{
    AllowAll, Engine, EngineConfig, MemoryDurableStore, MemoryHotStore, SubscriptionEvent,
};

fn schema() -> BarSchema {
    BarSchema {
        bar_uid: ExternalId::bar(),
        owner: "u1".to_string(),
        name: "job".to_string(),
        version: 1,
        sampling_max_count: 100,
        sampling_max_age_seconds: Some(86_400),
        sampling_technique: SamplingTechnique::Systematic,
        default_spec: StepSpec::default_spec(0.0),
        steps: vec![
            StepSpec {
                uid: ExternalId::step(),
                name: "a".to_string(),
                position: 1,
                iterated: false,
                one_off_technique: Technique::ArithmeticMean,
                one_off_percentile: DEFAULT_PERCENTILE,
                iterated_technique: Technique::ArithmeticMean,
                iterated_percentile: DEFAULT_PERCENTILE,
                created_at: 0.0,
            },
            StepSpec {
                uid: ExternalId::step(),
                name: "b".to_string(),
                position: 2,
                iterated: true,
                one_off_technique: Technique::ArithmeticMean,
                one_off_percentile: DEFAULT_PERCENTILE,
                iterated_technique: Technique::ArithmeticMean,
                iterated_percentile: DEFAULT_PERCENTILE,
                created_at: 0.0,
            },
        ],
        created_at: 0.0,
    }
}

async fn engine(queue_capacity: usize) -> (Engine, VirtualClock) {
    let clock = VirtualClock::new(1_000.0);
    let durable = Arc::new(MemoryDurableStore::new());
    let hot = Arc::new(MemoryHotStore::new(Arc::new(clock.clone())));
    let mut config = EngineConfig::default();
    config.fabric.queue_capacity = queue_capacity;
    let engine = Engine::new(
        config,
        durable,
        hot,
        Arc::new(clock.clone()),
        Arc::new(AllowAll),
    );
    engine.registry().register(schema()).await.unwrap();
    (engine, clock)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn two_subscribers_each_see_the_mutations() {
    let (engine, clock) = engine(16).await;
    let sub_a = engine.subscribe_trace("u1", "job", "pbt_1").await.unwrap();
    let sub_b = engine.subscribe_trace("u1", "job", "pbt_1").await.unwrap();

    // Three mutations: create, progress, progress.
    engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, clock.now())
        .await
        .unwrap();
    clock.advance(1.0);
    engine
        .finish_step("u1", "job", "pbt_1", 1, clock.now())
        .await
        .unwrap();
    engine
        .begin_step("u1", "job", "pbt_1", 2, "b", Some(3), clock.now())
        .await
        .unwrap();
    settle().await;

    for sub in [&sub_a, &sub_b] {
        let mut payloads = Vec::new();
        for _ in 0..3 {
            match sub.recv().await.unwrap() {
                SubscriptionEvent::Update(m) => payloads.push(m.payload),
                SubscriptionEvent::Lagged => panic!("unexpected lag"),
            }
        }
        assert_eq!(payloads, vec!["created", "updated", "updated"]);
    }
}

#[tokio::test]
async fn validation_failures_publish_nothing() {
    let (engine, clock) = engine(16).await;
    let sub = engine.subscribe_trace("u1", "job", "pbt_1").await.unwrap();

    engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, clock.now())
        .await
        .unwrap();
    // A rejected event must not notify subscribers.
    let _ = engine
        .finish_step("u1", "job", "pbt_1", 2, clock.now())
        .await
        .unwrap_err();
    settle().await;

    match sub.recv().await.unwrap() {
        SubscriptionEvent::Update(m) => assert_eq!(m.payload, "created"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(sub.dropped(), 0);
    assert!(!sub.is_lagged());
}

#[tokio::test]
async fn slow_subscriber_lags_and_resnapshots() {
    let (engine, clock) = engine(2).await;
    let sub = engine.subscribe_trace("u1", "job", "pbt_1").await.unwrap();

    // Five mutations against a 2-slot queue while the reader sleeps.
    engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, clock.now())
        .await
        .unwrap();
    clock.advance(1.0);
    engine
        .finish_step("u1", "job", "pbt_1", 1, clock.now())
        .await
        .unwrap();
    engine
        .begin_step("u1", "job", "pbt_1", 2, "b", Some(3), clock.now())
        .await
        .unwrap();
    for i in 1..=2 {
        clock.advance(1.0);
        engine
            .progress_step("u1", "job", "pbt_1", 2, i, clock.now())
            .await
            .unwrap();
    }
    settle().await;

    // The reader is told to re-snapshot before seeing the survivors.
    assert_eq!(sub.recv().await.unwrap(), SubscriptionEvent::Lagged);
    assert!(sub.dropped() >= 1);
    let mut survivors = 0;
    loop {
        match sub.recv().await {
            Some(SubscriptionEvent::Update(_)) => survivors += 1,
            Some(SubscriptionEvent::Lagged) => panic!("lag reported twice"),
            None => break,
        }
        if survivors == 2 {
            break;
        }
    }
    assert_eq!(survivors, 2);
}

#[tokio::test]
async fn bar_stream_spans_traces() {
    let (engine, clock) = engine(16).await;
    let sub = engine.subscribe_bar("u1", "job").await.unwrap();

    engine
        .begin_step("u1", "job", "pbt_1", 1, "a", None, clock.now())
        .await
        .unwrap();
    engine
        .begin_step("u1", "job", "pbt_2", 1, "a", None, clock.now())
        .await
        .unwrap();
    settle().await;

    let mut channels = Vec::new();
    for _ in 0..2 {
        match sub.recv().await.unwrap() {
            SubscriptionEvent::Update(m) => channels.push(m.channel),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(channels.iter().any(|c| c.ends_with(":pbt_1")));
    assert!(channels.iter().any(|c| c.ends_with(":pbt_2")));
}
