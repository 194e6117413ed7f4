// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end scenarios for the regenerative cache manager.
//!
//! Every test runs one or more manager instances ("nodes") against a shared
//! in-memory farm: one external store, one lock service, one bus. Durations
//! are scaled down to milliseconds, with the scheduling floor and tolerances
//! scaled alongside through the builder; assertion windows are padded so
//! that background cycles land well inside them.

use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use regen_cache::{Error, FanOutBus, RegenerativeCacheManager, ResultNotification};
use regen_cache_backend::testing::{
    InMemoryExternalCache, InMemoryFanOutBus, InMemoryLockService, StoreOp,
};
use uuid::Uuid;

/// The shared backends one farm of nodes runs against.
#[derive(Clone, Default)]
struct Farm {
    store: InMemoryExternalCache,
    locks: InMemoryLockService,
    bus: InMemoryFanOutBus,
}

impl Farm {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self::default()
    }

    async fn node(&self, keyspace: &str) -> RegenerativeCacheManager {
        RegenerativeCacheManager::builder(
            keyspace,
            Arc::new(self.store.clone()),
            Arc::new(self.locks.clone()),
            Arc::new(self.bus.clone()),
        )
        .cache_expiry_tolerance(Duration::from_millis(150))
        .farm_clock_tolerance(Duration::from_millis(50))
        .minimum_forward_scheduling(Duration::from_millis(100))
        .trigger_delay(Duration::from_millis(25))
        .build()
        .await
        .expect("in-memory bus subscription cannot fail")
    }
}

/// A generator returning `{prefix}_{random}` and counting its invocations.
fn counting_generator(
    prefix: &'static str,
) -> (
    impl Fn() -> std::future::Ready<Result<String, Infallible>> + Send + Sync + Clone + 'static,
    Arc<AtomicUsize>,
) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let generator = move || {
        counter.fetch_add(1, Ordering::AcqRel);
        std::future::ready(Ok(format!("{prefix}_{}", Uuid::new_v4().simple())))
    };
    (generator, calls)
}

/// Polls until the bus is quiescent and every publish reached every node.
async fn assert_full_delivery(bus: &InMemoryFanOutBus, subscribers: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        let publishes = bus.publish_count();
        let delivered = bus.delivered_count();
        if delivered == publishes * subscribers {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "bus never settled: {publishes} publishes, {delivered} deliveries, {subscribers} subscribers"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn s1_two_immediate_calls_share_one_generation() {
    let farm = Farm::new();
    let node = farm.node("s1").await;
    let (generate, calls) = counting_generator("t1");

    let retention = Duration::from_millis(900);
    let interval = Duration::from_millis(300);

    let first = node
        .get_or_add("k", generate.clone(), retention, interval)
        .await
        .unwrap();
    let second = node.get_or_add("k", generate, retention, interval).await.unwrap();

    assert!(first.starts_with("t1_"), "unexpected value {first}");
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::Acquire), 1);
    assert_eq!(farm.store.set_count(), 1);
    assert_eq!(farm.bus.publish_count(), 1);
    assert_eq!(farm.bus.delivered_count(), 1);
    assert_eq!(farm.locks.acquired_count(), 1);
}

#[tokio::test]
async fn s2_value_rotates_in_the_background() {
    let farm = Farm::new();
    let node = farm.node("s2").await;
    let (generate, calls) = counting_generator("t1");

    let retention = Duration::from_millis(900);
    let interval = Duration::from_millis(300);

    let original = node
        .get_or_add("k", generate.clone(), retention, interval)
        .await
        .unwrap();

    // One regeneration interval plus slack, well short of the second cycle.
    tokio::time::sleep(Duration::from_millis(450)).await;

    let rotated = node
        .get_or_add("k", generate.clone(), retention, interval)
        .await
        .unwrap();
    let repeated = node.get_or_add("k", generate, retention, interval).await.unwrap();

    assert!(rotated.starts_with("t1_"));
    assert_ne!(rotated, original, "background cycle should have replaced the value");
    assert_eq!(rotated, repeated);
    assert_eq!(calls.load(Ordering::Acquire), 2);
    assert_eq!(farm.store.set_count(), 2);
    assert_eq!(farm.bus.publish_count(), 2);
    assert_eq!(farm.bus.delivered_count(), 2);
    assert_eq!(farm.locks.acquired_count(), 2);
}

#[tokio::test]
async fn s3_new_generator_takes_over_after_retention() {
    let farm = Farm::new();
    let node = farm.node("s3").await;
    let (first_generate, _first_calls) = counting_generator("t1");

    let retention = Duration::from_millis(500);
    let interval = Duration::from_millis(200);

    node.get_or_add("k", first_generate, retention, interval)
        .await
        .unwrap();

    // Long enough for the schedule to retire and the last entry to expire.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let (next_generate, next_calls) = counting_generator("t3");
    let first = node
        .get_or_add("k", next_generate.clone(), retention, interval)
        .await
        .unwrap();
    let second = node
        .get_or_add("k", next_generate, retention, interval)
        .await
        .unwrap();

    assert!(first.starts_with("t3_"), "expected a fresh generation, got {first}");
    assert_eq!(first, second);
    assert_eq!(next_calls.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn s4_second_node_reads_the_first_nodes_value() {
    let farm = Farm::new();
    let node1 = farm.node("s4").await;
    let node2 = farm.node("s4").await;

    let retention = Duration::from_millis(600);
    let interval = Duration::from_millis(200);

    let (generate1, calls1) = counting_generator("t1n1");
    let (generate2, calls2) = counting_generator("t1n2");

    let first = node1
        .get_or_add("k", generate1, retention, interval)
        .await
        .unwrap();
    let shared = node2
        .get_or_add("k", generate2, retention, interval)
        .await
        .unwrap();

    assert!(shared.starts_with("t1n1_"), "node2 should serve node1's value, got {shared}");
    assert_eq!(shared, first);
    assert_eq!(calls1.load(Ordering::Acquire), 1);
    assert_eq!(calls2.load(Ordering::Acquire), 0);
    assert_eq!(farm.store.set_count(), 1);
    assert_eq!(farm.bus.publish_count(), 1);
    assert_eq!(farm.locks.acquired_count(), 1);
}

#[tokio::test]
async fn s5_one_background_cycle_across_two_nodes() {
    let farm = Farm::new();
    let node1 = farm.node("s5").await;
    let node2 = farm.node("s5").await;

    let retention = Duration::from_millis(600);
    let interval = Duration::from_millis(200);

    let (generate1, _calls1) = counting_generator("t1n1");
    let (generate2, _calls2) = counting_generator("t1n2");

    node1
        .get_or_add("k", generate1, retention, interval)
        .await
        .unwrap();
    node2
        .get_or_add("k", generate2, retention, interval)
        .await
        .unwrap();

    // Let one background regeneration cycle play out on the farm.
    tokio::time::sleep(Duration::from_millis(450)).await;

    let sets = farm.store.set_count();
    let publishes = farm.bus.publish_count();
    let locks = farm.locks.acquired_count();
    assert!((2..=4).contains(&sets), "unexpected set count {sets}");
    assert!((2..=4).contains(&publishes), "unexpected publish count {publishes}");
    assert!((2..=4).contains(&locks), "unexpected lock count {locks}");

    // Every publish from either node reached both nodes.
    assert_full_delivery(&farm.bus, 2).await;
}

#[tokio::test]
async fn s6_competing_nodes_converge_and_both_origins_win_eventually() {
    let farm = Farm::new();
    let node1 = farm.node("s6").await;
    let node2 = farm.node("s6").await;

    let retention = Duration::from_millis(450);
    let interval = Duration::from_millis(150);

    let (generate1, _calls1) = counting_generator("t1n1");
    let (generate2, _calls2) = counting_generator("t1n2");

    let mut seen_node1_origin = false;
    let mut seen_node2_origin = false;
    let mut agreements = 0usize;

    let total_rounds = 24usize;
    for round in 0..total_rounds {
        // Periodically go quiet past the retention window so both schedules
        // retire and the entry expires; the next round's first caller then
        // regenerates from scratch. Round parity alternates that first
        // caller, so both origins are guaranteed to show up.
        if round % 7 == 3 {
            tokio::time::sleep(Duration::from_millis(900)).await;
        }

        // Alternate which node asks first each round.
        let (a, b) = if round % 2 == 0 {
            let a = node1
                .get_or_add("k", generate1.clone(), retention, interval)
                .await
                .unwrap();
            let b = node2
                .get_or_add("k", generate2.clone(), retention, interval)
                .await
                .unwrap();
            (a, b)
        } else {
            let b = node2
                .get_or_add("k", generate2.clone(), retention, interval)
                .await
                .unwrap();
            let a = node1
                .get_or_add("k", generate1.clone(), retention, interval)
                .await
                .unwrap();
            (a, b)
        };

        for value in [&a, &b] {
            seen_node1_origin |= value.starts_with("t1n1_");
            seen_node2_origin |= value.starts_with("t1n2_");
        }
        if a == b {
            agreements += 1;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    assert!(
        seen_node1_origin && seen_node2_origin,
        "never observed both origins: n1={seen_node1_origin} n2={seen_node2_origin}"
    );
    // Back-to-back reads only disagree in the sliver where a regeneration
    // lands between them.
    assert!(
        agreements * 10 >= total_rounds * 8,
        "nodes agreed only {agreements}/{total_rounds} rounds"
    );
}

#[tokio::test]
async fn concurrent_misses_are_single_flight_in_process() {
    let farm = Farm::new();
    let node = farm.node("flight").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));

    let generate = {
        let calls = Arc::clone(&calls);
        let in_flight = Arc::clone(&in_flight);
        let overlapped = Arc::clone(&overlapped);
        move || {
            let calls = Arc::clone(&calls);
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            async move {
                calls.fetch_add(1, Ordering::AcqRel);
                if in_flight.fetch_add(1, Ordering::AcqRel) > 0 {
                    overlapped.fetch_add(1, Ordering::AcqRel);
                }
                tokio::time::sleep(Duration::from_millis(80)).await;
                in_flight.fetch_sub(1, Ordering::AcqRel);
                Ok::<_, Infallible>(format!("v_{}", Uuid::new_v4().simple()))
            }
        }
    };

    let mut callers = Vec::new();
    for _ in 0..10 {
        let node = node.clone();
        let generate = generate.clone();
        callers.push(tokio::spawn(async move {
            node.get_or_add(
                "k",
                generate,
                Duration::from_millis(900),
                Duration::from_millis(300),
            )
            .await
            .unwrap()
        }));
    }

    let mut values = Vec::new();
    for caller in callers {
        values.push(caller.await.unwrap());
    }

    assert!(values.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(calls.load(Ordering::Acquire), 1);
    assert_eq!(overlapped.load(Ordering::Acquire), 0);
}

#[tokio::test]
async fn generation_failure_is_surfaced_and_recoverable() {
    let farm = Farm::new();
    let node = farm.node("fail").await;

    let retention = Duration::from_millis(900);
    let interval = Duration::from_millis(300);

    let error = node
        .get_or_add(
            "k",
            || async { Err::<String, _>("backend exploded") },
            retention,
            interval,
        )
        .await
        .unwrap_err();
    match error {
        Error::GenerationFailed { key, message } => {
            assert_eq!(key, "k");
            assert!(message.contains("backend exploded"), "lost the cause: {message}");
        }
        other => panic!("expected GenerationFailed, got {other:?}"),
    }

    // Nothing was stored, and the key is not poisoned.
    assert_eq!(farm.store.set_count(), 0);
    let (generate, _calls) = counting_generator("ok");
    let value = node.get_or_add("k", generate, retention, interval).await.unwrap();
    assert!(value.starts_with("ok_"));
}

#[tokio::test]
async fn peer_success_notification_refreshes_the_local_copy() {
    let farm = Farm::new();
    let node1 = farm.node("peer").await;
    let node2 = farm.node("peer").await;

    let retention = Duration::from_millis(600);
    let interval = Duration::from_millis(200);

    let (generate1, _calls1) = counting_generator("t1n1");
    let (generate2, _calls2) = counting_generator("t1n2");

    let original = node1
        .get_or_add("k", generate1.clone(), retention, interval)
        .await
        .unwrap();
    let shared = node2
        .get_or_add("k", generate2.clone(), retention, interval)
        .await
        .unwrap();
    assert_eq!(original, shared);

    // Whichever node wins the next background cycle, node2 must observe the
    // replacement value; its local copy is dropped before awaiters release.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let current = node2
            .get_or_add("k", generate2.clone(), retention, interval)
            .await
            .unwrap();
        if current != original {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "node2 kept serving the original value"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn short_retention_opts_out_of_background_regeneration() {
    let farm = Farm::new();
    let node = farm.node("optout").await;
    let (generate, calls) = counting_generator("t1");

    // retention <= interval: serve from cache, never regenerate proactively.
    let retention = Duration::from_millis(100);
    let interval = Duration::from_millis(300);

    let first = node
        .get_or_add("k", generate.clone(), retention, interval)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    let second = node.get_or_add("k", generate, retention, interval).await.unwrap();

    assert_eq!(first, second, "no background cycle should have replaced the value");
    assert_eq!(calls.load(Ordering::Acquire), 1);
    assert_eq!(farm.store.set_count(), 1);
    assert_eq!(farm.bus.publish_count(), 1);
}

#[tokio::test]
async fn generation_raced_when_the_entry_expires_before_reread() {
    let farm = Farm::new();

    // A deliberately slow co-subscriber: the publish (and with it the whole
    // regeneration) does not finish until long after the tiny TTL is gone.
    let node = RegenerativeCacheManager::builder(
        "raced",
        Arc::new(farm.store.clone()),
        Arc::new(farm.locks.clone()),
        Arc::new(farm.bus.clone()),
    )
    .cache_expiry_tolerance(Duration::from_millis(10))
    .farm_clock_tolerance(Duration::from_millis(5))
    .minimum_forward_scheduling(Duration::from_millis(100))
    .trigger_delay(Duration::from_millis(5))
    .build()
    .await
    .unwrap();

    let slow_subscriber: regen_cache_backend::MessageHandler = Arc::new(|_payload| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(150)).await;
        })
    });
    farm.bus.subscribe(node.topic(), slow_subscriber).await.unwrap();

    let error = node
        .get_or_add(
            "k",
            || async { Ok::<_, Infallible>("ephemeral".to_owned()) },
            Duration::from_millis(30),
            Duration::from_millis(40),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::GenerationRaced { key } if key == "k"));
}

#[tokio::test]
async fn malformed_bus_messages_are_dropped() {
    let farm = Farm::new();
    let node = farm.node("garbled").await;

    farm.bus.publish(node.topic(), "not json at all").await.unwrap();
    farm.bus
        .publish(node.topic(), r#"{"Success":"yes","Key":3}"#)
        .await
        .unwrap();

    // The subscription survives and normal operation continues.
    let (generate, _calls) = counting_generator("t1");
    let value = node
        .get_or_add("k", generate, Duration::from_millis(900), Duration::from_millis(300))
        .await
        .unwrap();
    assert!(value.starts_with("t1_"));
}

#[tokio::test]
async fn external_names_are_bit_exact() {
    let farm = Farm::new();
    let node = farm.node("names").await;

    assert_eq!(node.keyspace(), "names");
    assert_eq!(node.topic(), "RegenerativeCacheManager:ResultNotification:names");

    let (generate, _calls) = counting_generator("t1");
    node.get_or_add("k", generate, Duration::from_millis(900), Duration::from_millis(300))
        .await
        .unwrap();

    assert!(farm.store.operations().iter().any(|op| matches!(
        op,
        StoreOp::Set { key, .. } if key == "MemoryFrontedExternalCache:names:Item:k"
    )));
    assert_eq!(
        farm.locks.acquired_keys(),
        ["RegenerativeCacheManager:RegenerateIfNotUnderway:names:k"]
    );

    let (topic, payload) = farm.bus.published()[0].clone();
    assert_eq!(topic, node.topic());
    let notification: ResultNotification = serde_json::from_str(&payload).unwrap();
    assert!(notification.success);
    assert_eq!(notification.key, "k");
    assert_eq!(notification.sender, node.sender_id());
}

#[tokio::test]
async fn external_store_failure_releases_waiters_as_generation_failure() {
    let farm = Farm::new();
    farm.store.fail_when(|op| matches!(op, StoreOp::Set { .. }));
    let node = farm.node("storefail").await;

    let error = node
        .get_or_add(
            "k",
            || async { Ok::<_, Infallible>("value".to_owned()) },
            Duration::from_millis(900),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();

    // The store hiccup travels through the failure notification instead of
    // stranding the waiting caller.
    match error {
        Error::GenerationFailed { message, .. } => {
            assert!(message.contains("external cache error"), "unexpected message {message}");
        }
        other => panic!("expected GenerationFailed, got {other:?}"),
    }
}
