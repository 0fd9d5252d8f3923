//! Event bus integration tests
//!
//! End-to-end tests exercising the public EventBus surface: live and sticky
//! delivery, call signals, LRU bounding, cross-thread coalescing, scope
//! cleanup, primitives and configuration.

use a3s_live_event::{
    BusConfig, ChannelMode, Delivery, DispatchMode, EventBus, EventError, EventType, Handler,
    ManualScope, SubscribeOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Message(String);

fn msg(s: &str) -> Message {
    Message(s.to_string())
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Handler<T>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, Handler::value(move |v| sink.lock().unwrap().push(v)))
}

// ─── Live & Sticky Delivery ──────────────────────────────────────

#[test]
fn test_live_channel_never_replays_history() {
    let bus = EventBus::new();
    for s in ["one", "two", "three"] {
        bus.publish(msg(s), false).unwrap();
    }

    let (seen, handler) = recorder::<Message>();
    bus.subscribe_forever(SubscribeOptions::default().mode(ChannelMode::Live), handler)
        .unwrap();
    bus.renotify(&EventType::of::<Message>(), false).unwrap();
    assert!(seen.lock().unwrap().is_empty());

    bus.publish(msg("four"), false).unwrap();
    bus.renotify(&EventType::of::<Message>(), false).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![msg("four")]);
}

#[test]
fn test_sticky_replayed_exactly_once() {
    let bus = EventBus::new();
    bus.publish(msg("A"), true).unwrap();

    let (seen, handler) = recorder::<Message>();
    bus.subscribe_forever(SubscribeOptions::default().mode(ChannelMode::Sticky), handler)
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![msg("A")]);

    bus.renotify(&EventType::of::<Message>(), true).unwrap();
    bus.renotify(&EventType::of::<Message>(), true).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);

    bus.publish(msg("B"), true).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![msg("A"), msg("B")]);
}

#[test]
fn test_sticky_replay_per_key() {
    let bus = EventBus::new();
    bus.publish(msg("latest"), true).unwrap();

    let (first, h1) = recorder::<Message>();
    let (second, h2) = recorder::<Message>();
    bus.subscribe_forever(SubscribeOptions::default().keyed("a"), h1)
        .unwrap();
    bus.subscribe_forever(SubscribeOptions::default().keyed("b"), h2)
        .unwrap();

    assert_eq!(first.lock().unwrap().len(), 1);
    assert_eq!(second.lock().unwrap().len(), 1);
}

#[test]
fn test_sticky_null_replayed_to_nullable_binding() {
    let bus = EventBus::new();
    let et = EventType::key("selection");
    bus.publish_to::<Message>(&et, None, true).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_forever(
        SubscribeOptions::default().event_type(et.clone()),
        Handler::nullable(move |v: Option<Message>| sink.lock().unwrap().push(v)),
    )
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![None]);
}

// ─── Call Signals ────────────────────────────────────────────────

#[test]
fn test_call_signal_distinct_from_values() {
    let bus = EventBus::new();
    bus.publish_call::<Message>(true).unwrap();

    let (_, value_handler) = recorder::<Message>();
    let err = bus
        .subscribe_forever(SubscribeOptions::default().keyed("plain"), value_handler)
        .unwrap_err();
    assert!(matches!(err, EventError::TypeMismatch { .. }));

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    bus.subscribe_forever(
        SubscribeOptions::default().keyed("aware"),
        Handler::<Message>::call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    bus.renotify(&EventType::of::<Message>(), true).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_delivery_binding_sees_every_kind() {
    let bus = EventBus::new();
    let et = EventType::key("status");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_forever(
        SubscribeOptions::default()
            .event_type(et.clone())
            .mode(ChannelMode::Live),
        Handler::delivery(move |d: Delivery<u8>| sink.lock().unwrap().push(d.kind())),
    )
    .unwrap();

    bus.publish_to(&et, Some(1u8), false).unwrap();
    bus.publish_to::<u8>(&et, None, false).unwrap();
    bus.publish_call_to::<u8>(&et, false).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[test]
fn test_live_call_while_inactive_is_dropped() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let sub = bus
        .subscribe_forever(
            SubscribeOptions::default().mode(ChannelMode::Live).inactive(),
            Handler::<Message>::call(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    bus.publish_call::<Message>(false).unwrap();
    bus.activate(&sub).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    bus.publish_call::<Message>(false).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ─── LRU Registry ────────────────────────────────────────────────

#[test]
fn test_lru_evicts_least_recently_touched() {
    let bus = EventBus::new();
    bus.set_capacity(2).unwrap();
    let (x, y, z) = (
        EventType::key("X"),
        EventType::key("Y"),
        EventType::key("Z"),
    );

    bus.publish_to(&x, Some(1u32), false).unwrap();
    bus.publish_to(&y, Some(1u32), false).unwrap();
    bus.publish_to(&x, Some(2u32), false).unwrap();
    bus.publish_to(&z, Some(1u32), false).unwrap();

    assert!(bus.has_channel(&x, false));
    assert!(!bus.has_channel(&y, false));
    assert!(bus.has_channel(&z, false));
    assert_eq!(bus.stats().unwrap().evictions, 1);
}

#[test]
fn test_sticky_channels_survive_capacity_pressure() {
    let bus = EventBus::with_config(BusConfig::default().with_capacity(1)).unwrap();
    for name in ["a", "b", "c"] {
        bus.publish_to(&EventType::key(name), Some(0u8), true).unwrap();
    }
    assert_eq!(bus.stats().unwrap().sticky_channels, 3);
}

#[test]
fn test_shrinking_capacity_keeps_most_recent() {
    let bus = EventBus::new();
    for name in ["a", "b", "c"] {
        bus.publish_to(&EventType::key(name), Some(0u8), false).unwrap();
    }
    bus.set_capacity(1).unwrap();
    assert!(bus.has_channel(&EventType::key("c"), false));
    assert!(!bus.has_channel(&EventType::key("a"), false));
    assert_eq!(bus.capacity().unwrap(), 1);
    assert!(matches!(bus.set_capacity(0), Err(EventError::Config(_))));
}

#[test]
fn test_evicted_subscriber_gets_nothing_after_recreation() {
    let bus = EventBus::with_config(BusConfig::default().with_capacity(1)).unwrap();
    let (seen, handler) = recorder::<Message>();
    bus.subscribe_forever(SubscribeOptions::default().mode(ChannelMode::Live), handler)
        .unwrap();

    bus.publish(1u64, false).unwrap();
    bus.publish(msg("after eviction"), false).unwrap();
    assert!(seen.lock().unwrap().is_empty());
}

// ─── Cross-Thread Publishing ─────────────────────────────────────

#[test]
fn test_background_publishes_coalesce_to_last() {
    let bus = EventBus::new();
    let (seen, handler) = recorder::<u32>();
    bus.subscribe_forever(SubscribeOptions::default(), handler)
        .unwrap();

    for i in 0..8u32 {
        let remote = bus.clone();
        thread::spawn(move || remote.publish(i, false).unwrap())
            .join()
            .unwrap();
    }
    assert_eq!(bus.pending(), 1);
    assert_eq!(bus.stats().unwrap().coalesced, 7);

    assert_eq!(bus.drain().unwrap(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![7]);
}

#[test]
fn test_concurrent_publishers_deliver_once() {
    let bus = EventBus::new();
    let (seen, handler) = recorder::<u32>();
    bus.subscribe_forever(SubscribeOptions::default(), handler)
        .unwrap();

    let producers: Vec<_> = (0..16u32)
        .map(|i| {
            let remote = bus.clone();
            thread::spawn(move || remote.publish(i, false).unwrap())
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    bus.drain().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_distinct_channels_are_not_coalesced() {
    let bus = EventBus::new();
    let remote = bus.clone();
    thread::spawn(move || {
        remote.publish(1u8, false).unwrap();
        remote.publish(msg("x"), false).unwrap();
        remote.publish(2u8, false).unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(bus.pending(), 2);
    assert_eq!(bus.drain().unwrap(), 2);
}

#[test]
fn test_waker_signals_queued_work() {
    let wakes = Arc::new(AtomicUsize::new(0));
    let w = wakes.clone();
    let bus = EventBus::with_waker(BusConfig::default(), move || {
        w.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let remote = bus.clone();
    thread::spawn(move || {
        remote.publish(msg("a"), false).unwrap();
        remote.publish(msg("b"), false).unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_strict_mode_rejects_background_publish() {
    let bus = EventBus::with_config(BusConfig::default().with_dispatch(DispatchMode::Strict))
        .unwrap();
    let remote = bus.clone();
    let result = thread::spawn(move || remote.publish(msg("x"), false))
        .join()
        .unwrap();
    assert!(matches!(result, Err(EventError::Threading { .. })));
    assert_eq!(bus.pending(), 0);
}

#[test]
fn test_rebinding_delivery_context() {
    let bus = EventBus::new();
    let remote = bus.clone();
    let delivered = thread::spawn(move || {
        remote.bind_current_thread().unwrap();
        let (seen, handler) = recorder::<Message>();
        remote
            .subscribe_forever(SubscribeOptions::default(), handler)
            .unwrap();
        remote.publish(msg("here"), false).unwrap();
        let n = seen.lock().unwrap().len();
        n
    })
    .join()
    .unwrap();
    assert_eq!(delivered, 1);
    assert!(!bus.is_delivery_context());
    assert!(matches!(bus.drain(), Err(EventError::Threading { .. })));
}

#[tokio::test]
async fn test_wait_pending_then_drain() {
    let bus = EventBus::new();
    let (seen, handler) = recorder::<Message>();
    bus.subscribe_forever(SubscribeOptions::default(), handler)
        .unwrap();

    let remote = bus.clone();
    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.publish(msg("async"), false).unwrap();
    });

    tokio::time::timeout(Duration::from_secs(2), bus.wait_pending())
        .await
        .unwrap();
    producer.join().unwrap();
    assert_eq!(bus.drain().unwrap(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![msg("async")]);
}

// ─── Scopes ──────────────────────────────────────────────────────

#[test]
fn test_scope_end_purges_keyed_subscription() {
    let bus = EventBus::new();
    let scope = ManualScope::new("detail-screen");
    let (seen, handler) = recorder::<Message>();
    let sub = bus
        .subscribe(&scope, SubscribeOptions::default().keyed("explicit"), handler)
        .unwrap();
    assert_eq!(sub.key().as_str(), "explicit");

    scope.end();
    bus.publish(msg("late"), false).unwrap();
    bus.publish(msg("late sticky"), true).unwrap();
    assert!(seen.lock().unwrap().is_empty());

    assert!(!bus.unsubscribe(&sub).unwrap());
    assert!(!bus.unsubscribe(&sub).unwrap());
}

#[test]
fn test_scope_end_from_another_thread() {
    let bus = EventBus::new();
    let scope = ManualScope::new("worker");
    let (seen, handler) = recorder::<Message>();
    bus.subscribe(&scope, SubscribeOptions::default(), handler)
        .unwrap();

    let ender = scope.clone();
    thread::spawn(move || ender.end()).join().unwrap();

    bus.publish(msg("x"), false).unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(bus.stats().unwrap().scopes, 0);
}

#[test]
fn test_scope_key_defaults_to_scope_identity() {
    let bus = EventBus::new();
    let scope = ManualScope::new("profile");
    let (first, h1) = recorder::<Message>();
    let (second, h2) = recorder::<Message>();
    let a = bus
        .subscribe(&scope, SubscribeOptions::default(), h1)
        .unwrap();
    let b = bus
        .subscribe(&scope, SubscribeOptions::default(), h2)
        .unwrap();
    assert_eq!(a.key(), b.key());

    bus.publish(msg("shared"), false).unwrap();
    assert_eq!(first.lock().unwrap().len() + second.lock().unwrap().len(), 1);
}

#[test]
fn test_unsubscribe_from_background_thread() {
    let bus = EventBus::new();
    let (seen, handler) = recorder::<Message>();
    let sub = bus
        .subscribe_forever(SubscribeOptions::default(), handler)
        .unwrap();

    let remote = bus.clone();
    let removed = thread::spawn(move || remote.unsubscribe(&sub).unwrap())
        .join()
        .unwrap();
    assert!(removed);

    bus.publish(msg("x"), false).unwrap();
    assert!(seen.lock().unwrap().is_empty());
}

// ─── Primitives & Configuration ──────────────────────────────────

#[test]
fn test_primitive_roundtrip_through_bus() {
    let bus = EventBus::new();
    let scope = ManualScope::new("toolbar");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.on_primitive(&scope, "title", SubscribeOptions::default(), move |s: String| {
        sink.lock().unwrap().push(s)
    })
    .unwrap();

    bus.send_primitive("title", "Inbox", false).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["Inbox".to_string()]);

    scope.end();
    bus.send_primitive("title", "Drafts", false).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_payload_type_conflict_is_config_error() {
    let bus = EventBus::new();
    let et = EventType::key("count");
    bus.publish_to(&et, Some(1u32), true).unwrap();
    let err = bus.publish_to(&et, Some(1i64), true).unwrap_err();
    assert!(matches!(err, EventError::Config(_)));
}

#[test]
fn test_declared_mode_conflict() {
    let bus = EventBus::new();
    bus.declare(EventType::of::<Message>(), false).unwrap();
    assert!(bus.publish(msg("ok"), false).is_ok());
    assert!(matches!(
        bus.publish(msg("no"), true),
        Err(EventError::Config(_))
    ));
    assert!(bus.declare(EventType::of::<Message>(), true).is_err());
}

#[test]
fn test_config_file_drives_bus() {
    let dir = std::env::temp_dir().join(format!("a3s-live-event-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bus.json");
    std::fs::write(&path, r#"{"capacity": 2}"#).unwrap();

    let bus = EventBus::with_config(BusConfig::load(&path).unwrap()).unwrap();
    assert_eq!(bus.capacity().unwrap(), 2);
    assert_eq!(bus.config().dispatch, DispatchMode::Marshal);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_clear_resets_everything_but_declarations() {
    let bus = EventBus::new();
    bus.declare(EventType::of::<Message>(), true).unwrap();
    bus.publish(msg("kept?"), true).unwrap();
    bus.clear().unwrap();

    let (seen, handler) = recorder::<Message>();
    bus.subscribe_forever(SubscribeOptions::default(), handler)
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert!(bus.publish(msg("live"), false).is_err());
}
