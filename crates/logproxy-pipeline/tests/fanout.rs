// End-to-end behaviour of the ingest → bus → broadcast pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logproxy_core::config::{BroadcastConfig, IngestConfig, StartMode};
use logproxy_core::LogEvent;
use logproxy_pipeline::broadcast::DrainState;
use logproxy_pipeline::{bus, Broadcaster, IngestEnd, Ingestor, Publisher, Subscription};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn pipeline(config: BroadcastConfig) -> (Publisher, Arc<Broadcaster>) {
    let (publisher, rx) = bus::channel(config.bus_capacity);
    (publisher, Broadcaster::new(&config, rx))
}

fn depth(queue_depth: usize) -> BroadcastConfig {
    BroadcastConfig {
        queue_depth,
        ..BroadcastConfig::default()
    }
}

fn quiet() -> IngestConfig {
    IngestConfig {
        echo: false,
        ..IngestConfig::default()
    }
}

async fn next_event(sub: &mut Subscription) -> (u64, LogEvent) {
    let payload = timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended");
    (payload.seq, serde_json::from_str(&payload.json).unwrap())
}

#[tokio::test]
async fn three_lines_arrive_in_order_as_json() {
    let (publisher, broadcaster) = pipeline(depth(16));
    broadcaster.start();
    let mut sub = broadcaster.register().unwrap();

    let input: &[u8] = b"a\nb\nc\n";
    let report = Ingestor::new(input, publisher, &quiet()).run().await;
    assert_eq!(report.lines, 3);

    let mut texts = Vec::new();
    let mut stamps: Vec<DateTime<Utc>> = Vec::new();
    for _ in 0..3 {
        let payload = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload.json).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 2);
        assert!(payload.json.starts_with(r#"{"timestamp":""#));

        let event: LogEvent = serde_json::from_value(value).unwrap();
        texts.push(event.text);
        stamps.push(event.timestamp);
    }

    assert_eq!(texts, ["a", "b", "c"]);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn many_lines_keep_ingest_order() {
    let (publisher, broadcaster) = pipeline(depth(1024));
    broadcaster.start();
    let mut sub = broadcaster.register().unwrap();

    let input: String = (0..500).map(|i| format!("line {i}\n")).collect();
    let report = Ingestor::new(input.as_bytes(), publisher, &quiet())
        .run()
        .await;
    assert_eq!(report.lines, 500);

    for i in 0..500u64 {
        let (seq, event) = next_event(&mut sub).await;
        assert_eq!(seq, i + 1);
        assert_eq!(event.text, format!("line {i}"));
    }
    assert_eq!(broadcaster.stats().drops, 0);
}

#[tokio::test]
async fn slow_consumer_does_not_starve_a_fast_one() {
    let (_publisher, broadcaster) = pipeline(depth(8));
    let slow = broadcaster.register().unwrap();
    let mut fast = broadcaster.register().unwrap();

    for i in 1..=100u64 {
        let outcome = broadcaster.broadcast(&LogEvent::new(format!("event {i}")));
        assert_eq!(outcome.delivered + outcome.dropped, 2);

        let payload = fast.try_recv().expect("fast consumer missed an event");
        assert_eq!(payload.seq, i);
    }

    assert_eq!(slow.pending(), 8);
    let stats = broadcaster.stats();
    assert_eq!(stats.drops, 92);
    assert_eq!(stats.consumers, 2);
}

#[tokio::test]
async fn slow_consumer_with_live_drain_loop() {
    let (publisher, broadcaster) = pipeline(depth(4));
    broadcaster.start();
    let _slow = broadcaster.register().unwrap();
    let mut fast = broadcaster.register().unwrap();

    // Publish one at a time and wait for the fast consumer each round so
    // its queue never fills, while the slow one saturates after four.
    for i in 0..50 {
        publisher.publish(LogEvent::new(format!("tick {i}"))).await.unwrap();
        let (_, event) = next_event(&mut fast).await;
        assert_eq!(event.text, format!("tick {i}"));
    }

    // Counters settle once the drain loop has seen the bus close.
    publisher.close();
    timeout(WAIT, broadcaster.drained()).await.unwrap();
    assert_eq!(broadcaster.stats().drops, 46);
}

#[tokio::test]
async fn late_joiner_only_sees_new_events() {
    let (_publisher, broadcaster) = pipeline(depth(16));
    let mut early = broadcaster.register().unwrap();

    for text in ["e1", "e2", "e3"] {
        broadcaster.broadcast(&LogEvent::new(text));
    }
    let mut late = broadcaster.register().unwrap();
    assert_eq!(late.pending(), 0);

    broadcaster.broadcast(&LogEvent::new("e4"));
    broadcaster.broadcast(&LogEvent::new("e5"));

    let (seq, event) = next_event(&mut late).await;
    assert_eq!((seq, event.text.as_str()), (4, "e4"));
    let (seq, event) = next_event(&mut late).await;
    assert_eq!((seq, event.text.as_str()), (5, "e5"));
    assert!(late.try_recv().is_none());
    assert_eq!(early.pending(), 5);
    assert_eq!(next_event(&mut early).await.1.text, "e1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_registrations_start_one_drain_loop() {
    let config = BroadcastConfig {
        start: StartMode::Lazy,
        ..depth(64)
    };
    let (publisher, broadcaster) = pipeline(config);
    assert_eq!(broadcaster.drain_state(), DrainState::Idle);

    let barrier = Arc::new(tokio::sync::Barrier::new(32));
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let broadcaster = Arc::clone(&broadcaster);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                broadcaster.register().unwrap()
            })
        })
        .collect();

    let mut subs = Vec::new();
    for handle in handles {
        subs.push(handle.await.unwrap());
    }
    assert_eq!(broadcaster.drain_state(), DrainState::Running);
    assert!(!broadcaster.start());

    for i in 0..10 {
        publisher.publish(LogEvent::new(format!("msg {i}"))).await.unwrap();
    }

    for sub in &mut subs {
        for i in 0..10u64 {
            let (seq, _) = next_event(sub).await;
            assert_eq!(seq, i + 1);
        }
        assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    }
    assert_eq!(broadcaster.stats().events, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_start_calls_spawn_exactly_once() {
    let (_publisher, broadcaster) = pipeline(depth(4));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move { broadcaster.start() })
        })
        .collect();

    let mut started = 0;
    for handle in handles {
        if handle.await.unwrap() {
            started += 1;
        }
    }
    assert_eq!(started, 1);
}

#[tokio::test]
async fn disconnect_removes_exactly_one_consumer() {
    let (_publisher, broadcaster) = pipeline(depth(4));
    let a = broadcaster.register().unwrap();
    let b = broadcaster.register().unwrap();
    let c = broadcaster.register().unwrap();
    assert_eq!(broadcaster.consumer_count(), 3);

    let gone = b.id();
    drop(b);

    assert_eq!(broadcaster.consumer_count(), 2);
    assert!(broadcaster.consumers().iter().all(|info| info.id != gone));
    assert!(!broadcaster.deregister(gone));

    let outcome = broadcaster.broadcast(&LogEvent::new("after"));
    assert_eq!(outcome.delivered, 2);
    assert_eq!(outcome.disconnected, 0);
    assert_eq!(a.pending() + c.pending(), 2);
}

#[tokio::test]
async fn end_of_input_stops_ingest_but_keeps_consumers() {
    let (publisher, broadcaster) = pipeline(depth(16));
    broadcaster.start();
    let mut sub = broadcaster.register().unwrap();

    let input: &[u8] = b"one\ntwo\n";
    let report = timeout(WAIT, Ingestor::new(input, publisher, &quiet()).run())
        .await
        .expect("ingestor did not stop at end of input");
    assert!(matches!(report.end, IngestEnd::EndOfInput));

    timeout(WAIT, broadcaster.drained()).await.unwrap();
    assert_eq!(broadcaster.drain_state(), DrainState::Finished);

    assert_eq!(next_event(&mut sub).await.1.text, "one");
    assert_eq!(next_event(&mut sub).await.1.text, "two");

    // Still connected: nothing more arrives, but the stream has not ended.
    assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());
    assert_eq!(broadcaster.consumer_count(), 1);

    // New viewers can still connect after the input is gone.
    let _late = broadcaster.register().unwrap();
    assert_eq!(broadcaster.consumer_count(), 2);
}
