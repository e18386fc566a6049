use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

use super::Broker;
use super::delay::{DelayLadder, DelayScheduler};
use super::delivery::LANE_IDLE_TIMEOUT;
use super::message::{MessageEnvelope, SendStatus};
use super::topic::{Destination, TagFilter};
use crate::client::listener::{ListenerError, MessageListener, listener_fn};
use crate::client::subscription::{ConsumeMode, MessageModel, RedeliveryBackoff, Subscription};
use crate::config::Settings;
use crate::persistence::Persistence;
use crate::utils::MqError;

fn test_broker() -> Arc<Broker> {
    let mut settings = Settings::default();
    settings.consumer.redelivery_backoff_ms = Some(10);
    Broker::new_with_persistence(
        &settings.broker,
        &settings.consumer,
        Persistence::temporary().unwrap(),
    )
    .unwrap()
}

fn recording_listener() -> (impl MessageListener, mpsc::UnboundedReceiver<MessageEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = listener_fn(move |message: MessageEnvelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok::<_, ListenerError>(())
        }
    });
    (listener, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<MessageEnvelope>) -> MessageEnvelope {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

#[test]
fn test_destination_splits_on_first_colon() {
    let plain = Destination::parse("springboot-topic").unwrap();
    assert_eq!(plain.topic, "springboot-topic");
    assert_eq!(plain.tag, None);

    let tagged = Destination::parse("springboot-topic:tag:with:colons").unwrap();
    assert_eq!(tagged.topic, "springboot-topic");
    assert_eq!(tagged.tag.as_deref(), Some("tag:with:colons"));
    assert_eq!(tagged.to_string(), "springboot-topic:tag:with:colons");
}

#[test]
fn test_empty_tag_is_rejected() {
    let err = MessageEnvelope::new("topic:", "tag empty ?").unwrap_err();
    assert!(matches!(err, MqError::Validation(_)));

    assert!(matches!(
        MessageEnvelope::new("", "no topic"),
        Err(MqError::Validation(_))
    ));
    assert!(matches!(
        MessageEnvelope::new("bad topic", "space"),
        Err(MqError::Validation(_))
    ));
}

#[test]
fn test_envelope_fields() {
    let msg = MessageEnvelope::new("topic:a", "tag a property 1")
        .unwrap()
        .with_header("property", 1)
        .with_header("another-property", "hello")
        .with_partition_key("2673");

    assert_eq!(msg.topic(), "topic");
    assert_eq!(msg.tag(), Some("a"));
    assert_eq!(msg.partition_key(), Some("2673"));
    assert_eq!(msg.header("property"), Some(&serde_json::json!(1)));
    assert_eq!(msg.body_str(), "tag a property 1");
    assert_eq!(msg.attempt(), 0);
    assert_eq!(msg.message_id(), None);
    assert_eq!(msg.destination(), "topic:a");
}

#[test]
fn test_delay_level_bounds() {
    let msg = || MessageEnvelope::new("topic-delay", "late").unwrap();
    assert!(msg().with_delay_level(0).is_err());
    assert!(msg().with_delay_level(19).is_err());
    assert_eq!(msg().with_delay_level(4).unwrap().delay_level(), Some(4));
}

#[test]
fn test_deserialized_envelope_is_revalidated() {
    let raw = r#"{"topic":"topic","tag":"","body":[104,105]}"#;
    let msg: MessageEnvelope = serde_json::from_str(raw).unwrap();
    assert!(matches!(msg.validate(), Err(MqError::Validation(_))));
}

#[test]
fn test_tag_filter() {
    let all = TagFilter::parse("*").unwrap();
    assert!(all.matches(None));
    assert!(all.matches(Some("tag1")));

    let some = TagFilter::parse("tag1 || tag2").unwrap();
    assert!(some.matches(Some("tag1")));
    assert!(some.matches(Some("tag2")));
    assert!(!some.matches(Some("tag3")));
    assert!(!some.matches(None));

    assert!(TagFilter::parse("tag1 || ").is_err());
}

#[test]
fn test_default_delay_ladder() {
    let ladder = DelayLadder::parse(crate::config::DEFAULT_DELAY_LEVELS).unwrap();
    assert_eq!(ladder.max_level(), 18);
    assert_eq!(ladder.duration(1), Some(Duration::from_secs(1)));
    assert_eq!(ladder.duration(4), Some(Duration::from_secs(30)));
    assert_eq!(ladder.duration(5), Some(Duration::from_secs(60)));
    assert_eq!(ladder.duration(18), Some(Duration::from_secs(7200)));
    assert_eq!(ladder.duration(0), None);
    assert_eq!(ladder.duration(19), None);

    assert!(DelayLadder::parse("").is_err());
    assert!(DelayLadder::parse("1s 5x").is_err());
    assert!(DelayLadder::parse("s").is_err());
}

#[test]
fn test_delay_ladder_rejects_overflowing_durations() {
    assert!(DelayLadder::parse("18446744073709551615m").is_err());
    assert!(DelayLadder::parse("1s 300000000000000d").is_err());

    let largest = DelayLadder::parse("18446744073709551615s").unwrap();
    assert_eq!(largest.duration(1), Some(Duration::from_secs(u64::MAX)));
}

#[tokio::test]
async fn test_dropping_scheduler_stops_timer_tasks() {
    let marker = Arc::new(());
    let held = marker.clone();
    let scheduler = DelayScheduler::new(DelayLadder::parse("1h").unwrap(), move |_envelope| {
        assert!(Arc::strong_count(&held) > 0);
    });

    scheduler
        .schedule(MessageEnvelope::new("topic-delay", "parked").unwrap(), 1)
        .unwrap();
    assert_eq!(scheduler.pending(1), 1);
    assert_eq!(Arc::strong_count(&marker), 2);

    drop(scheduler);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        Arc::strong_count(&marker),
        1,
        "timer task still holds the release callback"
    );
}

#[tokio::test]
async fn test_publish_routes_to_matching_subscription() {
    let broker = test_broker();
    let (listener, mut rx) = recording_listener();
    broker
        .subscribe(
            Subscription::builder("springboot-topic", "consumer-group")
                .selector("tag1")
                .listener(listener)
                .build()
                .unwrap(),
        )
        .unwrap();

    let skipped = MessageEnvelope::new("springboot-topic:other", "filtered out").unwrap();
    broker.publish(skipped).unwrap();
    let result = broker
        .publish(MessageEnvelope::new("springboot-topic:tag1", "hello").unwrap())
        .unwrap();
    assert_eq!(result.status, SendStatus::Ok);
    assert!(!result.message_id.is_empty());

    let received = recv(&mut rx).await;
    assert_eq!(received.body_str(), "hello");
    assert_eq!(received.message_id(), Some(result.message_id.as_str()));
    assert!(received.born_timestamp().is_some());

    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_conflicting_clustering_modes_are_rejected() {
    let broker = test_broker();
    let (first, _rx1) = recording_listener();
    let (second, _rx2) = recording_listener();

    broker
        .subscribe(
            Subscription::builder("topic", "group")
                .mode(ConsumeMode::Concurrent)
                .listener(first)
                .build()
                .unwrap(),
        )
        .unwrap();

    let err = broker
        .subscribe(
            Subscription::builder("topic", "group")
                .mode(ConsumeMode::Ordered)
                .listener(second)
                .build()
                .unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, MqError::DuplicateSubscription { .. }));
    assert_eq!(broker.subscription_count(), 1);
}

#[tokio::test]
async fn test_broadcast_and_clustering_cannot_share_a_group() {
    let broker = test_broker();
    let (first, _rx1) = recording_listener();
    let (second, _rx2) = recording_listener();

    broker
        .subscribe(
            Subscription::builder("topic", "group")
                .model(MessageModel::Broadcast)
                .listener(first)
                .build()
                .unwrap(),
        )
        .unwrap();
    let err = broker
        .subscribe(
            Subscription::builder("topic", "group")
                .listener(second)
                .build()
                .unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, MqError::DuplicateSubscription { .. }));
}

#[tokio::test]
async fn test_clustering_members_share_messages() {
    let broker = test_broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for member in 0..2 {
        let tx = tx.clone();
        broker
            .subscribe(
                Subscription::builder("topic", "group")
                    .listener(listener_fn(move |message: MessageEnvelope| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send((member, message.body_str().into_owned()));
                            Ok::<_, ListenerError>(())
                        }
                    }))
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }

    for i in 0..10 {
        broker
            .publish(MessageEnvelope::new("topic", format!("m{i}")).unwrap())
            .unwrap();
    }

    let mut bodies = Vec::new();
    let mut members = [0; 2];
    for _ in 0..10 {
        let (member, body) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        members[member] += 1;
        bodies.push(body);
    }
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 10, "each message is consumed exactly once");
    assert_eq!(members, [5, 5]);

    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_subscribers_each_receive_every_message() {
    let broker = test_broker();
    let (first, mut rx1) = recording_listener();
    let (second, mut rx2) = recording_listener();
    for (group, listener) in [("group-a", first), ("group-b", second)] {
        broker
            .subscribe(
                Subscription::builder("topic", group)
                    .model(MessageModel::Broadcast)
                    .listener(listener)
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }

    for i in 0..3 {
        broker
            .publish(MessageEnvelope::new("topic", format!("b{i}")).unwrap())
            .unwrap();
    }

    for rx in [&mut rx1, &mut rx2] {
        let mut bodies = Vec::new();
        for _ in 0..3 {
            bodies.push(recv(rx).await.body_str().into_owned());
        }
        bodies.sort();
        assert_eq!(bodies, ["b0", "b1", "b2"]);
    }
}

#[tokio::test]
async fn test_redelivery_until_listener_succeeds() {
    let broker = test_broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = broker
        .subscribe(
            Subscription::builder("topic", "group")
                .listener(listener_fn(move |message: MessageEnvelope| {
                    let tx = tx.clone();
                    async move {
                        if message.attempt() < 3 {
                            return Err::<(), ListenerError>("not yet".into());
                        }
                        let _ = tx.send(message.attempt());
                        Ok(())
                    }
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    broker
        .publish(MessageEnvelope::new("topic", "retry me").unwrap())
        .unwrap();

    let attempt = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt, 3);

    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    let stats = handle.stats();
    assert_eq!(stats.delivered, 4);
    assert_eq!(stats.redelivered, 3);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn test_always_failing_listener_ends_in_dead_letters() {
    let broker = test_broker();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handle = broker
        .subscribe(
            Subscription::builder("topic", "doomed-group")
                .max_redeliveries(2)
                .listener(listener_fn(move |_message: MessageEnvelope| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), ListenerError>("always".into()) }
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    broker
        .publish(MessageEnvelope::new("topic", "poison").unwrap())
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let letters = loop {
        let letters = broker.dead_letters("doomed-group").unwrap();
        if !letters.is_empty() || Instant::now() > deadline {
            break letters;
        }
        sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].envelope.body_str(), "poison");
    assert_eq!(letters[0].envelope.attempt(), 2);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3, "first delivery plus two redeliveries");
    let stats = handle.stats();
    assert_eq!(stats.redelivered, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 0);
}

#[tokio::test]
async fn test_publish_ignores_caller_supplied_attempt() {
    let broker = test_broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            Subscription::builder("topic", "replay-group")
                .max_redeliveries(2)
                .listener(listener_fn(move |message: MessageEnvelope| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message.attempt());
                        Err::<(), ListenerError>("always".into())
                    }
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    let replayed: MessageEnvelope =
        serde_json::from_str(r#"{"topic":"topic","body":[104,105],"attempt":16}"#).unwrap();
    assert_eq!(replayed.attempt(), 16);
    broker.publish(replayed).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while broker.dead_letters("replay-group").unwrap().is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(50)).await;

    let mut attempts = Vec::new();
    while let Ok(attempt) = rx.try_recv() {
        attempts.push(attempt);
    }
    assert_eq!(attempts, [0, 1, 2]);
    assert_eq!(broker.dead_letters("replay-group").unwrap().len(), 1);
}

#[tokio::test]
async fn test_panicking_listener_is_redelivered() {
    let broker = test_broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            Subscription::builder("topic", "group")
                .listener(listener_fn(move |message: MessageEnvelope| {
                    let tx = tx.clone();
                    async move {
                        if message.attempt() == 0 {
                            panic!("first delivery blows up");
                        }
                        let _ = tx.send(message.attempt());
                        Ok::<_, ListenerError>(())
                    }
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    broker
        .publish(MessageEnvelope::new("topic", "boom").unwrap())
        .unwrap();
    let attempt = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt, 1);
}

#[tokio::test]
async fn test_ordered_retry_keeps_later_messages_behind() {
    let broker = test_broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            Subscription::builder("topic", "group")
                .mode(ConsumeMode::Ordered)
                .backoff(RedeliveryBackoff::Fixed(Duration::from_millis(20)))
                .listener(listener_fn(move |message: MessageEnvelope| {
                    let tx = tx.clone();
                    async move {
                        if message.body_str() == "first" && message.attempt() < 2 {
                            return Err::<(), ListenerError>("hold the lane".into());
                        }
                        let _ = tx.send(message.body_str().into_owned());
                        Ok(())
                    }
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    for body in ["first", "second", "third"] {
        broker
            .publish(
                MessageEnvelope::new("topic", body)
                    .unwrap()
                    .with_partition_key("2673"),
            )
            .unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(
            timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(order, ["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn test_delay_level_four_waits_thirty_seconds() {
    let broker = test_broker();
    let (listener, mut rx) = recording_listener();
    broker
        .subscribe(
            Subscription::builder("topic-delay", "group")
                .listener(listener)
                .build()
                .unwrap(),
        )
        .unwrap();

    let start = Instant::now();
    let delayed = MessageEnvelope::new("topic-delay", "a delayed message")
        .unwrap()
        .with_delay_level(4)
        .unwrap();
    broker.publish(delayed).unwrap();
    assert_eq!(broker.pending_delayed(4), 1);

    assert!(
        timeout(Duration::from_secs(29), rx.recv()).await.is_err(),
        "delivered before 30s"
    );

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("not delivered after 30s")
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(received.body_str(), "a delayed message");
    assert_eq!(received.delay_level(), None);
    assert_eq!(broker.pending_delayed(4), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_ordered_lanes_are_closed() {
    let broker = test_broker();
    let (listener, mut rx) = recording_listener();
    let handle = broker
        .subscribe(
            Subscription::builder("orders", "orderly-group")
                .mode(ConsumeMode::Ordered)
                .listener(listener)
                .build()
                .unwrap(),
        )
        .unwrap();

    for i in 0..50 {
        let msg = MessageEnvelope::new("orders", format!("order {i}"))
            .unwrap()
            .with_partition_key(format!("order-{i}"));
        broker.publish(msg).unwrap();
    }
    for _ in 0..50 {
        recv(&mut rx).await;
    }
    assert_eq!(handle.open_lanes(), 50);

    sleep(LANE_IDLE_TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(handle.open_lanes(), 0);
    assert_eq!(handle.stats().acked, 50);

    // a retired key gets a fresh lane
    let again = MessageEnvelope::new("orders", "order 7 again")
        .unwrap()
        .with_partition_key("order-7");
    broker.publish(again).unwrap();
    assert_eq!(recv(&mut rx).await.body_str(), "order 7 again");
    assert_eq!(handle.open_lanes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_messages_release_fifo() {
    let broker = test_broker();
    let (listener, mut rx) = recording_listener();
    broker
        .subscribe(
            Subscription::builder("topic-delay", "group")
                .mode(ConsumeMode::Ordered)
                .listener(listener)
                .build()
                .unwrap(),
        )
        .unwrap();

    for body in ["one", "two", "three"] {
        let msg = MessageEnvelope::new("topic-delay", body)
            .unwrap()
            .with_delay_level(1)
            .unwrap();
        broker.publish(msg).unwrap();
    }

    let mut bodies = Vec::new();
    for _ in 0..3 {
        bodies.push(recv(&mut rx).await.body_str().into_owned());
    }
    assert_eq!(bodies, ["one", "two", "three"]);
}

#[tokio::test]
async fn test_unsubscribe_drains_in_flight_delivery() {
    let broker = test_broker();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (started.clone(), finished.clone());
    let handle = broker
        .subscribe(
            Subscription::builder("topic", "group")
                .listener(listener_fn(move |_message: MessageEnvelope| {
                    let (s, f) = (s.clone(), f.clone());
                    async move {
                        s.store(true, Ordering::SeqCst);
                        sleep(Duration::from_millis(200)).await;
                        f.store(true, Ordering::SeqCst);
                        Ok::<_, ListenerError>(())
                    }
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    broker
        .publish(MessageEnvelope::new("topic", "slow").unwrap())
        .unwrap();
    while !started.load(Ordering::SeqCst) {
        sleep(Duration::from_millis(5)).await;
    }

    let stats_handle = handle.clone();
    broker.unsubscribe(handle).await;
    assert!(finished.load(Ordering::SeqCst), "unsubscribe returned before the listener finished");
    assert_eq!(broker.subscription_count(), 0);

    broker
        .publish(MessageEnvelope::new("topic", "after").unwrap())
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(stats_handle.stats().delivered, 1);
}

#[tokio::test]
async fn test_publish_after_shutdown_fails() {
    let broker = test_broker();
    broker.shutdown();
    let err = broker
        .publish(MessageEnvelope::new("topic", "late").unwrap())
        .unwrap_err();
    assert!(matches!(err, MqError::BrokerUnavailable { .. }));
}

#[tokio::test]
async fn test_publish_without_subscription_is_accepted() {
    let broker = test_broker();
    let result = broker
        .publish(MessageEnvelope::new("nobody-listens", "hello").unwrap())
        .unwrap();
    assert_eq!(result.status, SendStatus::Ok);
}
