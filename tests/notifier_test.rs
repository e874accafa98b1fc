// Notifier integration tests against the in-memory broker

mod common;

use common::{bounded_retry, eventually, fast_retry, finish, notifier_config};
use rbmq_link::connection::{ConnectionState, MemoryBroker};
use rbmq_link::metrics::{
    MemorySink, MetricsSink, CONNECTED, PENDING_BUFFER_SIZE, PUBLISH_ERRORS, RECONNECT_COUNT,
};
use rbmq_link::notifier::{read_snapshot, Notifier, OutboundMessage};
use rbmq_link::BrokerError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_test::assert_pending;

async fn start(broker: &MemoryBroker, capacity: usize) -> (Notifier, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let notifier = Notifier::start_with_policy(
        notifier_config(capacity),
        Arc::new(broker.clone()),
        sink.clone(),
        fast_retry(),
    )
    .await
    .unwrap();
    (notifier, sink)
}

fn payloads(broker: &MemoryBroker, queue: &str) -> Vec<String> {
    broker
        .published()
        .into_iter()
        .filter(|m| m.queue == queue)
        .map(|m| String::from_utf8(m.payload).unwrap())
        .collect()
}

/// A message published with the broker reachable lands on its queue and the
/// pending gauge drops back to zero.
#[tokio::test(start_paused = true)]
async fn test_publish_reaches_queue() {
    let broker = MemoryBroker::new();
    let (notifier, sink) = start(&broker, 16).await;

    notifier
        .publish(OutboundMessage::new("sms_requests", "hello").with_priority(0))
        .await
        .unwrap();

    eventually("message published", || broker.published_count("sms_requests") == 1).await;
    eventually("pending gauge drained", || sink.gauge(PENDING_BUFFER_SIZE) == Some(0.0)).await;

    assert_eq!(payloads(&broker, "sms_requests"), vec!["hello"]);
    assert_eq!(broker.queue_len("sms_requests"), 1);
    assert_eq!(notifier.pending_len(), 0);
    assert_eq!(sink.gauge(CONNECTED), Some(1.0));

    assert_eq!(notifier.shutdown().await.unwrap(), 0);
}

/// A publish failure counts one error, drops the connection, keeps the
/// message buffered and publishes it after the reconnect.
#[tokio::test(start_paused = true)]
async fn test_publish_failure_requeues_and_recovers() {
    let broker = MemoryBroker::new();
    let (notifier, sink) = start(&broker, 16).await;

    broker.fail_next_publishes(1);
    notifier
        .publish(OutboundMessage::new("sms_requests", "retry-me"))
        .await
        .unwrap();

    eventually("publish error counted", || sink.gauge(PUBLISH_ERRORS) == Some(1.0)).await;
    assert_eq!(sink.gauge(CONNECTED), Some(0.0));
    assert_eq!(notifier.pending_len(), 1);
    assert_eq!(broker.published_count("sms_requests"), 0);

    eventually("message republished", || broker.published_count("sms_requests") >= 1).await;
    assert_eq!(payloads(&broker, "sms_requests")[0], "retry-me");
    assert_eq!(sink.gauge(PUBLISH_ERRORS), Some(1.0));
    assert_eq!(sink.gauge(CONNECTED), Some(1.0));
    assert_eq!(sink.gauge(RECONNECT_COUNT), Some(0.0));
    assert_eq!(notifier.pending_len(), 0);

    notifier.shutdown().await.unwrap();
}

/// Messages published across connection drops and an outage all reach the
/// broker once it stays up. Duplicates are allowed.
#[tokio::test(start_paused = true)]
async fn test_no_message_lost_across_drops() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 64).await;

    let expected: HashSet<String> = (0..40).map(|i| format!("m{}", i)).collect();
    for i in 0..40 {
        if i % 10 == 5 {
            broker.drop_connections();
        }
        if i == 20 {
            broker.set_available(false);
        }
        if i == 30 {
            broker.set_available(true);
        }
        notifier
            .publish(OutboundMessage::new("events", format!("m{}", i)))
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }

    eventually("every message published", || {
        let seen: HashSet<String> = payloads(&broker, "events").into_iter().collect();
        expected.is_subset(&seen)
    })
    .await;

    notifier.shutdown().await.unwrap();
}

/// A message that failed is republished before anything queued behind it.
#[tokio::test(start_paused = true)]
async fn test_retried_message_keeps_its_place() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 16).await;

    broker.fail_next_publishes(1);
    for i in 0..3 {
        notifier
            .publish(OutboundMessage::new("ordered", format!("m{}", i)))
            .await
            .unwrap();
    }

    eventually("all published", || broker.published_count("ordered") == 3).await;
    assert_eq!(payloads(&broker, "ordered"), vec!["m0", "m1", "m2"]);

    notifier.shutdown().await.unwrap();
}

/// A message whose queue the broker keeps refusing is moved behind later
/// messages after repeated failures instead of blocking them.
#[tokio::test(start_paused = true)]
async fn test_failing_message_does_not_block_later_ones() {
    let broker = MemoryBroker::new();
    let (notifier, sink) = start(&broker, 16).await;

    broker.refuse_declares("forbidden");
    notifier
        .publish(OutboundMessage::new("forbidden", "poison"))
        .await
        .unwrap();
    notifier
        .publish(OutboundMessage::new("allowed", "good"))
        .await
        .unwrap();

    eventually("later message published", || broker.published_count("allowed") == 1).await;
    assert_eq!(broker.published_count("forbidden"), 0);
    assert!(sink.gauge(PUBLISH_ERRORS).unwrap_or(0.0) >= 3.0);

    broker.accept_declares("forbidden");
    eventually("deferred message published", || broker.published_count("forbidden") == 1).await;
    eventually("nothing left unpublished", || notifier.unpublished() == 0).await;

    notifier.shutdown().await.unwrap();
}

/// With both buffers full `publish` waits instead of failing, and
/// `try_publish` reports `BufferFull`.
#[tokio::test(start_paused = true)]
async fn test_full_buffers_apply_backpressure() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 1).await;

    broker.set_available(false);
    broker.drop_connections();
    eventually("publish loop reconnecting", || {
        notifier.supervisor().state() != ConnectionState::Connected
    })
    .await;

    // m0 fills pending, m1 waits in the forwarder, m2 fills staging
    notifier.publish(OutboundMessage::new("q", "m0")).await.unwrap();
    eventually("m0 forwarded", || notifier.pending_len() == 1).await;
    notifier.publish(OutboundMessage::new("q", "m1")).await.unwrap();
    eventually("m1 picked up", || notifier.staging_len() == 0).await;
    notifier.publish(OutboundMessage::new("q", "m2")).await.unwrap();
    assert_eq!(notifier.staging_len(), 1);

    let mut blocked = tokio_test::task::spawn(notifier.publish(OutboundMessage::new("q", "m3")));
    assert_pending!(blocked.poll());
    assert!(matches!(
        notifier.try_publish(OutboundMessage::new("q", "m4")),
        Err(BrokerError::BufferFull)
    ));
    assert_eq!(notifier.unpublished(), 3);

    broker.set_available(true);
    finish(&mut blocked).await.unwrap();
    drop(blocked);

    eventually("backlog published", || broker.published_count("q") == 4).await;
    assert_eq!(payloads(&broker, "q"), vec!["m0", "m1", "m2", "m3"]);

    notifier.shutdown().await.unwrap();
}

/// An empty destination queue is a configuration error and touches no buffer.
#[tokio::test(start_paused = true)]
async fn test_empty_queue_rejected() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 16).await;

    let err = notifier
        .publish(OutboundMessage::new("", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Configuration(_)));
    assert!(matches!(
        notifier.try_publish(OutboundMessage::new("", "x")),
        Err(BrokerError::Configuration(_))
    ));

    assert_eq!(notifier.staging_len(), 0);
    assert_eq!(notifier.pending_len(), 0);
    assert!(broker.published().is_empty());

    notifier.shutdown().await.unwrap();
}

/// The first connect happens in `start` and its failure is returned.
#[tokio::test(start_paused = true)]
async fn test_start_fails_without_broker() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let result = Notifier::start_with_policy(
        notifier_config(16),
        Arc::new(broker.clone()),
        Arc::new(MemorySink::new()),
        fast_retry(),
    )
    .await;

    assert!(matches!(result, Err(BrokerError::Dial(_))));
    assert_eq!(broker.dial_count(), 1);
}

/// Repeated drop/reconnect cycles end in the same state as one clean connect.
#[tokio::test(start_paused = true)]
async fn test_reconnect_cycles_converge() {
    let broker = MemoryBroker::new();
    let (notifier, sink) = start(&broker, 16).await;
    let baseline = (sink.gauge(CONNECTED), notifier.supervisor().state());

    for cycle in 0..3 {
        broker.fail_next_dials(cycle);
        let generation = notifier.supervisor().generation();
        broker.drop_connections();
        eventually("reconnected", || notifier.supervisor().generation() > generation).await;

        assert_eq!((sink.gauge(CONNECTED), notifier.supervisor().state()), baseline);
        assert_eq!(sink.gauge(RECONNECT_COUNT), Some(0.0));
    }
    assert_eq!(broker.open_links(), 1);

    notifier.shutdown().await.unwrap();
}

/// Buffered messages survive a restart through the snapshot file.
#[tokio::test(start_paused = true)]
async fn test_snapshot_round_trip_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pending.json");
    let broker = MemoryBroker::new();

    let mut config = notifier_config(16);
    config.pending_buffer_path = Some(path.clone());
    let notifier = Notifier::start_with_policy(
        config.clone(),
        Arc::new(broker.clone()),
        Arc::new(MemorySink::new()),
        fast_retry(),
    )
    .await
    .unwrap();

    broker.set_available(false);
    broker.drop_connections();
    for i in 0..3 {
        notifier
            .publish(OutboundMessage::new("q", format!("m{}", i)).with_event_tag("renewal"))
            .await
            .unwrap();
    }

    assert_eq!(notifier.shutdown().await.unwrap(), 3);
    let saved = read_snapshot(&path).await.unwrap();
    assert_eq!(saved.len(), 3);
    assert_eq!(saved[0].event_tag.as_deref(), Some("renewal"));

    broker.set_available(true);
    let restarted = Notifier::start_with_policy(
        config,
        Arc::new(broker.clone()),
        Arc::new(MemorySink::new()),
        fast_retry(),
    )
    .await
    .unwrap();

    eventually("restored messages published", || broker.published_count("q") == 3).await;
    assert_eq!(payloads(&broker, "q"), vec!["m0", "m1", "m2"]);
    assert!(!path.exists());

    restarted.shutdown().await.unwrap();
}

/// When the retry policy gives up the notifier keeps what it buffered.
#[tokio::test(start_paused = true)]
async fn test_gives_up_after_bounded_retries() {
    let broker = MemoryBroker::new();
    let sink = Arc::new(MemorySink::new());
    let notifier = Notifier::start_with_policy(
        notifier_config(16),
        Arc::new(broker.clone()),
        sink.clone(),
        bounded_retry(2),
    )
    .await
    .unwrap();

    broker.set_available(false);
    broker.drop_connections();
    eventually("supervisor failed", || {
        notifier.supervisor().state() == ConnectionState::Failed
    })
    .await;
    assert_eq!(sink.gauge(RECONNECT_COUNT), Some(2.0));

    notifier.publish(OutboundMessage::new("q", "late")).await.unwrap();
    assert!(matches!(
        notifier.queue_size("q").await,
        Err(BrokerError::NotConnected)
    ));
    assert_eq!(notifier.shutdown().await.unwrap(), 1);
}

/// `queue_size` reports the broker backlog.
#[tokio::test(start_paused = true)]
async fn test_queue_size() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 16).await;

    for i in 0..4 {
        broker.enqueue("backlog", format!("m{}", i));
    }
    assert_eq!(notifier.queue_size("backlog").await.unwrap(), 4);

    notifier.shutdown().await.unwrap();
}

/// After shutdown `queue_size` fails at once instead of waiting for a
/// connection that will never come back.
#[tokio::test(start_paused = true)]
async fn test_queue_size_after_shutdown() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 16).await;

    notifier.shutdown().await.unwrap();
    assert!(matches!(
        notifier.queue_size("q").await,
        Err(BrokerError::Shutdown)
    ));
}

/// A `queue_size` call waiting for a reconnect is released by shutdown.
#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_waiting_queue_size() {
    let broker = MemoryBroker::new();
    let (notifier, _sink) = start(&broker, 16).await;

    broker.set_available(false);
    broker.drop_connections();
    eventually("publish loop reconnecting", || {
        notifier.supervisor().state() != ConnectionState::Connected
    })
    .await;

    let mut waiting = tokio_test::task::spawn(notifier.queue_size("q"));
    assert_pending!(waiting.poll());

    notifier.shutdown().await.unwrap();
    assert!(matches!(finish(&mut waiting).await, Err(BrokerError::Shutdown)));
}

/// Two notifiers in one process keep separate state and metrics.
#[tokio::test(start_paused = true)]
async fn test_independent_instances() {
    let broker = MemoryBroker::new();
    let (first, first_sink) = start(&broker, 16).await;
    let (second, second_sink) = start(&broker, 16).await;

    broker.fail_next_publishes(1);
    first.publish(OutboundMessage::new("a", "1")).await.unwrap();
    eventually("first published", || broker.published_count("a") == 1).await;

    second.publish(OutboundMessage::new("b", "2")).await.unwrap();
    eventually("second published", || broker.published_count("b") == 1).await;

    assert_eq!(first_sink.gauge(PUBLISH_ERRORS), Some(1.0));
    assert_eq!(second_sink.gauge(PUBLISH_ERRORS), Some(0.0));

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}
