//! Push subscriber reconnect schedule and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use boardsync::prelude::*;
use boardsync::push::{BackoffPolicy, EventChannel};
use common::FakeChannel;
use parking_lot::Mutex;
use rstest::rstest;

fn subscriber(channel: &Arc<FakeChannel>) -> PushSubscriber {
    PushSubscriber::new(
        Arc::clone(channel) as Arc<dyn EventChannel>,
        BackoffPolicy::default(),
    )
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_two_four_eight_then_resets() {
    let channel = FakeChannel::new();
    channel.refuse_next(3);
    let subscription = subscriber(&channel).subscribe(TopicFilter::Broadcast, |_| {});

    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(channel.attempt_gaps(), [2, 4, 8]);
    assert_eq!(subscription.status(), ConnectionStatus::Connected);
    assert_eq!(subscription.attempt_count(), 0);

    channel.drop_connections();
    common::settle().await;

    assert_eq!(subscription.retry_delay(), Duration::from_secs(2));
    assert_eq!(
        subscription.status(),
        ConnectionStatus::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(2)
        }
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_delay_is_capped_and_retries_never_stop() {
    let channel = FakeChannel::new();
    channel.refuse_next(8);
    let subscription = subscriber(&channel).subscribe(TopicFilter::Broadcast, |_| {});

    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(channel.attempt_gaps(), [2, 4, 8, 16, 30, 30, 30, 30]);
    assert_eq!(subscription.status(), ConnectionStatus::Connected);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_unsubscribe_is_idempotent_and_stops_reconnects() {
    let channel = FakeChannel::new();
    channel.refuse_next(100);
    let subscription = subscriber(&channel).subscribe(TopicFilter::Broadcast, |_| {});
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(subscription.status().is_degraded());

    subscription.unsubscribe();
    subscription.unsubscribe();
    let attempts = channel.attempts.lock().len();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(channel.attempts.lock().len(), attempts);
    assert_eq!(subscription.status(), ConnectionStatus::Closed);
    assert!(!subscription.is_active());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_dropping_subscription_closes_connection_and_silences_callback() {
    let channel = FakeChannel::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let subscription = subscriber(&channel).subscribe(TopicFilter::Broadcast, move |message| {
        sink.lock().push(message.topic);
    });
    common::settle().await;
    channel.publish("ticket.updated");
    common::settle().await;

    drop(subscription);
    common::settle().await;
    channel.publish("ticket.deleted");
    common::settle().await;

    assert_eq!(*received.lock(), ["ticket.updated"]);
    assert!(channel.open_filters().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_targeted_and_broadcast_scopes_coexist() {
    let channel = FakeChannel::new();
    let subscriber = subscriber(&channel);
    let received = Arc::new(Mutex::new(Vec::new()));

    let subscriptions: Vec<Subscription> = [
        TopicFilter::Targeted(UserId::new("u-1")),
        TopicFilter::Broadcast,
    ]
    .into_iter()
    .map(|filter| {
        let sink = Arc::clone(&received);
        let label = filter.to_string();
        subscriber.subscribe(filter, move |message| {
            sink.lock().push(format!("{label}:{}", message.topic));
        })
    })
    .collect();
    common::settle().await;
    channel.publish("standup.commented");
    common::settle().await;

    assert_eq!(subscriptions.len(), 2);
    assert_eq!(channel.open_filters().len(), 2);
    assert_eq!(received.lock().len(), 2);
}
