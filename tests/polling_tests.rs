//! Polling scheduler behavior under slow responses and cancellation.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use boardsync::command::CommandError;
use boardsync::prelude::*;
use parking_lot::Mutex;
use rstest::rstest;

/// Fetch counting calls and the highest number of concurrent requests.
#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    results: Mutex<Vec<usize>>,
}

fn start(
    scheduler: &PollingScheduler,
    probe: &Arc<Probe>,
    interval: Duration,
    latency: Duration,
) -> PollHandle {
    let fetch = {
        let probe = Arc::clone(probe);
        move || {
            let probe = Arc::clone(&probe);
            async move {
                let call = probe.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                probe.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(latency).await;
                probe.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<usize, CommandError>(call)
            }
        }
    };
    let sink = Arc::clone(probe);
    scheduler.start_polling(
        FetchKey::new("/tickets", &FetchParams::new()),
        interval,
        fetch,
        move |call| sink.results.lock().push(call),
    )
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_ten_poll_now_calls_issue_one_request() {
    let probe = Arc::new(Probe::default());
    let handle = start(
        &PollingScheduler::default(),
        &probe,
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    common::settle().await;

    let outcomes: Vec<PollOutcome> = (0..10).map(|_| handle.poll_now()).collect();

    assert!(outcomes.iter().all(|outcome| *outcome == PollOutcome::Skipped));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(handle.poll_now(), PollOutcome::Started);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_slow_network_never_overlaps_requests() {
    let probe = Arc::new(Probe::default());
    let _handle = start(
        &PollingScheduler::default(),
        &probe,
        Duration::from_secs(1),
        Duration::from_millis(2500),
    );

    tokio::time::sleep(Duration::from_millis(9500)).await;

    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    // ticks at 0, 3, 6 and 9 seconds; the ones in between found a fetch in flight
    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_cancel_discards_late_response_and_frees_key() {
    let scheduler = PollingScheduler::default();
    let probe = Arc::new(Probe::default());
    let handle = start(
        &scheduler,
        &probe,
        Duration::from_secs(30),
        Duration::from_secs(5),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;

    handle.cancel();
    handle.cancel();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(!handle.is_active());
    assert!(probe.results.lock().is_empty());
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert!(!scheduler.registry().is_in_flight(handle.key()));
    assert_eq!(handle.poll_now(), PollOutcome::Cancelled);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_forced_refresh_runs_once_after_in_flight_fetch() {
    let probe = Arc::new(Probe::default());
    let handle = start(
        &PollingScheduler::default(),
        &probe,
        Duration::from_secs(60),
        Duration::from_secs(2),
    );
    common::settle().await;

    assert_eq!(handle.force_refresh(), PollOutcome::Queued);
    assert_eq!(handle.force_refresh(), PollOutcome::Queued);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*probe.results.lock(), [1, 2]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_schedules_with_one_key_share_single_flight() {
    let scheduler = PollingScheduler::default();
    let probe = Arc::new(Probe::default());
    let _first = start(
        &scheduler,
        &probe,
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    let second = start(
        &scheduler,
        &probe,
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    common::settle().await;

    assert_eq!(second.poll_now(), PollOutcome::Skipped);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
}
