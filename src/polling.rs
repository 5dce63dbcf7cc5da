//! Polling scheduler.
//!
//! A schedule fetches once immediately, then once per interval while active.
//! Ticks that find their [`FetchKey`] already in flight are skipped, never
//! queued, so a slow network cannot pile up overlapping requests.
//!
//! Background tasks hold only weak references to the schedule: dropping every
//! [`PollHandle`] stops it just like [`PollHandle::cancel`] does.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::command::CommandResult;
use crate::fetch_key::{FetchKey, InFlightGuard, InFlightRegistry};

/// Smallest accepted interval.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// =============================================================================
// Poll Outcome
// =============================================================================

/// What a poll request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollOutcome {
    /// A fetch was started.
    Started,
    /// A fetch for the same key was in flight; nothing was started.
    Skipped,
    /// A fetch was in flight; one follow-up fetch will run right after it.
    Queued,
    /// The schedule is cancelled.
    Cancelled,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Starts polling schedules that share one [`InFlightRegistry`].
#[derive(Debug, Clone, Default)]
pub struct PollingScheduler {
    registry: InFlightRegistry,
}

impl PollingScheduler {
    /// Creates a scheduler using `registry` for single-flight.
    #[must_use]
    pub const fn new(registry: InFlightRegistry) -> Self {
        Self { registry }
    }

    /// Registry shared by every schedule of this scheduler.
    #[must_use]
    pub const fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Starts polling `key` every `interval`.
    ///
    /// # Arguments
    ///
    /// * `key` - Identity of the request, used for single-flight.
    /// * `interval` - Delay between ticks; the first tick fires immediately.
    /// * `fetch` - Produces one fetch per tick, typically a
    ///   [`CommandExecutor::execute`](crate::command::CommandExecutor::execute) call.
    /// * `on_result` - Receives each successful result while the schedule is active.
    ///
    /// Failed fetches are dropped; the next tick is the retry.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start_polling<T, F, Fut, C>(
        &self,
        key: FetchKey,
        interval: Duration,
        fetch: F,
        on_result: C,
    ) -> PollHandle
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult<T>> + Send + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        let poller = Arc::new_cyclic(|this| Poller {
            this: this.clone(),
            key,
            registry: self.registry.clone(),
            fetch: Box::new(move || fetch().boxed()),
            on_result: Box::new(on_result),
            active: AtomicBool::new(true),
            follow_up: AtomicBool::new(false),
            tasks: Mutex::default(),
        });
        poller.start_timer(interval.max(MIN_INTERVAL));
        tracing::debug!(
            fetch_key = %poller.key,
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "polling started"
        );
        PollHandle { control: poller }
    }
}

// =============================================================================
// Poll Handle
// =============================================================================

trait PollControl: Send + Sync {
    fn key(&self) -> &FetchKey;
    fn poll_now(&self) -> PollOutcome;
    fn force_refresh(&self) -> PollOutcome;
    fn cancel(&self);
    fn is_active(&self) -> bool;
}

/// Cancellation and control handle of one polling schedule.
#[derive(Clone)]
pub struct PollHandle {
    control: Arc<dyn PollControl>,
}

impl PollHandle {
    /// Key this schedule fetches.
    #[must_use]
    pub fn key(&self) -> &FetchKey {
        self.control.key()
    }

    /// Fetches now unless a fetch for the key is already in flight.
    pub fn poll_now(&self) -> PollOutcome {
        self.control.poll_now()
    }

    /// Fetches now; when a fetch is in flight, runs exactly one more right
    /// after it instead of skipping.
    pub fn force_refresh(&self) -> PollOutcome {
        self.control.force_refresh()
    }

    /// Stops future ticks and discards any in-flight result. Idempotent.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Returns `true` until the schedule is cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }
}

impl fmt::Debug for PollHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PollHandle")
            .field("key", self.key())
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Poller
// =============================================================================

type FetchFn<T> = Box<dyn Fn() -> BoxFuture<'static, CommandResult<T>> + Send + Sync>;

#[derive(Default)]
struct PollTasks {
    timer: Option<AbortHandle>,
    fetch: Option<AbortHandle>,
    follow_up: Option<AbortHandle>,
}

impl PollTasks {
    fn abort_all(&mut self) {
        for task in [self.timer.take(), self.fetch.take(), self.follow_up.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct Poller<T> {
    this: Weak<Self>,
    key: FetchKey,
    registry: InFlightRegistry,
    fetch: FetchFn<T>,
    on_result: Box<dyn Fn(T) + Send + Sync>,
    active: AtomicBool,
    follow_up: AtomicBool,
    tasks: Mutex<PollTasks>,
}

impl<T: Send + 'static> Poller<T> {
    fn start_timer(&self, interval: Duration) {
        let poller = self.this.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(poller) = poller.upgrade() else {
                    break;
                };
                poller.tick("interval");
            }
        });
        self.tasks.lock().timer = Some(timer.abort_handle());
    }

    fn tick(&self, reason: &'static str) -> PollOutcome {
        if !self.is_active() {
            return PollOutcome::Cancelled;
        }
        match self.registry.try_acquire(&self.key) {
            Some(guard) => {
                self.spawn_fetch(guard);
                PollOutcome::Started
            }
            None => {
                tracing::debug!(fetch_key = %self.key, reason, "poll skipped, fetch in flight");
                PollOutcome::Skipped
            }
        }
    }

    fn spawn_fetch(&self, guard: InFlightGuard) {
        let response = (self.fetch)();
        let poller = self.this.clone();
        let task = tokio::spawn(async move {
            let result = response.await;
            if let Some(poller) = poller.upgrade() {
                poller.deliver(result);
            }
            drop(guard);
        });
        self.tasks.lock().fetch = Some(task.abort_handle());
    }

    fn deliver(&self, result: CommandResult<T>) {
        if !self.is_active() {
            tracing::debug!(fetch_key = %self.key, "discarding poll result after cancellation");
            return;
        }
        match result {
            Ok(data) => (self.on_result)(data),
            Err(error) => tracing::debug!(
                fetch_key = %self.key,
                error_kind = %error.kind,
                "poll failed, waiting for next tick"
            ),
        }
    }

    fn queue_follow_up(&self) {
        if self.follow_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = self.this.clone();
        let registry = self.registry.clone();
        let key = self.key.clone();
        let task = tokio::spawn(async move {
            let guard = registry.acquire(&key).await;
            let Some(poller) = poller.upgrade() else {
                return;
            };
            poller.follow_up.store(false, Ordering::SeqCst);
            if poller.is_active() {
                tracing::debug!(fetch_key = %key, "running queued follow-up fetch");
                poller.spawn_fetch(guard);
            }
        });
        self.tasks.lock().follow_up = Some(task.abort_handle());
    }
}

impl<T: Send + 'static> PollControl for Poller<T> {
    fn key(&self) -> &FetchKey {
        &self.key
    }

    fn poll_now(&self) -> PollOutcome {
        self.tick("requested")
    }

    fn force_refresh(&self) -> PollOutcome {
        match self.tick("forced") {
            PollOutcome::Skipped => {
                self.queue_follow_up();
                PollOutcome::Queued
            }
            outcome => outcome,
        }
    }

    fn cancel(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.tasks.lock().abort_all();
        tracing::debug!(fetch_key = %self.key, "polling cancelled");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, ErrorKind};
    use crate::fetch_key::FetchParams;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;

    struct Counters {
        calls: AtomicUsize,
        results: Mutex<Vec<usize>>,
    }

    fn counters() -> Arc<Counters> {
        Arc::new(Counters {
            calls: AtomicUsize::new(0),
            results: Mutex::default(),
        })
    }

    fn start(
        scheduler: &PollingScheduler,
        counters: &Arc<Counters>,
        interval: Duration,
        latency: Duration,
    ) -> PollHandle {
        let fetch_counters = Arc::clone(counters);
        let result_counters = Arc::clone(counters);
        scheduler.start_polling(
            FetchKey::new("/tickets", &FetchParams::new()),
            interval,
            move || {
                let call = fetch_counters.calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(latency).await;
                    Ok(call)
                }
            },
            move |call| result_counters.results.lock().push(call),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_first_fetch_is_immediate_then_every_interval() {
        let counters = counters();
        let handle = start(
            &PollingScheduler::default(),
            &counters,
            Duration::from_secs(30),
            Duration::ZERO,
        );

        settle().await;
        assert_eq!(*counters.results.lock(), [1]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(*counters.results.lock(), [1, 2]);

        handle.cancel();
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_tick_during_slow_fetch_is_skipped() {
        let counters = counters();
        let handle = start(
            &PollingScheduler::default(),
            &counters,
            Duration::from_secs(1),
            Duration::from_millis(2500),
        );

        tokio::time::sleep(Duration::from_millis(2600)).await;
        settle().await;

        // Ticks at 1s and 2s found the first fetch in flight.
        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*counters.results.lock(), [1]);
        handle.cancel();
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_poll_now_reports_skip_while_in_flight() {
        let counters = counters();
        let handle = start(
            &PollingScheduler::default(),
            &counters,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        settle().await;

        assert_eq!(handle.poll_now(), PollOutcome::Skipped);

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(handle.poll_now(), PollOutcome::Started);
        handle.cancel();
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_queues_one_follow_up() {
        let counters = counters();
        let handle = start(
            &PollingScheduler::default(),
            &counters,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        settle().await;

        assert_eq!(handle.force_refresh(), PollOutcome::Queued);
        assert_eq!(handle.force_refresh(), PollOutcome::Queued);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(*counters.results.lock(), [1, 2]);
        handle.cancel();
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_result_and_is_idempotent() {
        let counters = counters();
        let handle = start(
            &PollingScheduler::default(),
            &counters,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        settle().await;

        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert!(counters.results.lock().is_empty());
        assert!(!handle.is_active());
        assert_eq!(handle.poll_now(), PollOutcome::Cancelled);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_in_flight_key() {
        let scheduler = PollingScheduler::default();
        let counters = counters();
        let handle = start(&scheduler, &counters, Duration::from_secs(30), Duration::from_secs(5));
        settle().await;
        assert_eq!(scheduler.registry().len(), 1);

        handle.cancel();
        settle().await;

        assert!(scheduler.registry().is_empty());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_stops_polling() {
        let counters = counters();
        let handle = start(
            &PollingScheduler::default(),
            &counters,
            Duration::from_secs(1),
            Duration::ZERO,
        );
        settle().await;

        drop(handle);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_is_not_delivered() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&delivered);
        let handle = PollingScheduler::default().start_polling(
            FetchKey::new("/bugs", &FetchParams::new()),
            Duration::from_secs(30),
            || async { Err::<(), _>(CommandError::new(ErrorKind::Server, "HTTP 503")) },
            move |()| {
                sink.fetch_add(1, Ordering::SeqCst);
            },
        );
        settle().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert!(handle.is_active());
        handle.cancel();
    }
}
