//! Push subscriber: one long-lived event channel per subscription, kept open
//! with exponential-backoff reconnects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::backoff::{Backoff, BackoffPolicy};
use super::message::{PushMessage, TopicFilter};

// =============================================================================
// Event Channel
// =============================================================================

/// Stream of inbound messages of one connection.
pub type MessageStream = BoxStream<'static, Result<PushMessage, ChannelError>>;

/// Connection-level failure of an event channel.
///
/// Every variant is recovered by reconnecting; callers only ever see it as a
/// degraded [`ConnectionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel could not be opened.
    #[error("failed to open event channel: {0}")]
    Connect(String),

    /// The server refused the subscription.
    #[error("event channel rejected with HTTP {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided message or canonical reason.
        message: String,
    },

    /// An open channel failed mid-stream.
    #[error("event channel dropped: {0}")]
    Dropped(String),
}

/// Server-to-client event channel.
pub trait EventChannel: Send + Sync {
    /// Opens a channel scoped to `filter`.
    ///
    /// The returned stream ends when the server closes the connection.
    fn connect(&self, filter: &TopicFilter)
    -> BoxFuture<'static, Result<MessageStream, ChannelError>>;
}

// =============================================================================
// Connection Status
// =============================================================================

/// Observable state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Channel open.
    Connected,
    /// Connection lost; the next attempt runs after `delay`.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Unsubscribed.
    Closed,
}

impl ConnectionStatus {
    /// Returns `true` while the data shown may be stale (`connection_lost`).
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => formatter.write_str("connecting"),
            Self::Connected => formatter.write_str("connected"),
            Self::Reconnecting { attempt, delay } => {
                write!(formatter, "reconnecting (attempt {attempt}, in {delay:?})")
            }
            Self::Closed => formatter.write_str("closed"),
        }
    }
}

// =============================================================================
// Push Subscriber
// =============================================================================

type MessageCallback = Arc<dyn Fn(PushMessage) + Send + Sync>;

/// Opens subscriptions over one [`EventChannel`].
#[derive(Clone)]
pub struct PushSubscriber {
    channel: Arc<dyn EventChannel>,
    policy: BackoffPolicy,
}

impl fmt::Debug for PushSubscriber {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PushSubscriber")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PushSubscriber {
    /// Creates a subscriber reconnecting with `policy`.
    #[must_use]
    pub fn new(channel: Arc<dyn EventChannel>, policy: BackoffPolicy) -> Self {
        Self { channel, policy }
    }

    /// Reconnect policy.
    #[must_use]
    pub const fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Subscribes to `filter`, invoking `on_message` for every inbound message.
    ///
    /// The subscriber does not interpret messages. Reconnects are unbounded;
    /// only [`Subscription::unsubscribe`] (or dropping the subscription)
    /// stops them.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn subscribe<F>(&self, filter: TopicFilter, on_message: F) -> Subscription
    where
        F: Fn(PushMessage) + Send + Sync + 'static,
    {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(SubscriptionShared {
            filter,
            active: AtomicBool::new(true),
            status,
            descriptor: Mutex::new(Descriptor {
                attempt_count: 0,
                retry_delay: self.policy.initial,
            }),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.channel),
            self.policy,
            Arc::clone(&shared),
            Arc::new(on_message),
        ));
        *shared.task.lock() = Some(task.abort_handle());
        Subscription { shared }
    }
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    attempt_count: u32,
    retry_delay: Duration,
}

struct SubscriptionShared {
    filter: TopicFilter,
    active: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
    descriptor: Mutex<Descriptor>,
    task: Mutex<Option<AbortHandle>>,
}

impl SubscriptionShared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Publishes `status` unless the subscription is already closed.
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == ConnectionStatus::Closed || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Live subscription. Unsubscribes when dropped.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    /// Scope of this subscription.
    #[must_use]
    pub fn filter(&self) -> &TopicFilter {
        &self.shared.filter
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Receiver of connection status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Consecutive failed connection attempts; zero once connected.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.shared.descriptor.lock().attempt_count
    }

    /// Delay of the pending (or most recent) reconnect.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.shared.descriptor.lock().retry_delay
    }

    /// Returns `true` until unsubscribed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Closes the connection and cancels any pending reconnect. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
        self.shared.status.send_replace(ConnectionStatus::Closed);
        tracing::debug!(filter = %self.shared.filter, "push subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("filter", &self.shared.filter)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

async fn run_subscription(
    channel: Arc<dyn EventChannel>,
    policy: BackoffPolicy,
    shared: Arc<SubscriptionShared>,
    on_message: MessageCallback,
) {
    let filter = shared.filter.clone();
    let mut backoff = Backoff::new(policy);
    let mut attempt: u32 = 0;

    while shared.is_active() {
        match channel.connect(&filter).await {
            Ok(stream) => {
                attempt = 0;
                backoff.reset();
                *shared.descriptor.lock() = Descriptor {
                    attempt_count: 0,
                    retry_delay: backoff.current(),
                };
                shared.set_status(ConnectionStatus::Connected);
                tracing::info!(%filter, "push channel connected");

                match dispatch(stream, &shared, &on_message).await {
                    Some(error) => tracing::warn!(%filter, %error, "push channel lost"),
                    None => tracing::warn!(%filter, "push channel closed by server"),
                }
            }
            Err(error) => tracing::warn!(%filter, %error, "push channel connect failed"),
        }
        if !shared.is_active() {
            break;
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff.next_delay();
        *shared.descriptor.lock() = Descriptor {
            attempt_count: attempt,
            retry_delay: delay,
        };
        shared.set_status(ConnectionStatus::Reconnecting { attempt, delay });
        tracing::warn!(
            %filter,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "push channel reconnect scheduled"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Forwards messages until the stream ends or fails; returns the failure.
async fn dispatch(
    mut stream: MessageStream,
    shared: &SubscriptionShared,
    on_message: &MessageCallback,
) -> Option<ChannelError> {
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) if shared.is_active() => on_message(message),
            Ok(message) => {
                tracing::debug!(topic = %message.topic, "discarding message after unsubscribe");
                return None;
            }
            Err(error) => return Some(error),
        }
    }
    None
}
