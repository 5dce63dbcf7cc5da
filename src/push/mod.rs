//! Push subscriber.
//!
//! A subscription keeps one server-to-client channel open for a
//! [`TopicFilter`] and hands every inbound [`PushMessage`] to its callback.
//! Lost connections are retried forever with exponential backoff:
//!
//! ```text
//! connect ──ok──► Connected ──error / close──┐
//!    ▲                                       ▼
//!    └──── sleep(delay) ◄── Reconnecting { attempt, delay }   delay: 2s, 4s, 8s, ... 30s
//! ```
//!
//! A successful connect resets the delay to its initial value. Messages are
//! invalidation hints only; consumers re-fetch instead of applying `data`.

mod backoff;
mod message;
#[cfg(feature = "http")]
mod sse;
mod subscriber;

pub use backoff::{Backoff, BackoffPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
pub use message::{PushMessage, TopicFilter};
#[cfg(feature = "http")]
pub use sse::{SseChannel, SseDecoder, SseEvent};
pub use subscriber::{
    ChannelError, ConnectionStatus, EventChannel, MessageStream, PushSubscriber, Subscription,
};
