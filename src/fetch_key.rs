//! Request de-duplication.
//!
//! A [`FetchKey`] names "the same logical request": the endpoint plus its
//! parameters in canonical order. The [`InFlightRegistry`] holds at most one
//! in-flight request per key; ownership of a slot is an [`InFlightGuard`],
//! released when the guard drops (including when the owning task is aborted).

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Query parameters of a fetch, kept sorted by name.
pub type FetchParams = BTreeMap<String, String>;

// =============================================================================
// Fetch Key
// =============================================================================

/// Canonical identity of a request: `endpoint?name=value&...`.
///
/// Names and values are percent-escaped, so distinct parameter maps never
/// produce the same key (`{a: "1&b=2"}` is `a=1%26b%3D2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchKey(String);

impl FetchKey {
    /// Derives the key of `endpoint` called with `params`.
    #[must_use]
    pub fn new(endpoint: &str, params: &FetchParams) -> Self {
        let mut key = String::with_capacity(endpoint.len());
        escape_into(&mut key, endpoint, |byte| byte == b'/');
        for (index, (name, value)) in params.iter().enumerate() {
            key.push(if index == 0 { '?' } else { '&' });
            escape_into(&mut key, name, |_| false);
            key.push('=');
            escape_into(&mut key, value, |_| false);
        }
        Self(key)
    }

    /// Key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Appends `text`, percent-escaping every byte outside the URL unreserved set
/// unless `keep` allows it.
fn escape_into(out: &mut String, text: &str, keep: impl Fn(u8) -> bool) {
    for byte in text.bytes() {
        let unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~');
        if unreserved || keep(byte) {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

// =============================================================================
// In-Flight Registry
// =============================================================================

#[derive(Debug, Default)]
struct Slots {
    keys: Mutex<HashSet<FetchKey>>,
    released: Notify,
}

/// Shared set of keys with a request in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    slots: Arc<Slots>,
}

impl InFlightRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`; `None` when a request for it is already in flight.
    #[must_use]
    pub fn try_acquire(&self, key: &FetchKey) -> Option<InFlightGuard> {
        let inserted = self.slots.keys.lock().insert(key.clone());
        inserted.then(|| InFlightGuard {
            slots: Arc::clone(&self.slots),
            key: key.clone(),
        })
    }

    /// Waits until `key` is free, then claims it.
    pub async fn acquire(&self, key: &FetchKey) -> InFlightGuard {
        loop {
            let released = self.slots.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if let Some(guard) = self.try_acquire(key) {
                return guard;
            }
            released.await;
        }
    }

    /// Returns `true` while a request for `key` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, key: &FetchKey) -> bool {
        self.slots.keys.lock().contains(key)
    }

    /// Number of keys in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.keys.lock().len()
    }

    /// Returns `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.keys.lock().is_empty()
    }
}

/// Ownership of one in-flight slot.
#[derive(Debug)]
pub struct InFlightGuard {
    slots: Arc<Slots>,
    key: FetchKey,
}

impl InFlightGuard {
    /// Key this guard holds.
    #[must_use]
    pub const fn key(&self) -> &FetchKey {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slots.keys.lock().remove(&self.key);
        self.slots.released.notify_waiters();
    }
}
