//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use boardsync::command::{JsonTransport, Method, RemoteError};
use boardsync::prelude::*;
use boardsync::push::{ChannelError, EventChannel, MessageStream};
use boardsync::session::{Credential, CurrentUser};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

// =============================================================================
// Backend
// =============================================================================

/// Scripted REST backend.
///
/// `GET` answers with the current collection after `latency`; queued
/// `PATCH` outcomes are consumed in order, defaulting to an empty success.
#[derive(Default)]
pub struct FakeBackend {
    pub gets: AtomicUsize,
    pub patches: Mutex<Vec<(String, Value)>>,
    collection: Mutex<Value>,
    latency: Mutex<Duration>,
    get_failure: Mutex<Option<RemoteError>>,
    patch_outcomes: Mutex<VecDeque<Result<Value, RemoteError>>>,
}

impl FakeBackend {
    pub fn with_tickets(tickets: Value) -> Arc<Self> {
        let backend = Self::default();
        *backend.collection.lock() = tickets;
        Arc::new(backend)
    }

    pub fn set_tickets(&self, tickets: Value) {
        *self.collection.lock() = tickets;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail_gets(&self, error: RemoteError) {
        *self.get_failure.lock() = Some(error);
    }

    pub fn push_patch_outcome(&self, outcome: Result<Value, RemoteError>) {
        self.patch_outcomes.lock().push_back(outcome);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl JsonTransport for FakeBackend {
    fn get_json(
        &self,
        _path: &str,
        _query: &FetchParams,
    ) -> BoxFuture<'static, Result<Value, RemoteError>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let outcome = match self.get_failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(json!({ "tickets": self.collection.lock().clone() })),
        };
        let latency = *self.latency.lock();
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            outcome
        }
        .boxed()
    }

    fn send_json(
        &self,
        _method: Method,
        path: &str,
        body: Value,
    ) -> BoxFuture<'static, Result<Value, RemoteError>> {
        self.patches.lock().push((path.to_string(), body));
        let outcome = self
            .patch_outcomes
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Null));
        let latency = *self.latency.lock();
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            outcome
        }
        .boxed()
    }
}

// =============================================================================
// Event Channel
// =============================================================================

type Sender = mpsc::UnboundedSender<Result<PushMessage, ChannelError>>;

/// Event channel whose connections are opened or refused on demand.
#[derive(Default)]
pub struct FakeChannel {
    refusals: Mutex<VecDeque<ChannelError>>,
    open: Mutex<Vec<(TopicFilter, Sender)>>,
    pub attempts: Mutex<Vec<tokio::time::Instant>>,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        let mut refusals = self.refusals.lock();
        for _ in 0..count {
            refusals.push_back(ChannelError::Connect("connection refused".to_string()));
        }
    }

    /// Sends `topic` to every open connection.
    pub fn publish(&self, topic: &str) {
        self.open
            .lock()
            .retain(|(_, sender)| sender.send(Ok(PushMessage::new(topic, Value::Null))).is_ok());
    }

    /// Fails every open connection.
    pub fn drop_connections(&self) {
        for (_, sender) in self.open.lock().drain(..) {
            let _ = sender.send(Err(ChannelError::Dropped("reset by peer".to_string())));
        }
    }

    pub fn open_filters(&self) -> Vec<TopicFilter> {
        self.open
            .lock()
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Whole seconds between consecutive connection attempts.
    pub fn attempt_gaps(&self) -> Vec<u64> {
        self.attempts
            .lock()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }
}

impl EventChannel for FakeChannel {
    fn connect(
        &self,
        filter: &TopicFilter,
    ) -> BoxFuture<'static, Result<MessageStream, ChannelError>> {
        self.attempts.lock().push(tokio::time::Instant::now());
        if let Some(error) = self.refusals.lock().pop_front() {
            return futures::future::ready(Err(error)).boxed();
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.open.lock().push((filter.clone(), sender));
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();
        futures::future::ready(Ok(stream)).boxed()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn signed_in_session() -> Arc<SessionContext> {
    let credential = Credential::new("token-1", CurrentUser::new("u-1"));
    Arc::new(SessionContext::init(Arc::new(MemoryCredentialStore::new(
        Some(credential),
    ))))
}

pub fn ticket(id: &str, status: &str) -> Value {
    json!({ "_id": id, "title": format!("Ticket {id}"), "status": status })
}

pub fn ticket_key(id: &str) -> EntityKey {
    EntityKey::new(EntityKind::Ticket, id)
}

pub fn status_of(store: &ReconciliationStore, id: &str) -> Option<WorkStatus> {
    store.get(&ticket_key(id)).and_then(|entity| entity.status())
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub channel: Arc<FakeChannel>,
    pub session: Arc<SessionContext>,
    pub core: SyncCore,
}

pub fn harness(tickets: Value) -> Harness {
    let backend = FakeBackend::with_tickets(tickets);
    let channel = FakeChannel::new();
    let session = signed_in_session();
    let core = SyncCore::with_parts(
        SyncConfig::default(),
        Arc::clone(&session),
        Arc::clone(&backend) as Arc<dyn JsonTransport>,
        Arc::clone(&channel) as Arc<dyn EventChannel>,
    );
    Harness {
        backend,
        channel,
        session,
        core,
    }
}

/// Lets spawned tasks run without reaching the next poll or reconnect.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
