//! Live feeds and the [`SyncCore`] facade.
//!
//! A live feed keeps one entity kind current in the store:
//!
//! ```text
//!   PollingScheduler ── every interval ──► FetchCollection ──► store.merge
//!          ▲
//!          └── force_refresh ◄── push message of a watched domain
//! ```
//!
//! Push messages are invalidation hints. Their payload is never written to
//! the store; only fetch results are.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::command::{
    CommandExecutor, CommandResult, FetchCollection, JsonTransport, PatchEntity,
};
use crate::config::SyncConfig;
use crate::domain::{Entity, EntityKey, EntityKind, EntityPatch};
use crate::fetch_key::{FetchKey, FetchParams};
use crate::optimistic::{MutationCoordinator, Refresher};
use crate::polling::{PollHandle, PollOutcome, PollingScheduler};
use crate::push::{ConnectionStatus, EventChannel, PushSubscriber, Subscription, TopicFilter};
use crate::session::SessionContext;
use crate::store::{MergeReport, ReconciliationStore};

// =============================================================================
// Live Feed Spec
// =============================================================================

/// What a live feed watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFeedSpec {
    /// Kind fetched and merged.
    pub kind: EntityKind,
    /// Query parameters of the collection fetch.
    pub params: FetchParams,
    /// Poll interval; `None` uses [`SyncConfig::poll_interval`].
    pub interval: Option<Duration>,
    /// Push domains that trigger a refetch.
    pub domains: Vec<String>,
    /// One push subscription is opened per scope.
    pub scopes: Vec<TopicFilter>,
}

impl LiveFeedSpec {
    /// Polls `kind` at the configured interval and listens to its own push
    /// domain. No push scope is opened until one is added.
    #[must_use]
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            params: FetchParams::new(),
            interval: None,
            domains: vec![kind.push_domain().to_string()],
            scopes: Vec::new(),
        }
    }

    /// Adds one query parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Also refetches on messages of `domain`.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        if !self.domains.contains(&domain) {
            self.domains.push(domain);
        }
        self
    }

    /// Opens a push subscription for `scope`.
    #[must_use]
    pub fn with_scope(mut self, scope: TopicFilter) -> Self {
        if !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
        self
    }

    /// Adds the signed-in user's targeted scope (when there is one) and the
    /// broadcast scope.
    #[must_use]
    pub fn with_default_scopes(self, session: &SessionContext) -> Self {
        let spec = match session.current_user() {
            Some(user) => self.with_scope(TopicFilter::Targeted(user.id)),
            None => self,
        };
        spec.with_scope(TopicFilter::Broadcast)
    }

    fn fetch_key(&self) -> FetchKey {
        FetchKey::new(self.kind.collection_path(), &self.params)
    }
}

// =============================================================================
// Feed Registry
// =============================================================================

struct FeedEntry {
    kind: EntityKind,
    poll: PollHandle,
}

/// Live feeds by id, plus what a one-shot refresh needs.
struct FeedRegistry {
    feeds: Mutex<HashMap<u64, FeedEntry>>,
    next_id: AtomicU64,
    store: ReconciliationStore,
    executor: Arc<CommandExecutor>,
    transport: Arc<dyn JsonTransport>,
}

impl FeedRegistry {
    fn register(&self, kind: EntityKind, poll: PollHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.feeds.lock().insert(id, FeedEntry { kind, poll });
        id
    }

    fn unregister(&self, id: u64) {
        self.feeds.lock().remove(&id);
    }

    fn count(&self, kind: EntityKind) -> usize {
        self.feeds
            .lock()
            .values()
            .filter(|entry| entry.kind == kind)
            .count()
    }
}

impl Refresher for FeedRegistry {
    fn refresh(&self, kind: EntityKind) {
        let polls: Vec<PollHandle> = self
            .feeds
            .lock()
            .values()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.poll.clone())
            .collect();

        if !polls.is_empty() {
            for poll in polls {
                let outcome = poll.force_refresh();
                tracing::debug!(%kind, fetch_key = %poll.key(), ?outcome, "forced refresh");
            }
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%kind, "no runtime for one-shot refresh, skipping");
            return;
        };
        let store = self.store.clone();
        let executor = Arc::clone(&self.executor);
        let call = FetchCollection::new(Arc::clone(&self.transport), kind);
        runtime.spawn(async move {
            if let Err(error) = fetch_and_merge(&executor, &call, FetchParams::new(), &store).await {
                tracing::warn!(%kind, error_kind = %error.kind, "one-shot refresh failed");
            }
        });
    }
}

/// Fetches a collection and merges it, stamped with the request start so a
/// late answer to an older request cannot overwrite a newer merge.
async fn fetch_and_merge(
    executor: &CommandExecutor,
    call: &FetchCollection,
    params: FetchParams,
    store: &ReconciliationStore,
) -> CommandResult<MergeReport> {
    let requested_at = Utc::now();
    let entities = executor.execute(call, params).await?;
    Ok(store.merge(call.kind(), entities, requested_at))
}

// =============================================================================
// Live Feed
// =============================================================================

/// Running poll schedule and push subscriptions of one [`LiveFeedSpec`].
///
/// Cancelling (or dropping) the feed stops both; results that arrive later
/// never reach the store.
pub struct LiveFeed {
    id: u64,
    kind: EntityKind,
    poll: PollHandle,
    subscriptions: Vec<Subscription>,
    registry: Weak<FeedRegistry>,
    active: AtomicBool,
}

impl LiveFeed {
    /// Kind this feed keeps current.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Key of the underlying collection fetch.
    #[must_use]
    pub fn fetch_key(&self) -> &FetchKey {
        self.poll.key()
    }

    /// Fetches now unless a fetch is already in flight.
    pub fn poll_now(&self) -> PollOutcome {
        self.poll.poll_now()
    }

    /// Status of every push subscription, in scope order.
    #[must_use]
    pub fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.subscriptions.iter().map(Subscription::status).collect()
    }

    /// Receivers following each subscription's status, in scope order.
    #[must_use]
    pub fn watch_statuses(&self) -> Vec<(TopicFilter, watch::Receiver<ConnectionStatus>)> {
        self.subscriptions
            .iter()
            .map(|subscription| (subscription.filter().clone(), subscription.watch_status()))
            .collect()
    }

    /// Returns `true` while some push subscription is reconnecting; the feed
    /// then relies on polling alone.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.subscriptions
            .iter()
            .any(|subscription| subscription.status().is_degraded())
    }

    /// Returns `true` until the feed is cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops polling and closes every subscription. Idempotent.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.poll.cancel();
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
        tracing::info!(kind = %self.kind, fetch_key = %self.poll.key(), "live feed cancelled");
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for LiveFeed {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LiveFeed")
            .field("kind", &self.kind)
            .field("fetch_key", self.poll.key())
            .field("subscriptions", &self.subscriptions.len())
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Sync Core
// =============================================================================

/// Wires the store, executor, scheduler, subscriber and coordinator.
pub struct SyncCore {
    config: SyncConfig,
    session: Arc<SessionContext>,
    store: ReconciliationStore,
    executor: Arc<CommandExecutor>,
    transport: Arc<dyn JsonTransport>,
    scheduler: PollingScheduler,
    subscriber: PushSubscriber,
    feeds: Arc<FeedRegistry>,
    coordinator: MutationCoordinator,
}

impl fmt::Debug for SyncCore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncCore")
            .field("base_url", &self.config.base_url)
            .field("store", &self.store)
            .field("live_feeds", &self.feeds.feeds.lock().len())
            .finish_non_exhaustive()
    }
}

impl SyncCore {
    /// Creates a core talking HTTP to `config.base_url` and listening to
    /// server-sent events at [`SyncConfig::events_url`].
    #[cfg(feature = "http")]
    #[must_use]
    pub fn new(config: SyncConfig, session: Arc<SessionContext>) -> Self {
        let client = reqwest::Client::new();
        let transport = Arc::new(crate::command::HttpTransport::with_client(
            client.clone(),
            config.base_url.clone(),
            Arc::clone(&session),
        ));
        let channel = Arc::new(crate::push::SseChannel::with_client(
            client,
            config.events_url(),
            Arc::clone(&session),
        ));
        Self::with_parts(config, session, transport, channel)
    }

    /// Creates a core over the given transport and event channel.
    #[must_use]
    pub fn with_parts(
        config: SyncConfig,
        session: Arc<SessionContext>,
        transport: Arc<dyn JsonTransport>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        let store = ReconciliationStore::new();
        let executor = Arc::new(CommandExecutor::with_timeout(
            Arc::clone(&session),
            config.request_timeout,
        ));
        let feeds = Arc::new(FeedRegistry {
            feeds: Mutex::default(),
            next_id: AtomicU64::new(1),
            store: store.clone(),
            executor: Arc::clone(&executor),
            transport: Arc::clone(&transport),
        });
        let coordinator = MutationCoordinator::new(
            store.clone(),
            Arc::clone(&executor),
            Arc::clone(&feeds) as Arc<dyn Refresher>,
        );
        let subscriber = PushSubscriber::new(channel, config.reconnect);

        Self {
            config,
            session,
            store,
            executor,
            transport,
            scheduler: PollingScheduler::default(),
            subscriber,
            feeds,
            coordinator,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Session shared by every request.
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Store every feed merges into.
    #[must_use]
    pub const fn store(&self) -> &ReconciliationStore {
        &self.store
    }

    /// Executor of every remote call.
    #[must_use]
    pub const fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    /// Coordinator of optimistic mutations.
    #[must_use]
    pub const fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    /// Number of live feeds of `kind`.
    #[must_use]
    pub fn live_feed_count(&self, kind: EntityKind) -> usize {
        self.feeds.count(kind)
    }

    /// Starts a live feed.
    ///
    /// The first fetch starts immediately. Feeds of the same kind share the
    /// store collection, so the latest non-stale merge of any of them wins.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn watch(&self, spec: LiveFeedSpec) -> LiveFeed {
        let kind = spec.kind;
        let interval = spec.interval.unwrap_or(self.config.poll_interval);
        let call = Arc::new(FetchCollection::new(Arc::clone(&self.transport), kind));

        let fetch = {
            let executor = Arc::clone(&self.executor);
            let params = spec.params.clone();
            move || {
                let executor = Arc::clone(&executor);
                let call = Arc::clone(&call);
                let params = params.clone();
                async move {
                    let requested_at = Utc::now();
                    executor
                        .execute(&*call, params)
                        .await
                        .map(|entities| (requested_at, entities))
                }
            }
        };
        let on_result = {
            let store = self.store.clone();
            move |(requested_at, entities): (DateTime<Utc>, Vec<Entity>)| {
                store.merge(kind, entities, requested_at);
            }
        };
        let poll = self
            .scheduler
            .start_polling(spec.fetch_key(), interval, fetch, on_result);

        let domains: Arc<[String]> = spec.domains.into();
        let subscriptions = spec
            .scopes
            .into_iter()
            .map(|scope| {
                let poll = poll.clone();
                let domains = Arc::clone(&domains);
                self.subscriber.subscribe(scope, move |message| {
                    if domains.iter().any(|domain| message.matches_domain(domain)) {
                        let outcome = poll.force_refresh();
                        tracing::debug!(
                            topic = %message.topic,
                            fetch_key = %poll.key(),
                            ?outcome,
                            "push hint, refetching"
                        );
                    }
                })
            })
            .collect();

        let id = self.feeds.register(kind, poll.clone());
        tracing::info!(%kind, fetch_key = %poll.key(), "live feed started");
        LiveFeed {
            id,
            kind,
            poll,
            subscriptions,
            registry: Arc::downgrade(&self.feeds),
            active: AtomicBool::new(true),
        }
    }

    /// Re-fetches `kind`: forces every live feed of the kind, or runs one
    /// fetch and merge when none is live.
    pub fn refresh(&self, kind: EntityKind) {
        self.feeds.refresh(kind);
    }

    /// Fetches `kind` with `params` once and merges the result.
    ///
    /// # Errors
    ///
    /// The fetch's [`CommandError`](crate::command::CommandError); the store
    /// is untouched then.
    pub async fn fetch(&self, kind: EntityKind, params: FetchParams) -> CommandResult<MergeReport> {
        let call = FetchCollection::new(Arc::clone(&self.transport), kind);
        fetch_and_merge(&self.executor, &call, params, &self.store).await
    }

    /// Optimistically patches `key`, then sends the change.
    ///
    /// The change is visible in the store before the request is sent. On
    /// failure it is rolled back and the kind is refreshed.
    ///
    /// # Errors
    ///
    /// The command's error, or a `validation` error when the patch cannot
    /// be applied to the stored entity (nothing is sent then).
    pub async fn update(&self, key: &EntityKey, patch: EntityPatch) -> CommandResult<Option<Entity>> {
        let call = PatchEntity::new(Arc::clone(&self.transport), key.kind);
        self.coordinator
            .mutate(key, patch.clone(), &call, (key.id.clone(), patch))
            .await
    }
}
