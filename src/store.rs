//! Reconciliation store.
//!
//! The canonical entity cache. Authoritative data enters only through
//! [`ReconciliationStore::merge`], which replaces a kind's collection
//! wholesale; speculative data enters only through the crate-internal write
//! path used by the [`MutationCoordinator`](crate::optimistic::MutationCoordinator).
//!
//! Keys with a pending optimistic operation are *pinned*: merges leave them
//! untouched until the operation resolves. Observers are always invoked after
//! the store's lock is released, so a callback may read the store again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::{Entity, EntityId, EntityKey, EntityKind};

/// Callback receiving a kind's full collection, ordered by id.
pub type ObserverFn = dyn Fn(&[Entity]) + Send + Sync;

// =============================================================================
// Merge Report
// =============================================================================

/// What a [`ReconciliationStore::merge`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entities written.
    pub applied: usize,
    /// Entities left alone because their key has a pending operation.
    pub skipped_pending: usize,
    /// Entities of the kind dropped because the batch no longer contains them.
    pub removed: usize,
    /// Entities of another kind, ignored.
    pub ignored: usize,
    /// `true` when the whole batch was older than the last merge of the kind.
    pub stale: bool,
}

// =============================================================================
// Store State
// =============================================================================

#[derive(Debug, Clone)]
struct Slot {
    entity: Entity,
    last_authoritative: Option<DateTime<Utc>>,
}

struct ObserverEntry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Arc<ObserverFn>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<EntityKind, BTreeMap<EntityId, Slot>>,
    pins: HashMap<EntityKey, usize>,
    last_merge: HashMap<EntityKind, DateTime<Utc>>,
    observers: HashMap<EntityKind, Vec<ObserverEntry>>,
    next_observer: u64,
}

impl StoreState {
    fn is_pinned(&self, key: &EntityKey) -> bool {
        self.pins.contains_key(key)
    }

    /// Snapshot of `kind` plus the observers to notify with it.
    fn notification(&self, kind: EntityKind) -> Notification {
        let collection = self
            .collections
            .get(&kind)
            .map(|slots| slots.values().map(|slot| slot.entity.clone()).collect())
            .unwrap_or_default();
        let observers = self
            .observers
            .get(&kind)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| (Arc::clone(&entry.active), Arc::clone(&entry.callback)))
                    .collect()
            })
            .unwrap_or_default();
        Notification {
            collection,
            observers,
        }
    }
}

/// Deferred observer invocation, dispatched with no lock held.
#[must_use]
pub(crate) struct Notification {
    collection: Vec<Entity>,
    observers: Vec<(Arc<AtomicBool>, Arc<ObserverFn>)>,
}

impl Notification {
    pub(crate) fn dispatch(self) {
        for (active, callback) in self.observers {
            if active.load(Ordering::SeqCst) {
                callback(&self.collection);
            }
        }
    }
}

// =============================================================================
// Reconciliation Store
// =============================================================================

/// Shared handle to the entity cache. Clones share state.
#[derive(Clone, Default)]
pub struct ReconciliationStore {
    state: Arc<Mutex<StoreState>>,
}

impl fmt::Debug for ReconciliationStore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        formatter
            .debug_struct("ReconciliationStore")
            .field(
                "entities",
                &state.collections.values().map(BTreeMap::len).sum::<usize>(),
            )
            .field("pinned", &state.pins.len())
            .finish_non_exhaustive()
    }
}

impl ReconciliationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the collection of `kind` with `entities`.
    ///
    /// - pinned keys are skipped, and kept even when absent from the batch
    /// - other keys in the batch are written and stamped with `received_at`
    /// - other keys of the kind missing from the batch are removed
    /// - a batch older than the last merge of the kind is dropped as stale
    /// - duplicate ids: the last one wins
    ///
    /// Observers of `kind` are notified after every merge that is not stale.
    pub fn merge(
        &self,
        kind: EntityKind,
        entities: Vec<Entity>,
        received_at: DateTime<Utc>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut state = self.state.lock();

        if state
            .last_merge
            .get(&kind)
            .is_some_and(|last| received_at < *last)
        {
            tracing::debug!(%kind, %received_at, "dropping stale merge");
            report.stale = true;
            return report;
        }
        state.last_merge.insert(kind, received_at);

        let mut incoming = BTreeMap::new();
        for entity in entities {
            if entity.kind() == kind {
                incoming.insert(entity.id().clone(), entity);
            } else {
                tracing::warn!(%kind, key = %entity.key(), "ignoring entity of another kind in merge");
                report.ignored += 1;
            }
        }

        let StoreState {
            collections, pins, ..
        } = &mut *state;
        let collection = collections.entry(kind).or_default();
        let before = collection.len();
        collection.retain(|id, _| {
            incoming.contains_key(id) || pins.contains_key(&EntityKey::new(kind, id.clone()))
        });
        report.removed = before - collection.len();

        for (id, entity) in incoming {
            if pins.contains_key(&EntityKey::new(kind, id.clone())) {
                report.skipped_pending += 1;
                continue;
            }
            collection.insert(
                id,
                Slot {
                    entity,
                    last_authoritative: Some(received_at),
                },
            );
            report.applied += 1;
        }

        let notification = state.notification(kind);
        drop(state);

        tracing::debug!(
            %kind,
            applied = report.applied,
            skipped_pending = report.skipped_pending,
            removed = report.removed,
            "merged authoritative collection"
        );
        notification.dispatch();
        report
    }

    /// Entity stored under `key`.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.state
            .lock()
            .collections
            .get(&key.kind)
            .and_then(|slots| slots.get(&key.id))
            .map(|slot| slot.entity.clone())
    }

    /// Every entity of `kind`, ordered by id.
    #[must_use]
    pub fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.state
            .lock()
            .collections
            .get(&kind)
            .map(|slots| slots.values().map(|slot| slot.entity.clone()).collect())
            .unwrap_or_default()
    }

    /// When `key` was last written by a merge.
    #[must_use]
    pub fn last_authoritative_update(&self, key: &EntityKey) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .collections
            .get(&key.kind)
            .and_then(|slots| slots.get(&key.id))
            .and_then(|slot| slot.last_authoritative)
    }

    /// Returns `true` while `key` has a pending optimistic operation.
    #[must_use]
    pub fn is_pending(&self, key: &EntityKey) -> bool {
        self.state.lock().is_pinned(key)
    }

    /// Registers `callback` for every change of `kind`.
    ///
    /// The callback is not invoked for the current contents; read them with
    /// [`entities`](Self::entities) if needed.
    pub fn observe<F>(&self, kind: EntityKind, callback: F) -> Observation
    where
        F: Fn(&[Entity]) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let mut state = self.state.lock();
        state.next_observer += 1;
        let id = state.next_observer;
        state.observers.entry(kind).or_default().push(ObserverEntry {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });
        Observation {
            state: Arc::downgrade(&self.state),
            kind,
            id,
            active,
        }
    }

    // =========================================================================
    // Optimistic Write Path
    // =========================================================================

    /// Replaces the entity under `key` with `change(current)` and pins the key.
    ///
    /// Returns the previous value with the pending observer notification, or
    /// `Ok(None)` when the store does not hold `key` (nothing is written).
    pub(crate) fn apply_local<E>(
        &self,
        key: &EntityKey,
        change: impl FnOnce(&Entity) -> Result<Entity, E>,
    ) -> Result<Option<(Entity, Notification)>, E> {
        let mut state = self.state.lock();
        let Some(slot) = state
            .collections
            .get_mut(&key.kind)
            .and_then(|slots| slots.get_mut(&key.id))
        else {
            return Ok(None);
        };
        let next = change(&slot.entity)?;
        let previous = std::mem::replace(&mut slot.entity, next);
        *state.pins.entry(key.clone()).or_default() += 1;
        Ok(Some((previous, state.notification(key.kind))))
    }

    /// Writes `snapshot` back and releases one pin of its key.
    pub(crate) fn restore_local(&self, snapshot: Entity) -> Notification {
        let key = snapshot.key();
        let mut state = self.state.lock();
        let collection = state.collections.entry(key.kind).or_default();
        match collection.get_mut(&key.id) {
            Some(slot) => slot.entity = snapshot,
            None => {
                collection.insert(
                    key.id.clone(),
                    Slot {
                        entity: snapshot,
                        last_authoritative: None,
                    },
                );
            }
        }
        unpin(&mut state.pins, &key);
        state.notification(key.kind)
    }

    /// Releases one pin of `key` without touching its value.
    pub(crate) fn release(&self, key: &EntityKey) {
        unpin(&mut self.state.lock().pins, key);
    }
}

fn unpin(pins: &mut HashMap<EntityKey, usize>, key: &EntityKey) {
    if let Some(count) = pins.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            pins.remove(key);
        }
    }
}

// =============================================================================
// Observation
// =============================================================================

/// Registration of one observer. Unobserves when dropped.
pub struct Observation {
    state: Weak<Mutex<StoreState>>,
    kind: EntityKind,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Observation {
    /// Kind observed.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Stops further callbacks, including ones already being dispatched.
    /// Idempotent.
    pub fn unobserve(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            if let Some(entries) = state.observers.get_mut(&self.kind) {
                entries.retain(|entry| entry.id != self.id);
            }
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.unobserve();
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Observation")
            .field("kind", &self.kind)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityPatch, EntityPayload, Ticket, WorkStatus};
    use chrono::{Duration, TimeZone};
    use rstest::{fixture, rstest};

    fn ticket(id: &str, status: WorkStatus) -> Entity {
        Entity::new(
            id,
            EntityPayload::Ticket(Ticket {
                title: format!("Ticket {id}"),
                description: None,
                status,
                priority: None,
                assignee: None,
                project: None,
                due_date: None,
            }),
        )
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::new(EntityKind::Ticket, id)
    }

    #[fixture]
    fn store() -> ReconciliationStore {
        let store = ReconciliationStore::new();
        store.merge(
            EntityKind::Ticket,
            vec![ticket("t-1", WorkStatus::Open), ticket("t-2", WorkStatus::Open)],
            at(0),
        );
        store
    }

    #[rstest]
    fn test_merge_replaces_collection_wholesale(store: ReconciliationStore) {
        let report = store.merge(
            EntityKind::Ticket,
            vec![ticket("t-2", WorkStatus::Done), ticket("t-3", WorkStatus::Open)],
            at(10),
        );

        assert_eq!(report.applied, 2);
        assert_eq!(report.removed, 1);
        assert!(store.get(&key("t-1")).is_none());
        assert_eq!(store.get(&key("t-2")).unwrap().status(), Some(WorkStatus::Done));
        assert_eq!(store.last_authoritative_update(&key("t-3")), Some(at(10)));
    }

    fn move_to(store: &ReconciliationStore, id: &str, status: WorkStatus) -> Entity {
        let (previous, notification) = store
            .apply_local(&key(id), |entity| EntityPatch::new().with_status(status).apply(entity))
            .unwrap()
            .unwrap();
        notification.dispatch();
        previous
    }

    #[rstest]
    fn test_pinned_key_is_skipped_and_kept(store: ReconciliationStore) {
        move_to(&store, "t-1", WorkStatus::InProgress);

        let report = store.merge(
            EntityKind::Ticket,
            vec![ticket("t-1", WorkStatus::Open), ticket("t-2", WorkStatus::Review)],
            at(10),
        );
        assert_eq!(report.skipped_pending, 1);
        assert_eq!(store.get(&key("t-1")).unwrap().status(), Some(WorkStatus::InProgress));
        assert_eq!(store.get(&key("t-2")).unwrap().status(), Some(WorkStatus::Review));

        let report = store.merge(EntityKind::Ticket, Vec::new(), at(20));
        assert_eq!(report.removed, 1);
        assert!(store.get(&key("t-1")).is_some());
    }

    #[rstest]
    fn test_older_merge_is_dropped_as_stale(store: ReconciliationStore) {
        store.merge(EntityKind::Ticket, vec![ticket("t-1", WorkStatus::Done)], at(10));

        let report = store.merge(EntityKind::Ticket, vec![ticket("t-9", WorkStatus::Open)], at(5));

        assert!(report.stale);
        assert_eq!(store.entities(EntityKind::Ticket).len(), 1);
        assert_eq!(store.get(&key("t-1")).unwrap().status(), Some(WorkStatus::Done));
    }

    #[rstest]
    fn test_last_duplicate_wins_and_foreign_kinds_are_ignored(store: ReconciliationStore) {
        let foreign = Entity::new(
            "e-1",
            EntityPayload::CalendarEvent(crate::domain::CalendarEvent {
                title: "Standup".to_string(),
                description: None,
                starts_at: at(0),
                ends_at: None,
                owner: None,
                attendees: Vec::new(),
            }),
        );

        let report = store.merge(
            EntityKind::Ticket,
            vec![
                ticket("t-1", WorkStatus::Review),
                foreign,
                ticket("t-1", WorkStatus::Closed),
            ],
            at(10),
        );

        assert_eq!(report.ignored, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(store.get(&key("t-1")).unwrap().status(), Some(WorkStatus::Closed));
        assert!(store.entities(EntityKind::CalendarEvent).is_empty());
    }

    #[rstest]
    fn test_observers_receive_ordered_collection(store: ReconciliationStore) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _observation = store.observe(EntityKind::Ticket, move |entities| {
            sink.lock().push(
                entities
                    .iter()
                    .map(|entity| entity.id().to_string())
                    .collect::<Vec<_>>(),
            );
        });

        store.merge(
            EntityKind::Ticket,
            vec![ticket("t-3", WorkStatus::Open), ticket("t-1", WorkStatus::Open)],
            at(10),
        );
        store.merge(EntityKind::Bug, Vec::new(), at(10));

        assert_eq!(*seen.lock(), [vec!["t-1".to_string(), "t-3".to_string()]]);
    }

    #[rstest]
    fn test_unobserve_is_idempotent(store: ReconciliationStore) {
        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        let observation = store.observe(EntityKind::Ticket, move |_| *sink.lock() += 1);

        observation.unobserve();
        observation.unobserve();
        store.merge(EntityKind::Ticket, Vec::new(), at(10));
        drop(observation);

        assert_eq!(*calls.lock(), 0);
    }

    #[rstest]
    fn test_observer_may_read_the_store(store: ReconciliationStore) {
        let reader = store.clone();
        let counted = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&counted);
        let _observation = store.observe(EntityKind::Ticket, move |_| {
            *sink.lock() = reader.entities(EntityKind::Ticket).len();
        });

        store.merge(EntityKind::Ticket, vec![ticket("t-5", WorkStatus::Open)], at(10));

        assert_eq!(*counted.lock(), 1);
    }

    #[rstest]
    fn test_restore_local_unpins(store: ReconciliationStore) {
        let previous = move_to(&store, "t-2", WorkStatus::Done);
        assert!(store.is_pending(&key("t-2")));

        store.restore_local(previous).dispatch();

        assert!(!store.is_pending(&key("t-2")));
        assert_eq!(store.get(&key("t-2")).unwrap().status(), Some(WorkStatus::Open));
    }

    #[rstest]
    fn test_apply_local_on_unknown_key_writes_nothing(store: ReconciliationStore) {
        let result = store.apply_local(&key("t-404"), |entity| Ok::<_, ()>(entity.clone()));

        assert!(matches!(result, Ok(None)));
        assert!(!store.is_pending(&key("t-404")));
    }
}
