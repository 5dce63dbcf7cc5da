//! Optimistic mutation coordinator.
//!
//! A mutation is applied to the store immediately, then sent to the server:
//!
//! ```text
//! apply_optimistic ──► store shows the change, key pinned, operation pending
//!        │
//!   CommandExecutor::execute
//!        ├── ok ──► confirm:  committed, pin released, next merge wins
//!        └── err ─► rollback: rolled_back, snapshot restored, forced refresh
//! ```
//!
//! Operations on one key form a stack. The second operation's snapshot is the
//! first one's result, and rolling an operation back first rolls back every
//! later operation on the same key, newest first.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::command::{CommandError, CommandExecutor, CommandResult, ErrorKind, RemoteCall};
use crate::domain::{Entity, EntityKey, EntityKind, EntityPatch};
use crate::error::SyncError;
use crate::store::ReconciliationStore;

// =============================================================================
// Operation Identity and Status
// =============================================================================

/// Coordinator-wide operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    /// Raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "op-{}", self.0)
    }
}

/// Lifecycle of an operation: `Pending` moves once to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    /// Applied locally, awaiting the server.
    Pending,
    /// Accepted by the server.
    Committed,
    /// Reverted locally.
    RolledBack,
}

impl OperationStatus {
    /// Returns `true` for `Committed` and `RolledBack`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        })
    }
}

type SharedStatus = Arc<Mutex<OperationStatus>>;

/// Caller's reference to an operation. Its status stays readable after the
/// operation has been resolved and discarded by the coordinator.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    key: EntityKey,
    sequence: u64,
    status: SharedStatus,
}

impl OperationHandle {
    /// Operation identifier.
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    /// Target entity.
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Local sequence number within the key.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        *self.status.lock()
    }
}

/// A speculative change awaiting the server.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    id: OperationId,
    key: EntityKey,
    previous: Entity,
    change: EntityPatch,
    sequence: u64,
    status: SharedStatus,
}

impl PendingOperation {
    /// Operation identifier.
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    /// Target entity.
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Store value before the change was applied.
    #[must_use]
    pub const fn previous_snapshot(&self) -> &Entity {
        &self.previous
    }

    /// Change applied.
    #[must_use]
    pub const fn intended_change(&self) -> &EntityPatch {
        &self.change
    }

    /// Local sequence number within the key.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        *self.status.lock()
    }
}

// =============================================================================
// Refresher
// =============================================================================

/// Forces an authoritative re-fetch of a kind after a rollback.
pub trait Refresher: Send + Sync {
    /// Re-fetches `kind` as soon as possible.
    fn refresh(&self, kind: EntityKind);
}

impl<F> Refresher for F
where
    F: Fn(EntityKind) + Send + Sync,
{
    fn refresh(&self, kind: EntityKind) {
        self(kind);
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Default)]
struct CoordinatorState {
    next_id: u64,
    sequences: HashMap<EntityKey, u64>,
    stacks: HashMap<EntityKey, SmallVec<[PendingOperation; 2]>>,
}

/// Applies, confirms and rolls back optimistic operations.
pub struct MutationCoordinator {
    store: ReconciliationStore,
    executor: Arc<CommandExecutor>,
    refresher: Arc<dyn Refresher>,
    state: Mutex<CoordinatorState>,
}

impl fmt::Debug for MutationCoordinator {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MutationCoordinator")
            .field("pending", &self.state.lock().stacks.len())
            .finish_non_exhaustive()
    }
}

impl MutationCoordinator {
    /// Creates a coordinator writing to `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Store receiving speculative changes.
    /// * `executor` - Executor used by [`mutate`](Self::mutate).
    /// * `refresher` - Called with the entity kind after every rollback.
    #[must_use]
    pub fn new(
        store: ReconciliationStore,
        executor: Arc<CommandExecutor>,
        refresher: Arc<dyn Refresher>,
    ) -> Self {
        Self {
            store,
            executor,
            refresher,
            state: Mutex::default(),
        }
    }

    /// Applies `change` to the stored entity and registers it as pending.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownEntity`] when the store does not hold `key`.
    /// - Any error of [`EntityPatch::apply`]; nothing is written then.
    pub fn apply_optimistic(
        &self,
        key: &EntityKey,
        change: EntityPatch,
    ) -> Result<OperationHandle, SyncError> {
        let mut state = self.state.lock();
        let Some((previous, notification)) =
            self.store.apply_local(key, |current| change.apply(current))?
        else {
            return Err(SyncError::UnknownEntity(key.clone()));
        };

        state.next_id += 1;
        let id = OperationId(state.next_id);
        let sequence = {
            let counter = state.sequences.entry(key.clone()).or_default();
            *counter += 1;
            *counter
        };
        let status = Arc::new(Mutex::new(OperationStatus::Pending));
        state
            .stacks
            .entry(key.clone())
            .or_default()
            .push(PendingOperation {
                id,
                key: key.clone(),
                previous,
                change,
                sequence,
                status: Arc::clone(&status),
            });
        drop(state);

        tracing::debug!(%key, operation = %id, sequence, "optimistic change applied");
        notification.dispatch();
        Ok(OperationHandle {
            id,
            key: key.clone(),
            sequence,
            status,
        })
    }

    /// Marks the operation committed and releases its pin.
    ///
    /// # Errors
    ///
    /// [`SyncError::OperationResolved`] when the operation already reached a
    /// terminal state, [`SyncError::UnknownOperation`] when it never belonged
    /// to this coordinator.
    pub fn confirm(&self, handle: &OperationHandle) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        let position = Self::locate(&state, handle)?;
        let stack = state
            .stacks
            .get_mut(&handle.key)
            .ok_or_else(|| SyncError::UnknownOperation(handle.id))?;
        let operation = stack.remove(position);
        if stack.is_empty() {
            state.stacks.remove(&handle.key);
        }
        *operation.status.lock() = OperationStatus::Committed;
        self.store.release(&handle.key);
        drop(state);

        tracing::debug!(key = %handle.key, operation = %handle.id, "optimistic change committed");
        Ok(())
    }

    /// Restores the operation's snapshot, rolling back every later operation
    /// on the same key first, then forces a refresh of the kind.
    ///
    /// # Errors
    ///
    /// Same as [`confirm`](Self::confirm).
    pub fn rollback(&self, handle: &OperationHandle) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        let position = Self::locate(&state, handle)?;
        let stack = state
            .stacks
            .get_mut(&handle.key)
            .ok_or_else(|| SyncError::UnknownOperation(handle.id))?;
        let undone: SmallVec<[PendingOperation; 2]> = stack.drain(position..).rev().collect();
        if stack.is_empty() {
            state.stacks.remove(&handle.key);
        }
        let mut last = None;
        for operation in &undone {
            *operation.status.lock() = OperationStatus::RolledBack;
            last = Some(self.store.restore_local(operation.previous.clone()));
        }
        drop(state);

        tracing::info!(
            key = %handle.key,
            operation = %handle.id,
            cascaded = undone.len() - 1,
            "optimistic change rolled back"
        );
        if let Some(notification) = last {
            notification.dispatch();
        }
        self.refresher.refresh(handle.key.kind);
        Ok(())
    }

    /// Runs the full optimistic flow: apply, execute `call`, then confirm or
    /// roll back.
    ///
    /// When the call succeeds after a cascade already rolled the operation
    /// back, the kind is refreshed so the committed value comes back from the
    /// server.
    ///
    /// # Errors
    ///
    /// The command's error after the rollback, or a `validation` error when
    /// the change cannot be applied locally (nothing is sent then).
    pub async fn mutate<C>(
        &self,
        key: &EntityKey,
        change: EntityPatch,
        call: &C,
        args: C::Args,
    ) -> CommandResult<C::Output>
    where
        C: RemoteCall + ?Sized,
    {
        let handle = self.apply_optimistic(key, change)?;
        match self.executor.execute(call, args).await {
            Ok(output) => {
                if let Err(error) = self.confirm(&handle) {
                    // an older operation failed and reverted this one locally;
                    // the server holds the change, so fetch it back
                    tracing::info!(
                        %key,
                        %error,
                        "change committed after local rollback, refetching"
                    );
                    self.refresher.refresh(key.kind);
                }
                Ok(output)
            }
            Err(error) => {
                if let Err(resolved) = self.rollback(&handle) {
                    tracing::debug!(%key, error = %resolved, "rollback skipped");
                }
                Err(error)
            }
        }
    }

    /// Pending operations on `key`, oldest first.
    #[must_use]
    pub fn pending_operations(&self, key: &EntityKey) -> Vec<PendingOperation> {
        self.state
            .lock()
            .stacks
            .get(key)
            .map(|stack| stack.to_vec())
            .unwrap_or_default()
    }

    /// Number of pending operations across all keys.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().stacks.values().map(SmallVec::len).sum()
    }

    fn locate(state: &CoordinatorState, handle: &OperationHandle) -> Result<usize, SyncError> {
        let status = handle.status();
        if status.is_terminal() {
            return Err(SyncError::OperationResolved {
                id: handle.id,
                key: handle.key.clone(),
                status,
            });
        }
        state
            .stacks
            .get(&handle.key)
            .and_then(|stack| stack.iter().position(|operation| operation.id == handle.id))
            .ok_or(SyncError::UnknownOperation(handle.id))
    }
}

impl From<SyncError> for CommandError {
    fn from(error: SyncError) -> Self {
        Self::new(ErrorKind::Validation, error.to_string())
    }
}
