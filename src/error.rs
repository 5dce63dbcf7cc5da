//! Errors raised by the store and the optimistic mutation coordinator.
//!
//! Transport and command failures have their own types in [`crate::command`];
//! this type covers local invariants that a caller can violate.

use thiserror::Error;

use crate::domain::{EntityKey, EntityKind};
use crate::optimistic::{OperationId, OperationStatus};

/// Local synchronization error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// An optimistic change targeted an entity the store does not hold.
    #[error("entity {0} is not in the store")]
    UnknownEntity(EntityKey),

    /// The handle does not belong to this coordinator.
    #[error("operation {0} is not known to this coordinator")]
    UnknownOperation(OperationId),

    /// The operation already reached a terminal state.
    #[error("operation {id} on {key} is already {status}")]
    OperationResolved {
        /// Operation identifier.
        id: OperationId,
        /// Entity the operation targeted.
        key: EntityKey,
        /// Terminal status it reached.
        status: OperationStatus,
    },

    /// A patch field does not exist on the target kind.
    #[error("patch field `{field}` does not apply to {kind} entities")]
    PatchNotApplicable {
        /// Wire name of the offending field.
        field: &'static str,
        /// Kind of the target entity.
        kind: EntityKind,
    },

    /// The patch carries no change.
    #[error("patch does not change anything")]
    EmptyPatch,

    /// The patched schedule would end before it starts.
    #[error("schedule would end before it starts")]
    InvalidSchedule,
}
