//! Domain model: entity kinds, identifiers, typed payloads and patches.

mod entity;
mod patch;

pub use entity::{
    Bug, CalendarEvent, Entity, EntityId, EntityKey, EntityKind, EntityPayload, ParseKindError,
    Priority, Project, Ticket, UserId, WorkStatus,
};
pub use patch::EntityPatch;
