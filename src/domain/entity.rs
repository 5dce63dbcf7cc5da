//! Entity model shared by every synchronized surface.
//!
//! Entities arrive from the remote service as loosely shaped JSON documents
//! (Mongo-style `_id`, `updatedAt`, `__v`, references that are sometimes a bare
//! id and sometimes a populated object). They are decoded here, once, into a
//! tagged variant per kind with explicit optional fields; anything that does not
//! fit is a decode error and never reaches the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Entity Kind
// =============================================================================

/// Coarse tag identifying the domain of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Work item shown on kanban boards and ticket lists.
    Ticket,
    /// Project grouping tickets and members.
    Project,
    /// Defect report.
    Bug,
    /// Calendar entry (meetings, deadlines, standups).
    CalendarEvent,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 4] = [Self::Ticket, Self::Project, Self::Bug, Self::CalendarEvent];

    /// Stable lowercase name used in logs and keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::Project => "project",
            Self::Bug => "bug",
            Self::CalendarEvent => "calendar_event",
        }
    }

    /// REST collection path, relative to the API base URL.
    #[must_use]
    pub const fn collection_path(self) -> &'static str {
        match self {
            Self::Ticket => "/tickets",
            Self::Project => "/projects",
            Self::Bug => "/bugs",
            Self::CalendarEvent => "/calendar",
        }
    }

    /// Field holding the array in a collection response (`{ "tickets": [...] }`).
    #[must_use]
    pub const fn collection_field(self) -> &'static str {
        match self {
            Self::Ticket => "tickets",
            Self::Project => "projects",
            Self::Bug => "bugs",
            Self::CalendarEvent => "events",
        }
    }

    /// Field holding the document in a single-entity response (`{ "ticket": {...} }`).
    #[must_use]
    pub const fn entity_field(self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::Project => "project",
            Self::Bug => "bug",
            Self::CalendarEvent => "event",
        }
    }

    /// Push topic domain (`"calendar"` matches `"calendar.created"`).
    #[must_use]
    pub const fn push_domain(self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::Project => "project",
            Self::Bug => "bug",
            Self::CalendarEvent => "calendar",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown entity kind name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind '{0}' (expected ticket, project, bug or calendar_event)")]
pub struct ParseKindError(pub String);

impl FromStr for EntityKind {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ticket" | "tickets" => Ok(Self::Ticket),
            "project" | "projects" => Ok(Self::Project),
            "bug" | "bugs" => Ok(Self::Bug),
            "calendar_event" | "calendar" | "event" | "events" => Ok(Self::CalendarEvent),
            _ => Err(ParseKindError(value.to_string())),
        }
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Server-assigned entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a user (assignee, reporter, attendee, current user).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a raw user identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Store address of an entity. At most one entity exists per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    /// Kind of the addressed entity.
    pub kind: EntityKind,
    /// Identifier within the kind.
    pub id: EntityId,
}

impl EntityKey {
    /// Creates a key.
    #[must_use]
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// Workflow status shared by tickets, bugs and projects (kanban columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Not started.
    #[serde(alias = "todo", alias = "new")]
    Open,
    /// Being worked on.
    #[serde(alias = "in-progress", alias = "inprogress")]
    InProgress,
    /// Waiting for review.
    #[serde(alias = "in_review")]
    Review,
    /// Finished.
    #[serde(alias = "completed", alias = "resolved")]
    Done,
    /// Closed without further work.
    Closed,
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Closed => "closed",
        };
        formatter.write_str(name)
    }
}

/// Priority of a ticket, severity of a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority.
    Low,
    /// Medium priority.
    Medium,
    /// High priority.
    High,
    /// Critical priority.
    #[serde(alias = "urgent")]
    Critical,
}

// =============================================================================
// Payload Variants
// =============================================================================

/// Ticket payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "TicketWire")]
pub struct Ticket {
    /// Title shown on the card.
    pub title: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Kanban column.
    pub status: WorkStatus,
    /// Priority, when set.
    pub priority: Option<Priority>,
    /// Assigned user.
    pub assignee: Option<UserId>,
    /// Owning project.
    pub project: Option<EntityId>,
    /// Due date.
    pub due_date: Option<DateTime<Utc>>,
}

/// Project payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ProjectWire")]
pub struct Project {
    /// Project name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Overall status.
    pub status: Option<WorkStatus>,
    /// Owning manager.
    pub owner: Option<UserId>,
    /// Team members.
    pub members: Vec<UserId>,
    /// Planned start.
    pub starts_at: Option<DateTime<Utc>>,
    /// Planned end.
    pub ends_at: Option<DateTime<Utc>>,
}

/// Bug payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "BugWire")]
pub struct Bug {
    /// Short summary.
    pub title: String,
    /// Reproduction details.
    pub description: Option<String>,
    /// Workflow status.
    pub status: WorkStatus,
    /// Severity.
    pub severity: Option<Priority>,
    /// Reporting user.
    pub reporter: Option<UserId>,
    /// Assigned user.
    pub assignee: Option<UserId>,
    /// Project the bug was filed against.
    pub project: Option<EntityId>,
}

/// Calendar event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "CalendarEventWire")]
pub struct CalendarEvent {
    /// Event title.
    pub title: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Start instant.
    pub starts_at: DateTime<Utc>,
    /// End instant; open-ended when absent.
    pub ends_at: Option<DateTime<Utc>>,
    /// Organizer.
    pub owner: Option<UserId>,
    /// Invited users.
    pub attendees: Vec<UserId>,
}

/// Variant-specific part of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPayload {
    /// Ticket payload.
    Ticket(Ticket),
    /// Project payload.
    Project(Project),
    /// Bug payload.
    Bug(Bug),
    /// Calendar event payload.
    CalendarEvent(CalendarEvent),
}

impl EntityPayload {
    /// Kind implied by the variant.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Ticket(_) => EntityKind::Ticket,
            Self::Project(_) => EntityKind::Project,
            Self::Bug(_) => EntityKind::Bug,
            Self::CalendarEvent(_) => EntityKind::CalendarEvent,
        }
    }
}

// =============================================================================
// Entity
// =============================================================================

/// An addressable domain object held by the reconciliation store.
///
/// The kind is derived from the payload, so a key built from an entity can
/// never disagree with its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    id: EntityId,
    updated_at: Option<DateTime<Utc>>,
    version: Option<u64>,
    payload: EntityPayload,
}

/// Common header of every wire document.
///
/// Serializers that expose virtuals send `_id` and `id` side by side, so every
/// spelling is read separately and merged in [`Entity::from_json`].
#[derive(Deserialize)]
struct EntityHeader {
    #[serde(default, rename = "_id")]
    mongo_id: Option<EntityId>,
    #[serde(default)]
    id: Option<EntityId>,
    #[serde(default, rename = "updatedAt")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updated_at")]
    updated_at_snake: Option<DateTime<Utc>>,
    #[serde(default, rename = "__v")]
    mongo_version: Option<u64>,
    #[serde(default)]
    version: Option<u64>,
}

impl Entity {
    /// Creates an entity without version information.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, payload: EntityPayload) -> Self {
        Self {
            id: id.into(),
            updated_at: None,
            version: None,
            payload,
        }
    }

    /// Sets the `updatedAt` marker.
    #[must_use]
    pub const fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Sets the version marker.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Decodes one wire document as an entity of `kind`.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the document lacks an id or does not match
    /// the payload shape of `kind`.
    pub fn from_json(kind: EntityKind, document: &serde_json::Value) -> serde_json::Result<Self> {
        let header = EntityHeader::deserialize(document)?;
        let id = header
            .mongo_id
            .or(header.id)
            .ok_or_else(|| <serde_json::Error as serde::de::Error>::missing_field("_id"))?;
        let payload = match kind {
            EntityKind::Ticket => EntityPayload::Ticket(Ticket::deserialize(document)?),
            EntityKind::Project => EntityPayload::Project(Project::deserialize(document)?),
            EntityKind::Bug => EntityPayload::Bug(Bug::deserialize(document)?),
            EntityKind::CalendarEvent => {
                EntityPayload::CalendarEvent(CalendarEvent::deserialize(document)?)
            }
        };
        Ok(Self {
            id,
            updated_at: header.updated_at.or(header.updated_at_snake),
            version: header.mongo_version.or(header.version),
            payload,
        })
    }

    /// Identifier within the kind.
    #[must_use]
    pub const fn id(&self) -> &EntityId {
        &self.id
    }

    /// Kind implied by the payload.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Store key of this entity.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id.clone())
    }

    /// Last server-side modification, when reported.
    #[must_use]
    pub const fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Server version counter, when reported.
    #[must_use]
    pub const fn version(&self) -> Option<u64> {
        self.version
    }

    /// Variant payload.
    #[must_use]
    pub const fn payload(&self) -> &EntityPayload {
        &self.payload
    }

    pub(crate) const fn payload_mut(&mut self) -> &mut EntityPayload {
        &mut self.payload
    }

    /// Workflow status for kinds that have one.
    #[must_use]
    pub const fn status(&self) -> Option<WorkStatus> {
        match &self.payload {
            EntityPayload::Ticket(ticket) => Some(ticket.status),
            EntityPayload::Bug(bug) => Some(bug.status),
            EntityPayload::Project(project) => project.status,
            EntityPayload::CalendarEvent(_) => None,
        }
    }
}

// =============================================================================
// Wire Shapes
// =============================================================================
//
// Every accepted spelling of a field is its own `Option`, so a document that
// carries two of them still decodes. The first spelling listed in each merge
// wins; it is also the name `EntityPatch::to_body` writes.

/// Error raised when a required field is absent under every spelling.
#[derive(Debug, Error)]
#[error("missing field `{0}`")]
struct MissingField(&'static str);

/// A reference is either a bare id or a populated document carrying `_id`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ReferenceWire {
    Id(String),
    Document {
        #[serde(default, rename = "_id")]
        mongo_id: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
}

impl ReferenceWire {
    fn into_id(self) -> Option<String> {
        match self {
            Self::Id(id) => Some(id),
            Self::Document { mongo_id, id } => mongo_id.or(id),
        }
    }
}

fn reference<T: From<String>>(spellings: [Option<ReferenceWire>; 2]) -> Option<T> {
    spellings
        .into_iter()
        .flatten()
        .find_map(ReferenceWire::into_id)
        .map(T::from)
}

fn references<T: From<String>>(spellings: [Option<Vec<ReferenceWire>>; 2]) -> Vec<T> {
    spellings
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_default()
        .into_iter()
        .filter_map(ReferenceWire::into_id)
        .map(T::from)
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketWire {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<WorkStatus>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    assigned_to: Option<ReferenceWire>,
    #[serde(default)]
    assignee: Option<ReferenceWire>,
    #[serde(default)]
    project: Option<ReferenceWire>,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
}

impl TryFrom<TicketWire> for Ticket {
    type Error = MissingField;

    fn try_from(wire: TicketWire) -> Result<Self, Self::Error> {
        Ok(Self {
            title: wire.title.ok_or(MissingField("title"))?,
            description: wire.description,
            status: wire.status.ok_or(MissingField("status"))?,
            priority: wire.priority,
            assignee: reference([wire.assigned_to, wire.assignee]),
            project: reference([wire.project, None]),
            due_date: wire.due_date,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectWire {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<WorkStatus>,
    #[serde(default)]
    owner: Option<ReferenceWire>,
    #[serde(default)]
    manager: Option<ReferenceWire>,
    #[serde(default)]
    created_by: Option<ReferenceWire>,
    #[serde(default)]
    members: Option<Vec<ReferenceWire>>,
    #[serde(default)]
    team: Option<Vec<ReferenceWire>>,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
}

impl TryFrom<ProjectWire> for Project {
    type Error = MissingField;

    fn try_from(wire: ProjectWire) -> Result<Self, Self::Error> {
        let owner = reference([wire.owner, wire.manager])
            .or_else(|| reference([wire.created_by, None]));
        Ok(Self {
            name: wire.name.or(wire.title).ok_or(MissingField("name"))?,
            description: wire.description,
            status: wire.status,
            owner,
            members: references([wire.members, wire.team]),
            starts_at: wire.start_date.or(wire.starts_at),
            ends_at: wire.end_date.or(wire.ends_at).or(wire.deadline),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BugWire {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<WorkStatus>,
    #[serde(default)]
    severity: Option<Priority>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    reported_by: Option<ReferenceWire>,
    #[serde(default)]
    reporter: Option<ReferenceWire>,
    #[serde(default)]
    assigned_to: Option<ReferenceWire>,
    #[serde(default)]
    assignee: Option<ReferenceWire>,
    #[serde(default)]
    project: Option<ReferenceWire>,
}

impl TryFrom<BugWire> for Bug {
    type Error = MissingField;

    fn try_from(wire: BugWire) -> Result<Self, Self::Error> {
        Ok(Self {
            title: wire.title.ok_or(MissingField("title"))?,
            description: wire.description,
            status: wire.status.ok_or(MissingField("status"))?,
            severity: wire.severity.or(wire.priority),
            reporter: reference([wire.reported_by, wire.reporter]),
            assignee: reference([wire.assigned_to, wire.assignee]),
            project: reference([wire.project, None]),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEventWire {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    created_by: Option<ReferenceWire>,
    #[serde(default)]
    owner: Option<ReferenceWire>,
    #[serde(default)]
    participants: Option<Vec<ReferenceWire>>,
    #[serde(default)]
    attendees: Option<Vec<ReferenceWire>>,
}

impl TryFrom<CalendarEventWire> for CalendarEvent {
    type Error = MissingField;

    fn try_from(wire: CalendarEventWire) -> Result<Self, Self::Error> {
        Ok(Self {
            title: wire.title.ok_or(MissingField("title"))?,
            description: wire.description,
            starts_at: wire
                .start_date
                .or(wire.start)
                .or(wire.starts_at)
                .ok_or(MissingField("startDate"))?,
            ends_at: wire.end_date.or(wire.end).or(wire.ends_at),
            owner: reference([wire.created_by, wire.owner]),
            attendees: references([wire.participants, wire.attendees]),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
