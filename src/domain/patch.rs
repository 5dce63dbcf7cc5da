//! Field-level changes applied optimistically and sent to the server.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::entity::{Entity, EntityKind, EntityPayload, Priority, UserId, WorkStatus};
use crate::error::SyncError;

/// The intended change of an optimistic operation.
///
/// Every field is optional; absent fields are left untouched locally and
/// omitted from the request body. `assignee: Some(None)` clears the assignee
/// and is sent as `"assignedTo": null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPatch {
    /// New title (project name for projects).
    pub title: Option<String>,
    /// New workflow status (kanban column).
    pub status: Option<WorkStatus>,
    /// New priority (severity for bugs).
    pub priority: Option<Priority>,
    /// New assignee; `Some(None)` unassigns.
    pub assignee: Option<Option<UserId>>,
    /// New start instant.
    pub starts_at: Option<DateTime<Utc>>,
    /// New end instant.
    pub ends_at: Option<DateTime<Utc>>,
}

/// Wire names a patch is written under, per kind. They match the first
/// spelling the entity decoder reads, so a committed change survives the
/// next merge.
struct WireNames {
    title: &'static str,
    priority: Option<&'static str>,
    starts_at: Option<&'static str>,
    ends_at: Option<&'static str>,
}

impl WireNames {
    const fn of(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Ticket => Self {
                title: "title",
                priority: Some("priority"),
                starts_at: None,
                ends_at: None,
            },
            EntityKind::Bug => Self {
                title: "title",
                priority: Some("severity"),
                starts_at: None,
                ends_at: None,
            },
            EntityKind::Project => Self {
                title: "name",
                priority: None,
                starts_at: Some("startDate"),
                ends_at: Some("endDate"),
            },
            EntityKind::CalendarEvent => Self {
                title: "title",
                priority: None,
                starts_at: Some("startDate"),
                ends_at: Some("endDate"),
            },
        }
    }
}

fn insert(
    body: &mut Map<String, Value>,
    name: Option<&str>,
    value: Option<impl Serialize>,
) -> serde_json::Result<()> {
    if let (Some(name), Some(value)) = (name, value) {
        body.insert(name.to_string(), serde_json::to_value(value)?);
    }
    Ok(())
}

impl EntityPatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the entity to another status column.
    #[must_use]
    pub const fn with_status(mut self, status: WorkStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Changes priority or severity.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Renames the entity.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Assigns the entity to `user`.
    #[must_use]
    pub fn assign(mut self, user: impl Into<UserId>) -> Self {
        self.assignee = Some(Some(user.into()));
        self
    }

    /// Clears the assignee.
    #[must_use]
    pub fn unassign(mut self) -> Self {
        self.assignee = Some(None);
        self
    }

    /// Moves the schedule window.
    #[must_use]
    pub fn reschedule(mut self, starts_at: DateTime<Utc>, ends_at: Option<DateTime<Utc>>) -> Self {
        self.starts_at = Some(starts_at);
        self.ends_at = ends_at;
        self
    }

    /// Returns `true` when the patch carries no field.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
    }

    /// Request body for an entity of `kind`, using the field names that kind
    /// is read back with (`name` for projects, `severity` for bugs,
    /// `startDate`/`endDate` for schedules). Fields the kind does not have are
    /// left out; [`EntityPatch::apply`] rejects them before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns the serde error if a value cannot be represented as JSON.
    pub fn to_body(&self, kind: EntityKind) -> serde_json::Result<Value> {
        let names = WireNames::of(kind);
        let has_status = !matches!(kind, EntityKind::CalendarEvent);
        let has_assignee = matches!(kind, EntityKind::Ticket | EntityKind::Bug);
        let mut body = Map::new();
        insert(&mut body, Some(names.title), self.title.as_ref())?;
        insert(&mut body, has_status.then_some("status"), self.status)?;
        insert(&mut body, names.priority, self.priority)?;
        insert(&mut body, has_assignee.then_some("assignedTo"), self.assignee.as_ref())?;
        insert(&mut body, names.starts_at, self.starts_at)?;
        insert(&mut body, names.ends_at, self.ends_at)?;
        Ok(Value::Object(body))
    }

    /// Applies the patch to a copy of `entity`.
    ///
    /// # Errors
    ///
    /// - [`SyncError::EmptyPatch`] when nothing would change.
    /// - [`SyncError::PatchNotApplicable`] when a field does not exist on the
    ///   entity's kind (for example a priority on a calendar event).
    /// - [`SyncError::InvalidSchedule`] when the resulting window ends before it starts.
    pub fn apply(&self, entity: &Entity) -> Result<Entity, SyncError> {
        if self.is_empty() {
            return Err(SyncError::EmptyPatch);
        }
        let kind = entity.kind();
        let mut next = entity.clone();

        match next.payload_mut() {
            EntityPayload::Ticket(ticket) => {
                self.reject_schedule(kind)?;
                if let Some(title) = &self.title {
                    ticket.title.clone_from(title);
                }
                if let Some(status) = self.status {
                    ticket.status = status;
                }
                if let Some(priority) = self.priority {
                    ticket.priority = Some(priority);
                }
                if let Some(assignee) = &self.assignee {
                    ticket.assignee.clone_from(assignee);
                }
            }
            EntityPayload::Bug(bug) => {
                self.reject_schedule(kind)?;
                if let Some(title) = &self.title {
                    bug.title.clone_from(title);
                }
                if let Some(status) = self.status {
                    bug.status = status;
                }
                if let Some(priority) = self.priority {
                    bug.severity = Some(priority);
                }
                if let Some(assignee) = &self.assignee {
                    bug.assignee.clone_from(assignee);
                }
            }
            EntityPayload::Project(project) => {
                Self::reject(self.priority.is_some(), "priority", kind)?;
                Self::reject(self.assignee.is_some(), "assignedTo", kind)?;
                if let Some(title) = &self.title {
                    project.name.clone_from(title);
                }
                if let Some(status) = self.status {
                    project.status = Some(status);
                }
                if let Some(starts_at) = self.starts_at {
                    project.starts_at = Some(starts_at);
                }
                if let Some(ends_at) = self.ends_at {
                    project.ends_at = Some(ends_at);
                }
                check_window(project.starts_at, project.ends_at)?;
            }
            EntityPayload::CalendarEvent(event) => {
                Self::reject(self.status.is_some(), "status", kind)?;
                Self::reject(self.priority.is_some(), "priority", kind)?;
                Self::reject(self.assignee.is_some(), "assignedTo", kind)?;
                if let Some(title) = &self.title {
                    event.title.clone_from(title);
                }
                if let Some(starts_at) = self.starts_at {
                    event.starts_at = starts_at;
                }
                if let Some(ends_at) = self.ends_at {
                    event.ends_at = Some(ends_at);
                }
                check_window(Some(event.starts_at), event.ends_at)?;
            }
        }

        Ok(next)
    }

    fn reject_schedule(&self, kind: EntityKind) -> Result<(), SyncError> {
        Self::reject(self.starts_at.is_some(), "startsAt", kind)?;
        Self::reject(self.ends_at.is_some(), "endsAt", kind)
    }

    const fn reject(present: bool, field: &'static str, kind: EntityKind) -> Result<(), SyncError> {
        if present {
            Err(SyncError::PatchNotApplicable { field, kind })
        } else {
            Ok(())
        }
    }
}

fn check_window(
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
) -> Result<(), SyncError> {
    match (starts_at, ends_at) {
        (Some(start), Some(end)) if end < start => Err(SyncError::InvalidSchedule),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::{CalendarEvent, Ticket};
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn ticket(status: WorkStatus) -> Entity {
        Entity::new(
            "t-1",
            EntityPayload::Ticket(Ticket {
                title: "Card".to_string(),
                description: None,
                status,
                priority: None,
                assignee: Some(UserId::new("u-1")),
                project: None,
                due_date: None,
            }),
        )
        .with_version(4)
    }

    fn meeting() -> Entity {
        Entity::new(
            "e-1",
            EntityPayload::CalendarEvent(CalendarEvent {
                title: "Planning".to_string(),
                description: None,
                starts_at: Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap(),
                ends_at: None,
                owner: None,
                attendees: Vec::new(),
            }),
        )
    }

    #[rstest]
    fn test_status_patch_moves_ticket_and_keeps_header() {
        let original = ticket(WorkStatus::Open);

        let next = EntityPatch::new()
            .with_status(WorkStatus::InProgress)
            .apply(&original)
            .unwrap();

        assert_eq!(next.status(), Some(WorkStatus::InProgress));
        assert_eq!(next.id(), original.id());
        assert_eq!(next.version(), Some(4));
        assert_eq!(original.status(), Some(WorkStatus::Open));
    }

    #[rstest]
    fn test_unassign_clears_assignee() {
        let next = EntityPatch::new().unassign().apply(&ticket(WorkStatus::Open)).unwrap();

        let EntityPayload::Ticket(ticket) = next.payload() else {
            panic!("expected ticket payload");
        };
        assert_eq!(ticket.assignee, None);
    }

    #[rstest]
    fn test_empty_patch_is_rejected() {
        assert_eq!(
            EntityPatch::new().apply(&ticket(WorkStatus::Open)),
            Err(SyncError::EmptyPatch)
        );
    }

    #[rstest]
    fn test_priority_on_calendar_event_is_not_applicable() {
        let result = EntityPatch::new().with_priority(Priority::High).apply(&meeting());

        assert_eq!(
            result,
            Err(SyncError::PatchNotApplicable {
                field: "priority",
                kind: EntityKind::CalendarEvent,
            })
        );
    }

    #[rstest]
    fn test_reschedule_rejects_inverted_window() {
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap();

        let result = EntityPatch::new().reschedule(start, Some(end)).apply(&meeting());

        assert_eq!(result, Err(SyncError::InvalidSchedule));
    }

    #[rstest]
    fn test_patch_body_holds_only_present_fields() {
        let patch = EntityPatch::new()
            .with_status(WorkStatus::Done)
            .unassign();

        let body = patch.to_body(EntityKind::Ticket).unwrap();

        assert_eq!(
            body,
            serde_json::json!({ "status": "done", "assignedTo": null })
        );
    }

    #[rstest]
    #[case(EntityKind::Ticket, json!({ "title": "Renamed", "priority": "high" }))]
    #[case(EntityKind::Bug, json!({ "title": "Renamed", "severity": "high" }))]
    #[case(EntityKind::Project, json!({ "name": "Renamed" }))]
    #[case(EntityKind::CalendarEvent, json!({ "title": "Renamed" }))]
    fn test_patch_body_uses_wire_names_of_kind(
        #[case] kind: EntityKind,
        #[case] expected: serde_json::Value,
    ) {
        let patch = EntityPatch::new()
            .with_title("Renamed")
            .with_priority(Priority::High);

        assert_eq!(patch.to_body(kind).unwrap(), expected);
    }

    #[rstest]
    #[case(EntityKind::Project, json!({
        "_id": "p-1", "name": "Website", "startDate": "2024-01-01T00:00:00Z"
    }))]
    #[case(EntityKind::CalendarEvent, json!({
        "_id": "e-1", "title": "Standup", "start": "2024-01-01T00:00:00Z"
    }))]
    #[case(EntityKind::Bug, json!({
        "_id": "b-1", "title": "Crash", "status": "open", "priority": "low"
    }))]
    fn test_server_applying_body_reads_back_as_patched(
        #[case] kind: EntityKind,
        #[case] stored: serde_json::Value,
    ) {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        let patch = match kind {
            EntityKind::Bug => EntityPatch::new().with_title("Renamed").with_priority(Priority::Critical),
            _ => EntityPatch::new().with_title("Renamed").reschedule(start, Some(end)),
        };
        let original = Entity::from_json(kind, &stored).unwrap();
        let mut document = stored;
        if let (Some(target), serde_json::Value::Object(changes)) =
            (document.as_object_mut(), patch.to_body(kind).unwrap())
        {
            target.extend(changes);
        }

        let echoed = Entity::from_json(kind, &document).unwrap();

        assert_eq!(echoed, patch.apply(&original).unwrap());
    }
}
