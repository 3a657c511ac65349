//! Domain events pushed by task CRUD handlers after their commit succeeds.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::websocket::{EventType, ServerEvent};

/// Task mutations that can be broadcast to a board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskMoved,
}

impl From<DomainEventType> for EventType {
    fn from(kind: DomainEventType) -> Self {
        match kind {
            DomainEventType::TaskCreated => EventType::TaskCreated,
            DomainEventType::TaskUpdated => EventType::TaskUpdated,
            DomainEventType::TaskDeleted => EventType::TaskDeleted,
            DomainEventType::TaskMoved => EventType::TaskMoved,
        }
    }
}

/// A committed task change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: DomainEventType,
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(kind: DomainEventType, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn task_created(task: Value) -> Self {
        Self::new(DomainEventType::TaskCreated, task)
    }

    pub fn task_updated(task: Value) -> Self {
        Self::new(DomainEventType::TaskUpdated, task)
    }

    pub fn task_moved(task: Value) -> Self {
        Self::new(DomainEventType::TaskMoved, task)
    }

    pub fn task_deleted(task_id: i64) -> Self {
        Self::new(DomainEventType::TaskDeleted, json!({ "id": task_id }))
    }

    /// An update that touched the status column moves the task between columns
    pub fn for_task_update(task: Value, status_changed: bool) -> Self {
        if status_changed {
            Self::task_moved(task)
        } else {
            Self::task_updated(task)
        }
    }

    pub fn into_server_event(self) -> ServerEvent {
        ServerEvent::new(self.kind.into(), self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_kind_depends_on_status_change() {
        let task = json!({"id": 1, "status": "done"});
        assert_eq!(
            DomainEvent::for_task_update(task.clone(), true).kind,
            DomainEventType::TaskMoved
        );
        assert_eq!(
            DomainEvent::for_task_update(task, false).kind,
            DomainEventType::TaskUpdated
        );
    }

    #[test]
    fn test_task_deleted_payload() {
        let event = DomainEvent::task_deleted(42).into_server_event();
        assert_eq!(event.event_type, EventType::TaskDeleted);
        assert_eq!(event.payload, json!({"id": 42}));
    }

    #[test]
    fn test_deserialize_rejects_presence_types() {
        let parsed: Result<DomainEvent, _> =
            serde_json::from_value(json!({"type": "user_joined", "payload": {}}));
        assert!(parsed.is_err());

        let parsed: DomainEvent =
            serde_json::from_value(json!({"type": "task_created", "payload": {"id": 1}})).unwrap();
        assert_eq!(parsed.kind, DomainEventType::TaskCreated);
    }
}
