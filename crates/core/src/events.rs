//! Observability events about children.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    CreateStarted,
    CreateSuccessful,
    CreateFailed,
    UpdateSuccessful,
    UpdateFailed,
    DeleteStarted,
    DeleteFailed,
    DecodeFailed,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::CreateStarted => "CreateStarted",
            EventReason::CreateSuccessful => "CreateSuccessful",
            EventReason::CreateFailed => "CreateFailed",
            EventReason::UpdateSuccessful => "UpdateSuccessful",
            EventReason::UpdateFailed => "UpdateFailed",
            EventReason::DeleteStarted => "DeleteStarted",
            EventReason::DeleteFailed => "DeleteFailed",
            EventReason::DecodeFailed => "DecodeFailed",
        }
    }

    /// Short verb used as the event action.
    pub fn action(&self) -> &'static str {
        match self {
            EventReason::CreateStarted | EventReason::CreateSuccessful | EventReason::CreateFailed => "Create",
            EventReason::UpdateSuccessful | EventReason::UpdateFailed => "Update",
            EventReason::DeleteStarted | EventReason::DeleteFailed => "Delete",
            EventReason::DecodeFailed => "Decode",
        }
    }
}

/// The object an event is about. `namespace` is where the event is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEvent {
    pub involved: InvolvedObject,
    pub type_: EventType,
    pub reason: EventReason,
    pub note: String,
}
