//! Tracking objects (`TrackObject` / `ClusterTrackObject`) and their status.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

use crate::{TrackingRef, TrackingScope, API_VERSION};

/// The single condition type a tracking object ever carries.
pub const IN_SYNC_CONDITION: &str = "ObjectInSync";

/// Desired-state document as written by the upstream source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredObjectRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingObject {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DesiredObjectRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TrackingStatus>,
}

impl TrackingObject {
    pub fn scope(&self) -> Option<TrackingScope> {
        TrackingScope::from_kind(&self.kind)
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    pub fn tracking_ref(&self) -> Option<TrackingRef> {
        let name = self.metadata.name.clone()?;
        match self.scope()? {
            TrackingScope::Namespaced => Some(TrackingRef::namespaced(self.metadata.namespace.clone()?, name)),
            TrackingScope::Cluster => Some(TrackingRef::cluster(name)),
        }
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references.as_deref().unwrap_or(&[])
    }

    /// Controller owner reference to stamp on children. `None` until the object has a UID.
    pub fn as_owner(&self) -> Option<OwnerReference> {
        Some(OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: self.scope()?.kind().to_string(),
            name: self.metadata.name.clone()?,
            uid: self.metadata.uid.clone()?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    pub fn in_sync_condition(&self) -> Option<&Condition> {
        self.status.as_ref()?.conditions.iter().find(|c| c.type_ == IN_SYNC_CONDITION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn in_sync(status: ConditionStatus, reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_: IN_SYNC_CONDITION.to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Keep the previous transition time when status and reason did not move.
    pub fn carry_transition_time(mut self, previous: Option<&Condition>) -> Self {
        if let Some(prev) = previous {
            if prev.status == self.status && prev.reason == self.reason && prev.last_transition_time.is_some() {
                self.last_transition_time = prev.last_transition_time;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    ChildAppliedSuccess,
    ErrorDecodingData,
    ErrorGettingChild,
    ErrorCreatingChild,
    ErrorUpdatingChild,
    ErrorDeletingChild,
    ErrorWatchingChild,
    ErrorUpdatingStatus,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::ChildAppliedSuccess => "ChildAppliedSuccess",
            ConditionReason::ErrorDecodingData => "ErrorDecodingData",
            ConditionReason::ErrorGettingChild => "ErrorGettingChild",
            ConditionReason::ErrorCreatingChild => "ErrorCreatingChild",
            ConditionReason::ErrorUpdatingChild => "ErrorUpdatingChild",
            ConditionReason::ErrorDeletingChild => "ErrorDeletingChild",
            ConditionReason::ErrorWatchingChild => "ErrorWatchingChild",
            ConditionReason::ErrorUpdatingStatus => "ErrorUpdatingStatus",
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
