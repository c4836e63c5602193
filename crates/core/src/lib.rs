//! Keel core types: tracking objects, reconcile identities and the shared vocabulary
//! (annotation keys, condition and event reasons) used by every other crate.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

pub mod events;
pub mod tracking;

pub use events::{ChildEvent, EventReason, EventType, InvolvedObject};
pub use tracking::{
    Condition, ConditionReason, ConditionStatus, DesiredObjectRecord, TrackingObject, TrackingStatus,
    IN_SYNC_CONDITION,
};

pub const API_GROUP: &str = "keel.io";
pub const API_VERSION: &str = "keel.io/v1alpha1";

/// Namespaced parent resource anchoring every ownership chain.
pub const GROUP_KIND: &str = "Track";
pub const TRACK_OBJECT_KIND: &str = "TrackObject";
pub const CLUSTER_TRACK_OBJECT_KIND: &str = "ClusterTrackObject";

/// Well-known annotation keys.
pub mod annotations {
    /// On the desired object: `update`, `recreate` or `never`.
    pub const UPDATE_STRATEGY: &str = "keel.io/update-strategy";
    /// On the desired object: `active` or `marked-for-deletion`.
    pub const RESOURCE_STATE: &str = "keel.io/resource-state";
    /// On every child: the last successfully applied desired document (JSON).
    pub const LAST_APPLIED: &str = "keel.io/last-applied";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("{0} is invalid, should be of format <resource>.<group>/<version>")]
    InvalidIgnoredResource(String),
    #[error("unable to parse group version {0}")]
    InvalidGroupVersion(String),
}

/// Which of the two tracking kinds a request addresses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackingScope {
    Namespaced,
    Cluster,
}

impl TrackingScope {
    pub fn kind(self) -> &'static str {
        match self {
            TrackingScope::Namespaced => TRACK_OBJECT_KIND,
            TrackingScope::Cluster => CLUSTER_TRACK_OBJECT_KIND,
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            TRACK_OBJECT_KIND => Some(TrackingScope::Namespaced),
            CLUSTER_TRACK_OBJECT_KIND => Some(TrackingScope::Cluster),
            _ => None,
        }
    }

    pub fn gvk(self) -> GroupVersionKind {
        GroupVersionKind::gvk(API_GROUP, "v1alpha1", self.kind())
    }
}

/// Identity of a reconcile request. Carries no payload: the reconciler always refetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingRef {
    pub scope: TrackingScope,
    pub namespace: Option<String>,
    pub name: String,
}

impl TrackingRef {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { scope: TrackingScope::Namespaced, namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { scope: TrackingScope::Cluster, namespace: None, name: name.into() }
    }

    /// Map a child's owner reference back to the tracking object that owns it.
    ///
    /// Owner references never cross namespaces, so a namespaced owner lives in the
    /// child's own namespace.
    pub fn from_owner(owner: &OwnerReference, child_namespace: Option<&str>) -> Option<Self> {
        if owner.api_version != API_VERSION {
            return None;
        }
        match TrackingScope::from_kind(&owner.kind)? {
            TrackingScope::Namespaced => child_namespace.map(|ns| Self::namespaced(ns, owner.name.clone())),
            TrackingScope::Cluster => Some(Self::cluster(owner.name.clone())),
        }
    }
}

impl fmt::Display for TrackingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.scope.kind(), ns, self.name),
            None => write!(f, "{}/{}", self.scope.kind(), self.name),
        }
    }
}

/// Stable `group/version/Kind` (or `version/Kind` for the core group) key.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, CoreError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(CoreError::InvalidGvkKey(key.to_string())),
    }
}

/// Split an `apiVersion` into group and version ("apps/v1" -> ("apps", "v1"), "v1" -> ("", "v1")).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// A resource the controller never applies or watches, given as `<resource>.<group>/<version>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IgnoredResource {
    pub resource: String,
    pub group: String,
    pub version: String,
}

impl IgnoredResource {
    pub fn matches(&self, group: &str, version: &str, plural: &str) -> bool {
        self.group == group && self.version == version && self.resource == plural
    }
}

impl FromStr for IgnoredResource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains('.') || !s.contains('/') {
            return Err(CoreError::InvalidIgnoredResource(s.to_string()));
        }
        let (resource, gv) = s.split_once('.').ok_or_else(|| CoreError::InvalidIgnoredResource(s.to_string()))?;
        if resource.is_empty() {
            return Err(CoreError::InvalidIgnoredResource(s.to_string()));
        }
        let (group, version) = gv.split_once('/').ok_or_else(|| CoreError::InvalidGroupVersion(gv.to_string()))?;
        if version.is_empty() || version.contains('/') {
            return Err(CoreError::InvalidGroupVersion(gv.to_string()));
        }
        Ok(Self { resource: resource.to_string(), group: group.to_string(), version: version.to_string() })
    }
}

impl fmt::Display for IgnoredResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.resource, self.group, self.version)
    }
}

/// Parse every `--ignore-resource` value; the first malformed entry aborts.
pub fn parse_ignored_resources<I, S>(values: I) -> Result<Vec<IgnoredResource>, CoreError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values.into_iter().map(|v| v.as_ref().parse()).collect()
}

pub mod prelude {
    pub use super::{
        annotations, gvk_key, ChildEvent, Condition, ConditionReason, ConditionStatus, DesiredObjectRecord, EventReason,
        EventType, IgnoredResource, InvolvedObject, TrackingObject, TrackingRef, TrackingScope, TrackingStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(kind: &str, api_version: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: "7d0c3c3e-0000-0000-0000-000000000001".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn gvk_key_round_trips_core_and_grouped() {
        let core = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!(core.group, "");
        assert_eq!(gvk_key(&core), "v1/ConfigMap");
        let apps = parse_gvk_key("apps/v1/Deployment").expect("ok");
        assert_eq!(apps.group, "apps");
        assert_eq!(gvk_key(&apps), "apps/v1/Deployment");
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn ignored_resource_parses_grouped_and_core() {
        let jobs: IgnoredResource = "jobs.batch/v1".parse().expect("ok");
        assert_eq!(jobs, IgnoredResource { resource: "jobs".into(), group: "batch".into(), version: "v1".into() });
        assert!(jobs.matches("batch", "v1", "jobs"));
        assert!(!jobs.matches("batch", "v1beta1", "jobs"));

        let cms: IgnoredResource = "configmaps./v1".parse().expect("ok");
        assert_eq!(cms.group, "");
        assert_eq!(cms.to_string(), "configmaps./v1");
    }

    #[test]
    fn ignored_resource_rejects_malformed_values() {
        let err = "jobs".parse::<IgnoredResource>().unwrap_err();
        assert_eq!(err.to_string(), "jobs is invalid, should be of format <resource>.<group>/<version>");
        assert!("jobs/v1".parse::<IgnoredResource>().is_err());
        assert!("jobs.batch/".parse::<IgnoredResource>().is_err());
        assert!(parse_ignored_resources(["jobs.batch/v1", "nope"]).is_err());
        assert_eq!(parse_ignored_resources(Vec::<String>::new()).expect("ok").len(), 0);
    }

    #[test]
    fn tracking_ref_from_owner_reference() {
        let ns = TrackingRef::from_owner(&owner(TRACK_OBJECT_KIND, API_VERSION, "example"), Some("default"));
        assert_eq!(ns, Some(TrackingRef::namespaced("default", "example")));

        let cluster = TrackingRef::from_owner(&owner(CLUSTER_TRACK_OBJECT_KIND, API_VERSION, "example"), None);
        assert_eq!(cluster, Some(TrackingRef::cluster("example")));

        // Foreign group or unrelated kinds never map.
        assert_eq!(TrackingRef::from_owner(&owner(TRACK_OBJECT_KIND, "other.io/v1", "example"), Some("default")), None);
        assert_eq!(TrackingRef::from_owner(&owner("ReplicaSet", "apps/v1", "example"), Some("default")), None);
        // A namespaced owner needs the child's namespace.
        assert_eq!(TrackingRef::from_owner(&owner(TRACK_OBJECT_KIND, API_VERSION, "example"), None), None);
    }

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("rbac.authorization.k8s.io/v1"), ("rbac.authorization.k8s.io", "v1"));
    }
}
