//! Keel kubehub: the cluster seam used by the engine, its kube-rs implementation
//! (discovery, dynamic watchers, tracking caches, events) and an in-memory mock.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use tracing::warn;

use keel_core::{gvk_key, ChildEvent, TrackingObject, TrackingRef, TrackingScope, TrackingStatus};

mod cache;
mod cluster;
pub mod error;
pub mod merge;
pub mod mock;
mod recorder;

pub use cluster::KubeCluster;
pub use error::{ClusterError, Result};
pub use mock::{MockCluster, OperationCounts};
pub use recorder::EventRecorder;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "keel";

/// A GVK resolved against discovery.
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    pub gvk: GroupVersionKind,
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl ResolvedKind {
    pub fn key(&self) -> String {
        gvk_key(&self.gvk)
    }

    pub fn plural(&self) -> &str {
        &self.resource.plural
    }
}

/// Scope of a list+watch subscription. `namespace: None` watches all namespaces.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub kind: ResolvedKind,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// Full relist; every object is delivered as a generic event.
    Restarted(Vec<DynamicObject>),
}

impl WatchEvent {
    pub fn objects(&self) -> Vec<&DynamicObject> {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => vec![o],
            WatchEvent::Restarted(list) => list.iter().collect(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Applied(_) => "applied",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Restarted(_) => "restarted",
        }
    }
}

/// Everything the controller needs from the API server.
///
/// `list_tracking` and `list_groups` read the controller's cache: when the controller
/// is restricted to a namespace they only return what lives there (cluster-scoped
/// tracking objects excepted).
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind>;

    async fn get(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>>;

    async fn create(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// JSON merge patch (RFC 7386).
    async fn patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Foreground delete. Succeeds when the object is already gone.
    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()>;

    async fn get_tracking(&self, reference: &TrackingRef) -> Result<Option<TrackingObject>>;

    async fn list_tracking(&self, scope: TrackingScope) -> Result<Vec<TrackingObject>>;

    async fn list_groups(&self) -> Result<Vec<ObjectMeta>>;

    async fn update_tracking_status(&self, reference: &TrackingRef, status: &TrackingStatus) -> Result<()>;

    async fn publish_event(&self, event: &ChildEvent) -> Result<()>;

    fn watch(&self, target: &WatchTarget) -> BoxStream<'static, Result<WatchEvent>>;
}

/// Convert a dynamic object into a typed tracking object.
pub fn tracking_from_dynamic(obj: &DynamicObject) -> Result<TrackingObject> {
    let raw = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(raw)?)
}

/// Convert a listing, skipping objects that do not parse. One unreadable object
/// must not hide the rest of its kind.
pub fn readable_tracking<'a>(objects: impl IntoIterator<Item = &'a DynamicObject>) -> Vec<TrackingObject> {
    objects
        .into_iter()
        .filter_map(|obj| match tracking_from_dynamic(obj) {
            Ok(tracking) => Some(tracking),
            Err(e) => {
                warn!(
                    kind = ?obj.types.as_ref().map(|t| t.kind.as_str()),
                    ns = ?obj.metadata.namespace,
                    name = ?obj.metadata.name,
                    error = %e,
                    "skipping unreadable tracking object"
                );
                None
            }
        })
        .collect()
}
