//! Event delivery pinned to the managed namespace.

use std::sync::Arc;

use tracing::{debug, warn};

use keel_core::{ChildEvent, EventReason, EventType, InvolvedObject};

use crate::ClusterApi;

/// Publishes child events. Delivery failures are logged and swallowed: an event is
/// never a reason to fail a reconcile.
#[derive(Clone)]
pub struct EventRecorder {
    cluster: Arc<dyn ClusterApi>,
    namespace: Option<String>,
}

impl EventRecorder {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: Option<String>) -> Self {
        Self { cluster, namespace }
    }

    /// Namespace events land in: the managed namespace, else the object's, else `default`.
    pub fn delivery_namespace(&self, object_namespace: Option<&str>) -> String {
        self.namespace
            .as_deref()
            .or(object_namespace)
            .filter(|ns| !ns.is_empty())
            .unwrap_or("default")
            .to_string()
    }

    /// `involved.namespace` is the object's own namespace; it is rewritten to the
    /// delivery namespace before publishing.
    pub async fn record(&self, mut involved: InvolvedObject, type_: EventType, reason: EventReason, note: impl Into<String>) {
        involved.namespace = Some(self.delivery_namespace(involved.namespace.as_deref()));
        let event = ChildEvent { involved, type_, reason, note: note.into() };
        debug!(kind = %event.involved.kind, name = %event.involved.name, reason = reason.as_str(), "recording event");
        if let Err(e) = self.cluster.publish_event(&event).await {
            warn!(kind = %event.involved.kind, name = %event.involved.name, reason = reason.as_str(), error = %e, "failed to publish event");
        }
    }
}
