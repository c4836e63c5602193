//! Writes the single `ObjectInSync` condition back to tracking objects.

use std::sync::Arc;

use metrics::gauge;
use tracing::{debug, warn};

use keel_core::{
    Condition, ConditionReason, ConditionStatus, EventReason, EventType, InvolvedObject, TrackingObject, TrackingStatus,
};
use keel_kubehub::{ClusterApi, ClusterError, EventRecorder};

pub struct StatusReporter {
    cluster: Arc<dyn ClusterApi>,
    recorder: EventRecorder,
}

impl StatusReporter {
    pub fn new(cluster: Arc<dyn ClusterApi>, recorder: EventRecorder) -> Self {
        Self { cluster, recorder }
    }

    pub async fn in_sync(&self, tracking: &TrackingObject) -> Result<(), ClusterError> {
        self.report(tracking, ConditionStatus::True, ConditionReason::ChildAppliedSuccess, String::new()).await
    }

    pub async fn failed(
        &self,
        tracking: &TrackingObject,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Result<(), ClusterError> {
        self.report(tracking, ConditionStatus::False, reason, message.into()).await
    }

    /// Replace the condition, keeping its transition time when status and reason hold.
    /// An identical condition is not written again.
    async fn report(
        &self,
        tracking: &TrackingObject,
        status: ConditionStatus,
        reason: ConditionReason,
        message: String,
    ) -> Result<(), ClusterError> {
        let Some(reference) = tracking.tracking_ref() else {
            return Err(ClusterError::MissingField("metadata.name"));
        };
        let previous = tracking.in_sync_condition();
        let condition = Condition::in_sync(status, reason, message).carry_transition_time(previous);

        gauge!(
            "in_sync",
            if status == ConditionStatus::True { 1.0 } else { 0.0 },
            "kind" => tracking.spec.kind.clone(),
            "name" => tracking.spec.name.clone(),
            "namespace" => tracking.metadata.namespace.clone().unwrap_or_default()
        );

        if previous == Some(&condition) {
            debug!(tracking = %reference, reason = %reason, "condition unchanged");
            return Ok(());
        }
        let next = TrackingStatus { conditions: vec![condition] };
        if let Err(e) = self.cluster.update_tracking_status(&reference, &next).await {
            warn!(tracking = %reference, error = %e, "status update failed");
            return Err(e);
        }
        Ok(())
    }

    /// Warning event on the tracking object itself: there is no child to point at.
    pub async fn decode_failed(&self, tracking: &TrackingObject, message: &str) {
        let involved = InvolvedObject {
            api_version: tracking.api_version.clone(),
            kind: tracking.kind.clone(),
            name: tracking.metadata.name.clone().unwrap_or_default(),
            namespace: tracking.metadata.namespace.clone(),
        };
        self.recorder
            .record(involved, EventType::Warning, EventReason::DecodeFailed, format!("unable to decode desired object: {message}"))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_core::{DesiredObjectRecord, TrackingRef, API_VERSION, TRACK_OBJECT_KIND};
    use keel_kubehub::MockCluster;

    fn reporter(mock: &MockCluster) -> StatusReporter {
        let cluster: Arc<dyn ClusterApi> = Arc::new(mock.clone());
        StatusReporter::new(cluster.clone(), EventRecorder::new(cluster, None))
    }

    fn stored(mock: &MockCluster) -> TrackingObject {
        mock.put_tracking(TrackingObject {
            api_version: API_VERSION.into(),
            kind: TRACK_OBJECT_KIND.into(),
            metadata: ObjectMeta { name: Some("t".into()), namespace: Some("default".into()), ..Default::default() },
            spec: DesiredObjectRecord { name: "cm".into(), kind: "ConfigMap".into(), data: Vec::new() },
            status: None,
        })
        .expect("put")
    }

    #[tokio::test]
    async fn identical_condition_is_written_once() {
        let mock = MockCluster::new();
        let r = reporter(&mock);
        let reference = TrackingRef::namespaced("default", "t");

        r.in_sync(&stored(&mock)).await.expect("status");
        let first = mock.tracking(&reference).expect("tracking");
        let cond = first.in_sync_condition().expect("condition").clone();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, "ChildAppliedSuccess");
        assert_eq!(cond.message, "");

        let rv = first.metadata.resource_version.clone();
        r.in_sync(&first).await.expect("status");
        let second = mock.tracking(&reference).expect("tracking");
        assert_eq!(second.metadata.resource_version, rv);
        assert_eq!(second.status.expect("status").conditions.len(), 1);
    }

    #[tokio::test]
    async fn failure_replaces_condition_and_moves_transition_time() {
        let mock = MockCluster::new();
        let r = reporter(&mock);
        let reference = TrackingRef::namespaced("default", "t");

        r.in_sync(&stored(&mock)).await.expect("status");
        let ok = mock.tracking(&reference).expect("tracking");
        r.failed(&ok, ConditionReason::ErrorUpdatingChild, "boom").await.expect("status");

        let failed = mock.tracking(&reference).expect("tracking");
        let conditions = failed.status.as_ref().expect("status").conditions.clone();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].reason, "ErrorUpdatingChild");
        assert_eq!(conditions[0].message, "boom");
        assert!(conditions[0].last_transition_time >= ok.in_sync_condition().expect("cond").last_transition_time);
    }

    #[tokio::test]
    async fn decode_failure_event_targets_tracking_object() {
        let mock = MockCluster::new();
        let r = reporter(&mock);
        r.decode_failed(&stored(&mock), "bad yaml").await;
        let events = mock.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, EventReason::DecodeFailed);
        assert_eq!(events[0].involved.kind, TRACK_OBJECT_KIND);
        assert_eq!(events[0].involved.namespace.as_deref(), Some("default"));
    }
}
