//! One reconcile: refetch the tracking object, decode its document, make the child match.

use std::sync::Arc;

use tracing::{debug, info, warn};

use keel_apply::{
    decode_with, resource_state, update_strategy, AnnotationError, ApplyEngine, ApplyError, ApplyOutcome, ApplyRequest,
    DecodeError,
};
use keel_core::{ConditionReason, TrackingObject, TrackingRef};
use keel_kubehub::{ClusterApi, ClusterError, EventRecorder};

use crate::config::ControllerConfig;
use crate::status::StatusReporter;
use crate::watch::DynamicWatchManager;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("unable to fetch tracking object: {0}")]
    Fetch(#[source] ClusterError),
    #[error("unable to decode desired object: {0}")]
    Decode(#[source] DecodeError),
    #[error("unable to watch child kind: {0}")]
    Watch(#[source] ClusterError),
    #[error("unable to get update strategy: {0}")]
    Strategy(#[source] AnnotationError),
    #[error("unable to get resource state: {0}")]
    State(#[source] AnnotationError),
    #[error("unable to update tracking status: {0}")]
    Status(#[source] ClusterError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl ReconcileError {
    pub fn reason(&self) -> ConditionReason {
        match self {
            ReconcileError::Fetch(_) => ConditionReason::ErrorGettingChild,
            ReconcileError::Decode(_) => ConditionReason::ErrorDecodingData,
            ReconcileError::Watch(_) => ConditionReason::ErrorWatchingChild,
            ReconcileError::Strategy(_) | ReconcileError::State(_) => ConditionReason::ErrorUpdatingChild,
            ReconcileError::Status(_) => ConditionReason::ErrorUpdatingStatus,
            ReconcileError::Apply(e) => e.reason(),
        }
    }

    /// Whether re-queueing with backoff can help. Terminal errors wait for the
    /// tracking object to change.
    pub fn is_retryable(&self) -> bool {
        match self {
            // An unreadable tracking object waits for its next edit.
            ReconcileError::Fetch(ClusterError::Serialization(_)) => false,
            ReconcileError::Fetch(_) | ReconcileError::Watch(_) | ReconcileError::Status(_) => true,
            ReconcileError::Decode(_) | ReconcileError::Strategy(_) | ReconcileError::State(_) => false,
            ReconcileError::Apply(e) => e.is_retryable(),
        }
    }
}

/// What a worker does with the key afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The tracking object no longer exists.
    Gone,
    /// The child's kind is excluded by configuration.
    Ignored,
    Done(ApplyOutcome),
}

impl Reconciled {
    pub fn is_pending(&self) -> bool {
        matches!(self, Reconciled::Done(outcome) if outcome.is_pending())
    }
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    cfg: ControllerConfig,
    engine: ApplyEngine,
    status: StatusReporter,
    watches: Arc<DynamicWatchManager>,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, cfg: ControllerConfig, watches: Arc<DynamicWatchManager>) -> Self {
        let recorder = EventRecorder::new(cluster.clone(), cfg.namespace.clone());
        let engine = ApplyEngine::new(cluster.clone(), recorder.clone(), cfg.create_owner_reference);
        let status = StatusReporter::new(cluster.clone(), recorder);
        Self { cluster, cfg, engine, status, watches }
    }

    pub async fn reconcile(&self, key: &TrackingRef) -> Result<Reconciled, ReconcileError> {
        let Some(tracking) = self.cluster.get_tracking(key).await.map_err(ReconcileError::Fetch)? else {
            debug!(tracking = %key, "tracking object gone");
            return Ok(Reconciled::Gone);
        };
        let result = self.converge(&tracking).await;
        match &result {
            Ok(Reconciled::Done(outcome)) if outcome.is_pending() => {
                debug!(tracking = %key, ?outcome, "child transition in progress");
            }
            Ok(Reconciled::Done(_)) => {
                self.status.in_sync(&tracking).await.map_err(ReconcileError::Status)?;
            }
            Ok(_) => {}
            Err(e) => {
                if let ReconcileError::Decode(d) = e {
                    self.status.decode_failed(&tracking, &d.to_string()).await;
                }
                if let Err(status_err) = self.status.failed(&tracking, e.reason(), e.to_string()).await {
                    warn!(tracking = %key, error = %status_err, "unable to report failure");
                }
            }
        }
        result
    }

    async fn converge(&self, tracking: &TrackingObject) -> Result<Reconciled, ReconcileError> {
        let desired = decode_with(&tracking.spec.data, &self.cfg.decode_limits).map_err(ReconcileError::Decode)?;
        let kind = self.cluster.resolve(&desired.gvk).await.map_err(ReconcileError::Watch)?;
        if self.cfg.is_ignored(&kind.gvk.group, &kind.gvk.version, kind.plural()) {
            debug!(gvk = %kind.key(), name = desired.name(), "kind ignored by configuration");
            return Ok(Reconciled::Ignored);
        }
        self.watches.ensure(&desired.gvk).await.map_err(ReconcileError::Watch)?;

        let strategy = update_strategy(&desired).map_err(ReconcileError::Strategy)?;
        let state = resource_state(&desired).map_err(ReconcileError::State)?;
        let outcome = self.engine.apply(&ApplyRequest { tracking, desired: &desired, kind: &kind, strategy, state }).await?;
        match &outcome {
            ApplyOutcome::Unchanged => debug!(gvk = %kind.key(), name = desired.name(), "child in sync"),
            other => info!(gvk = %kind.key(), name = desired.name(), outcome = ?other, "child reconciled"),
        }
        Ok(Reconciled::Done(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_errors_wrap_with_exact_message() {
        let e = ReconcileError::Strategy(AnnotationError::InvalidStrategy("sometimes".into()));
        assert_eq!(e.to_string(), "unable to get update strategy: invalid update strategy: sometimes");
        assert_eq!(e.reason(), ConditionReason::ErrorUpdatingChild);
        assert!(!e.is_retryable());

        let e = ReconcileError::State(AnnotationError::InvalidState("gone".into()));
        assert_eq!(e.to_string(), "unable to get resource state: invalid resource state: gone");
        assert_eq!(e.reason(), ConditionReason::ErrorUpdatingChild);
    }

    #[test]
    fn decode_errors_are_terminal() {
        let e = ReconcileError::Decode(DecodeError::NotAnObject);
        assert_eq!(e.reason(), ConditionReason::ErrorDecodingData);
        assert!(!e.is_retryable());
    }

    #[test]
    fn transient_cluster_errors_are_retried() {
        let e = ReconcileError::Apply(ApplyError::Get(ClusterError::api(500, "InternalError", "boom")));
        assert_eq!(e.reason(), ConditionReason::ErrorGettingChild);
        assert!(e.is_retryable());
        assert!(ReconcileError::Watch(ClusterError::UnknownKind("example.com/v1/Widget".into())).is_retryable());
    }

    #[test]
    fn status_write_failures_have_their_own_reason() {
        let e = ReconcileError::Status(ClusterError::api(409, "Conflict", "the object has been modified"));
        assert_eq!(e.reason(), ConditionReason::ErrorUpdatingStatus);
        assert_eq!(e.reason().as_str(), "ErrorUpdatingStatus");
        assert!(e.to_string().starts_with("unable to update tracking status: "));
        assert!(e.is_retryable());
    }

    #[test]
    fn unreadable_tracking_object_is_not_retried() {
        let garbled = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e = ReconcileError::Fetch(ClusterError::Serialization(garbled));
        assert_eq!(e.reason(), ConditionReason::ErrorGettingChild);
        assert!(!e.is_retryable());
        assert!(ReconcileError::Fetch(ClusterError::CacheNotSynced("TrackObject")).is_retryable());
    }
}
