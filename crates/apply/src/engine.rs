//! The create / patch / delete / recreate state machine for one child.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use keel_core::{annotations::LAST_APPLIED, ConditionReason, EventReason, EventType, InvolvedObject, TrackingObject, TrackingScope};
use keel_kubehub::{ClusterApi, ClusterError, EventRecorder, ResolvedKind};

use crate::annotations::{ResourceState, UpdateStrategy};
use crate::decode::DecodedObject;
use crate::merge::{is_empty_patch, patch_summary, three_way_merge_patch, DiffSummary};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("unable to get child: {0}")]
    Get(#[source] ClusterError),
    #[error("unable to create child: {0}")]
    Create(#[source] ClusterError),
    #[error("unable to update child: {0}")]
    Update(#[source] ClusterError),
    #[error("unable to update child, immutable field changed: {0}")]
    ImmutableFieldConflict(#[source] ClusterError),
    #[error("unable to delete child: {0}")]
    Delete(#[source] ClusterError),
    #[error("{0}")]
    ScopeMismatch(String),
    #[error("unable to serialize child: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ApplyError {
    pub fn reason(&self) -> ConditionReason {
        match self {
            ApplyError::Get(_) => ConditionReason::ErrorGettingChild,
            ApplyError::Create(_) | ApplyError::ScopeMismatch(_) => ConditionReason::ErrorCreatingChild,
            ApplyError::Update(_) | ApplyError::ImmutableFieldConflict(_) | ApplyError::Serialize(_) => {
                ConditionReason::ErrorUpdatingChild
            }
            ApplyError::Delete(_) => ConditionReason::ErrorDeletingChild,
        }
    }

    /// Whether backing off and trying again can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplyError::ScopeMismatch(_) | ApplyError::Serialize(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated(DiffSummary),
    Unchanged,
    /// Marked for deletion: the child was deleted (or its deletion is already under way).
    Deleted,
    /// Marked for deletion and no child exists.
    Absent,
    /// Immutable-field conflict under `recreate`: deletion issued, creation follows.
    Recreating,
    /// The child is terminating; nothing to do until it is gone.
    AwaitingDeletion,
}

impl ApplyOutcome {
    /// The reconcile is finished for now but must run again to converge.
    pub fn is_pending(&self) -> bool {
        matches!(self, ApplyOutcome::Recreating | ApplyOutcome::AwaitingDeletion)
    }
}

/// One reconcile's worth of input.
pub struct ApplyRequest<'a> {
    pub tracking: &'a TrackingObject,
    pub desired: &'a DecodedObject,
    pub kind: &'a ResolvedKind,
    pub strategy: UpdateStrategy,
    pub state: ResourceState,
}

pub struct ApplyEngine {
    cluster: Arc<dyn ClusterApi>,
    recorder: EventRecorder,
    create_owner_reference: bool,
}

impl ApplyEngine {
    pub fn new(cluster: Arc<dyn ClusterApi>, recorder: EventRecorder, create_owner_reference: bool) -> Self {
        Self { cluster, recorder, create_owner_reference }
    }

    /// Fill in what the desired document leaves implicit: scope-checked namespace,
    /// the controller owner reference, and the last-applied annotation.
    pub fn prepare(&self, req: &ApplyRequest<'_>) -> Result<DynamicObject, ApplyError> {
        let mut child = req.desired.object.clone();
        let name = req.desired.name();
        match req.tracking.scope() {
            Some(TrackingScope::Namespaced) => {
                let tracking_ns = req.tracking.metadata.namespace.as_deref().unwrap_or_default();
                if !req.kind.namespaced {
                    return Err(ApplyError::ScopeMismatch(format!(
                        "{} cannot manage cluster-scoped {} {name}",
                        keel_core::TRACK_OBJECT_KIND,
                        req.kind.gvk.kind
                    )));
                }
                match req.desired.namespace() {
                    Some(ns) if !ns.is_empty() && ns != tracking_ns => {
                        return Err(ApplyError::ScopeMismatch(format!(
                            "{} {name} is in namespace {ns}, expected {tracking_ns}",
                            req.kind.gvk.kind
                        )));
                    }
                    _ => child.metadata.namespace = Some(tracking_ns.to_string()),
                }
            }
            Some(TrackingScope::Cluster) => {
                if req.kind.namespaced {
                    return Err(ApplyError::ScopeMismatch(format!(
                        "{} cannot manage namespaced {} {name}",
                        keel_core::CLUSTER_TRACK_OBJECT_KIND,
                        req.kind.gvk.kind
                    )));
                }
                child.metadata.namespace = None;
            }
            None => return Err(ApplyError::ScopeMismatch(format!("unknown tracking kind {}", req.tracking.kind))),
        }
        if self.create_owner_reference {
            if let Some(owner) = req.tracking.as_owner() {
                set_controller_owner(&mut child, owner);
            }
        }
        if let Some(annos) = child.metadata.annotations.as_mut() {
            annos.remove(LAST_APPLIED);
        }
        let last_applied = serde_json::to_string(&child)?;
        child.metadata.annotations.get_or_insert_with(Default::default).insert(LAST_APPLIED.to_string(), last_applied);
        Ok(child)
    }

    pub async fn apply(&self, req: &ApplyRequest<'_>) -> Result<ApplyOutcome, ApplyError> {
        let desired = self.prepare(req)?;
        let kind = req.kind;
        let name = req.desired.name();
        let ns = desired.metadata.namespace.as_deref();
        let current = self.cluster.get(kind, ns, name).await.map_err(ApplyError::Get)?;

        if req.state == ResourceState::MarkedForDeletion {
            return match current {
                None => Ok(ApplyOutcome::Absent),
                Some(c) if c.metadata.deletion_timestamp.is_some() => Ok(ApplyOutcome::Deleted),
                Some(_) => self.delete(req, &desired, "child marked for deletion").await.map(|_| ApplyOutcome::Deleted),
            };
        }

        let Some(current) = current else {
            return self.create(req, &desired).await;
        };
        if current.metadata.deletion_timestamp.is_some() {
            debug!(kind = %kind.gvk.kind, name, "child terminating; waiting for removal");
            return Ok(ApplyOutcome::AwaitingDeletion);
        }
        if req.strategy == UpdateStrategy::Never {
            debug!(kind = %kind.gvk.kind, name, "update strategy never; leaving child untouched");
            return Ok(ApplyOutcome::Unchanged);
        }
        self.update(req, &desired, &current).await
    }

    async fn create(&self, req: &ApplyRequest<'_>, desired: &DynamicObject) -> Result<ApplyOutcome, ApplyError> {
        let name = req.desired.name();
        self.event(req, desired, EventType::Normal, EventReason::CreateStarted, format!("creating child {name}")).await;
        match self.cluster.create(req.kind, desired).await {
            Ok(created) => {
                counter!("apply_create_total", 1u64, "kind" => req.kind.gvk.kind.clone());
                info!(kind = %req.kind.gvk.kind, name, uid = ?created.metadata.uid, "child created");
                self.event(req, desired, EventType::Normal, EventReason::CreateSuccessful, format!("created child {name}")).await;
                Ok(ApplyOutcome::Created)
            }
            Err(e) => {
                warn!(kind = %req.kind.gvk.kind, name, error = %e, "create failed");
                self.event(req, desired, EventType::Warning, EventReason::CreateFailed, format!("failed to create child {name}: {e}"))
                    .await;
                Err(ApplyError::Create(e))
            }
        }
    }

    async fn update(
        &self,
        req: &ApplyRequest<'_>,
        desired: &DynamicObject,
        current: &DynamicObject,
    ) -> Result<ApplyOutcome, ApplyError> {
        let name = req.desired.name();
        let original: Option<Json> = current
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LAST_APPLIED))
            .and_then(|raw| match serde_json::from_str(raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!(name, error = %e, "ignoring unreadable last-applied annotation");
                    None
                }
            });
        let modified = serde_json::to_value(desired)?;
        let live = serde_json::to_value(current)?;
        let patch = three_way_merge_patch(original.as_ref(), &modified, &live);
        if is_empty_patch(&patch) {
            debug!(kind = %req.kind.gvk.kind, name, "child in sync");
            return Ok(ApplyOutcome::Unchanged);
        }
        let summary = patch_summary(&patch, &live);
        let ns = desired.metadata.namespace.as_deref();
        match self.cluster.patch(req.kind, ns, name, &patch).await {
            Ok(_) => {
                counter!("apply_patch_total", 1u64, "kind" => req.kind.gvk.kind.clone());
                info!(kind = %req.kind.gvk.kind, name, %summary, "child updated");
                self.event(req, desired, EventType::Normal, EventReason::UpdateSuccessful, format!("updated child {name}: {summary}")).await;
                Ok(ApplyOutcome::Updated(summary))
            }
            Err(e) if e.is_invalid() && req.strategy == UpdateStrategy::Recreate => {
                info!(kind = %req.kind.gvk.kind, name, error = %e, "immutable field changed; recreating child");
                self.delete(req, desired, "recreating child after immutable field change").await?;
                Ok(ApplyOutcome::Recreating)
            }
            Err(e) => {
                warn!(kind = %req.kind.gvk.kind, name, error = %e, "update failed");
                self.event(req, desired, EventType::Warning, EventReason::UpdateFailed, format!("failed to update child {name}: {e}"))
                    .await;
                if e.is_invalid() {
                    Err(ApplyError::ImmutableFieldConflict(e))
                } else {
                    Err(ApplyError::Update(e))
                }
            }
        }
    }

    async fn delete(&self, req: &ApplyRequest<'_>, desired: &DynamicObject, why: &str) -> Result<(), ApplyError> {
        let name = req.desired.name();
        self.event(req, desired, EventType::Normal, EventReason::DeleteStarted, format!("deleting child {name}: {why}")).await;
        match self.cluster.delete(req.kind, desired.metadata.namespace.as_deref(), name).await {
            Ok(()) => {
                counter!("apply_delete_total", 1u64, "kind" => req.kind.gvk.kind.clone());
                info!(kind = %req.kind.gvk.kind, name, why, "child deletion issued");
                Ok(())
            }
            Err(e) => {
                warn!(kind = %req.kind.gvk.kind, name, error = %e, "delete failed");
                self.event(req, desired, EventType::Warning, EventReason::DeleteFailed, format!("failed to delete child {name}: {e}"))
                    .await;
                Err(ApplyError::Delete(e))
            }
        }
    }

    async fn event(&self, req: &ApplyRequest<'_>, child: &DynamicObject, type_: EventType, reason: EventReason, note: String) {
        let involved = InvolvedObject {
            api_version: req.desired.api_version(),
            kind: req.kind.gvk.kind.clone(),
            name: req.desired.name().to_string(),
            namespace: child.metadata.namespace.clone(),
        };
        self.recorder.record(involved, type_, reason, note).await;
    }
}

/// Replace any controller reference with `owner`, keeping other owners.
fn set_controller_owner(obj: &mut DynamicObject, owner: OwnerReference) {
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true) && r.uid != owner.uid);
    refs.push(owner);
}
