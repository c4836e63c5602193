#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_apply::{decode, resource_state, update_strategy, ApplyEngine, ApplyError, ApplyOutcome, ApplyRequest};
use keel_core::{
    annotations::LAST_APPLIED, ConditionReason, DesiredObjectRecord, EventReason, TrackingObject, API_VERSION,
    CLUSTER_TRACK_OBJECT_KIND, TRACK_OBJECT_KIND,
};
use keel_kubehub::{mock::group_owner, ClusterApi, EventRecorder, MockCluster};
use serde_json::json;

const DEPLOYMENT: &str = "apps/v1/Deployment";

fn deployment(app: &str, image: &str, strategy: Option<&str>) -> String {
    let annotations = strategy.map(|s| format!("  annotations:\n    keel.io/update-strategy: {s}\n")).unwrap_or_default();
    format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n{annotations}spec:\n  replicas: 2\n  selector:\n    matchLabels:\n      app: {app}\n  template:\n    metadata:\n      labels:\n        app: {app}\n    spec:\n      containers:\n      - name: web\n        image: {image}\n"
    )
}

fn track_object(mock: &MockCluster, name: &str, yaml: &str) -> TrackingObject {
    let group_uid = mock.add_group("default", "repo");
    mock.put_tracking(TrackingObject {
        api_version: API_VERSION.into(),
        kind: TRACK_OBJECT_KIND.into(),
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            owner_references: Some(vec![group_owner("repo", &group_uid)]),
            ..Default::default()
        },
        spec: DesiredObjectRecord { name: "web".into(), kind: "Deployment".into(), data: yaml.as_bytes().to_vec() },
        status: None,
    })
    .expect("tracking object")
}

fn engine(mock: &MockCluster, link: bool) -> ApplyEngine {
    let cluster: Arc<dyn ClusterApi> = Arc::new(mock.clone());
    ApplyEngine::new(cluster.clone(), EventRecorder::new(cluster, Some("default".into())), link)
}

async fn apply(engine: &ApplyEngine, mock: &MockCluster, tracking: &TrackingObject, yaml: &str) -> Result<ApplyOutcome, ApplyError> {
    let desired = decode(yaml.as_bytes()).expect("decode");
    let kind = mock.resolve(&desired.gvk).await.expect("resolve");
    let req = ApplyRequest {
        tracking,
        desired: &desired,
        kind: &kind,
        strategy: update_strategy(&desired).expect("strategy"),
        state: resource_state(&desired).expect("state"),
    };
    engine.apply(&req).await
}

fn image(mock: &MockCluster) -> String {
    let child = mock.child(DEPLOYMENT, Some("default"), "web").expect("child");
    child.data["spec"]["template"]["spec"]["containers"][0]["image"].as_str().unwrap_or_default().to_string()
}

fn uid(mock: &MockCluster) -> Option<String> {
    mock.child(DEPLOYMENT, Some("default"), "web").and_then(|c| c.metadata.uid)
}

#[tokio::test]
async fn creates_child_owned_by_tracking_object() {
    let mock = MockCluster::new();
    let yaml = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &yaml);
    let engine = engine(&mock, true);

    assert_eq!(apply(&engine, &mock, &tracking, &yaml).await.expect("apply"), ApplyOutcome::Created);
    let child = mock.child(DEPLOYMENT, Some("default"), "web").expect("child");
    let owners = child.metadata.owner_references.clone().unwrap_or_default();
    assert_eq!(owners.len(), 1);
    assert_eq!(Some(owners[0].uid.as_str()), tracking.uid());
    assert_eq!(owners[0].kind, TRACK_OBJECT_KIND);
    assert!(child.metadata.annotations.as_ref().is_some_and(|a| a.contains_key(LAST_APPLIED)));

    let reasons: Vec<_> = mock.events().iter().map(|e| e.reason).collect();
    assert_eq!(reasons, vec![EventReason::CreateStarted, EventReason::CreateSuccessful]);

    // Converged: a second pass sends nothing.
    let rv = child.metadata.resource_version.clone();
    assert_eq!(apply(&engine, &mock, &tracking, &yaml).await.expect("apply"), ApplyOutcome::Unchanged);
    assert_eq!(mock.child(DEPLOYMENT, Some("default"), "web").expect("child").metadata.resource_version, rv);
    assert_eq!(mock.counts().patches, 0);
}

#[tokio::test]
async fn no_owner_reference_when_linking_disabled() {
    let mock = MockCluster::new();
    let yaml = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &yaml);
    apply(&engine(&mock, false), &mock, &tracking, &yaml).await.expect("apply");
    let child = mock.child(DEPLOYMENT, Some("default"), "web").expect("child");
    assert!(child.metadata.owner_references.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn update_strategy_patches_in_place() {
    let mock = MockCluster::new();
    let v1 = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &v1).await.expect("create");
    let before = uid(&mock);

    let v2 = deployment("web", "nginx:2", Some("update"));
    let outcome = apply(&engine, &mock, &tracking, &v2).await.expect("update");
    assert!(matches!(outcome, ApplyOutcome::Updated(_)));
    assert_eq!(image(&mock), "nginx:2");
    assert_eq!(uid(&mock), before);
    assert!(mock.events().iter().any(|e| e.reason == EventReason::UpdateSuccessful));
}

#[tokio::test]
async fn update_strategy_reports_immutable_conflict() {
    let mock = MockCluster::new();
    let v1 = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &v1).await.expect("create");

    let v2 = deployment("other", "nginx:1", Some("update"));
    let err = apply(&engine, &mock, &tracking, &v2).await.unwrap_err();
    assert!(matches!(err, ApplyError::ImmutableFieldConflict(_)));
    assert!(err.is_retryable());
    assert_eq!(err.reason(), ConditionReason::ErrorUpdatingChild);
    assert!(mock.events().iter().any(|e| e.reason == EventReason::UpdateFailed));
    assert!(mock.child(DEPLOYMENT, Some("default"), "web").is_some());
}

#[tokio::test]
async fn recreate_without_conflict_patches_in_place() {
    let mock = MockCluster::new();
    let v1 = deployment("web", "nginx:1", Some("recreate"));
    let tracking = track_object(&mock, "deployment-web", &v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &v1).await.expect("create");
    let before = uid(&mock);

    let v2 = deployment("web", "nginx:2", Some("recreate"));
    assert!(matches!(apply(&engine, &mock, &tracking, &v2).await.expect("patch"), ApplyOutcome::Updated(_)));
    assert_eq!(uid(&mock), before);
    assert_eq!(mock.counts().deletes, 0);
}

#[tokio::test]
async fn recreate_on_immutable_conflict_replaces_child() {
    let mock = MockCluster::new();
    let v1 = deployment("web", "nginx:1", Some("recreate"));
    let tracking = track_object(&mock, "deployment-web", &v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &v1).await.expect("create");
    let before = uid(&mock);

    mock.hold_deletions(true);
    let v2 = deployment("other", "nginx:1", Some("recreate"));
    assert_eq!(apply(&engine, &mock, &tracking, &v2).await.expect("recreate"), ApplyOutcome::Recreating);
    // Foreground deletion still in flight: nothing else happens.
    assert_eq!(apply(&engine, &mock, &tracking, &v2).await.expect("wait"), ApplyOutcome::AwaitingDeletion);

    mock.finish_deletions();
    assert_eq!(apply(&engine, &mock, &tracking, &v2).await.expect("create again"), ApplyOutcome::Created);
    let child = mock.child(DEPLOYMENT, Some("default"), "web").expect("child");
    assert_ne!(child.metadata.uid, before);
    assert_eq!(child.data["spec"]["selector"]["matchLabels"]["app"], "other");
}

#[tokio::test]
async fn never_strategy_leaves_child_untouched() {
    let mock = MockCluster::new();
    let v1 = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &v1).await.expect("create");

    let v2 = deployment("web", "nginx:2", Some("never"));
    assert_eq!(apply(&engine, &mock, &tracking, &v2).await.expect("never"), ApplyOutcome::Unchanged);
    assert_eq!(image(&mock), "nginx:1");
    assert_eq!(mock.counts().patches, 0);
}

#[tokio::test]
async fn never_strategy_still_creates_missing_child() {
    let mock = MockCluster::new();
    let yaml = deployment("web", "nginx:1", Some("never"));
    let tracking = track_object(&mock, "deployment-web", &yaml);
    assert_eq!(apply(&engine(&mock, true), &mock, &tracking, &yaml).await.expect("create"), ApplyOutcome::Created);
}

#[tokio::test]
async fn marked_for_deletion_removes_child() {
    let mock = MockCluster::new();
    let v1 = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &v1).await.expect("create");

    let marked = v1.replace("metadata:\n  name: web\n", "metadata:\n  name: web\n  annotations:\n    keel.io/resource-state: marked-for-deletion\n    keel.io/update-strategy: never\n");
    assert_eq!(apply(&engine, &mock, &tracking, &marked).await.expect("delete"), ApplyOutcome::Deleted);
    assert!(mock.child(DEPLOYMENT, Some("default"), "web").is_none());
    assert!(mock.events().iter().any(|e| e.reason == EventReason::DeleteStarted));
    assert_eq!(apply(&engine, &mock, &tracking, &marked).await.expect("absent"), ApplyOutcome::Absent);
}

#[tokio::test]
async fn drift_is_reverted_and_foreign_fields_kept() {
    let mock = MockCluster::new();
    let yaml = deployment("web", "nginx:1", None);
    let tracking = track_object(&mock, "deployment-web", &yaml);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, &yaml).await.expect("create");

    mock.external_patch(
        DEPLOYMENT,
        Some("default"),
        "web",
        &json!({ "metadata": { "labels": { "team": "ops" } }, "spec": { "replicas": 5 } }),
    )
    .expect("drift");
    assert!(matches!(apply(&engine, &mock, &tracking, &yaml).await.expect("revert"), ApplyOutcome::Updated(_)));
    let child = mock.child(DEPLOYMENT, Some("default"), "web").expect("child");
    assert_eq!(child.data["spec"]["replicas"], 2);
    assert_eq!(child.metadata.labels.unwrap_or_default().get("team").map(String::as_str), Some("ops"));
}

#[tokio::test]
async fn fields_dropped_from_desired_are_cleared() {
    let mock = MockCluster::new();
    let v1 = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  a: \"1\"\n  b: \"2\"\n";
    let v2 = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  a: \"1\"\n";
    let tracking = track_object(&mock, "configmap-settings", v1);
    let engine = engine(&mock, true);
    apply(&engine, &mock, &tracking, v1).await.expect("create");
    apply(&engine, &mock, &tracking, v2).await.expect("update");
    let cm = mock.child("v1/ConfigMap", Some("default"), "settings").expect("cm");
    assert_eq!(cm.data["data"], json!({ "a": "1" }));
}

#[tokio::test]
async fn scope_violations_are_terminal() {
    let mock = MockCluster::new();
    let crb = "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRoleBinding\nmetadata:\n  name: admins\nroleRef:\n  apiGroup: rbac.authorization.k8s.io\n  kind: ClusterRole\n  name: admin\n";
    let tracking = track_object(&mock, "crb-admins", crb);
    let engine = engine(&mock, true);
    let err = apply(&engine, &mock, &tracking, crb).await.unwrap_err();
    assert!(matches!(err, ApplyError::ScopeMismatch(_)));
    assert!(!err.is_retryable());
    assert_eq!(err.reason(), ConditionReason::ErrorCreatingChild);

    let elsewhere = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: kube-system\n";
    let err = apply(&engine, &mock, &tracking, elsewhere).await.unwrap_err();
    assert!(matches!(err, ApplyError::ScopeMismatch(_)));
    assert_eq!(mock.counts().creates, 0);
}

#[tokio::test]
async fn cluster_tracking_object_manages_cluster_scoped_child() {
    let mock = MockCluster::new();
    let crb = "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRoleBinding\nmetadata:\n  name: admins\nroleRef:\n  apiGroup: rbac.authorization.k8s.io\n  kind: ClusterRole\n  name: admin\n";
    let group_uid = mock.add_group("default", "repo");
    let tracking = mock
        .put_tracking(TrackingObject {
            api_version: API_VERSION.into(),
            kind: CLUSTER_TRACK_OBJECT_KIND.into(),
            metadata: ObjectMeta {
                name: Some("clusterrolebinding-admins".into()),
                owner_references: Some(vec![group_owner("repo", &group_uid)]),
                ..Default::default()
            },
            spec: DesiredObjectRecord { name: "admins".into(), kind: "ClusterRoleBinding".into(), data: crb.as_bytes().to_vec() },
            status: None,
        })
        .expect("tracking");
    let engine = engine(&mock, true);
    assert_eq!(apply(&engine, &mock, &tracking, crb).await.expect("create"), ApplyOutcome::Created);
    let child = mock.child("rbac.authorization.k8s.io/v1/ClusterRoleBinding", None, "admins").expect("crb");
    assert_eq!(child.metadata.namespace, None);
    assert_eq!(child.metadata.owner_references.unwrap_or_default()[0].kind, CLUSTER_TRACK_OBJECT_KIND);
    // Events for cluster-scoped children land in the managed namespace.
    assert!(mock.events().iter().all(|e| e.involved.namespace.as_deref() == Some("default")));
}
