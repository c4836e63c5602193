//! Fail-closed ownership filters applied to every watch event before it is enqueued.
//!
//! Both predicates read the controller's caches. When the controller is restricted
//! to a namespace those caches only hold that namespace's `Track` groups, so a chain
//! ending at a group elsewhere finds nothing and is rejected.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::debug;

use keel_core::{TrackingScope, API_VERSION, CLUSTER_TRACK_OBJECT_KIND, GROUP_KIND, TRACK_OBJECT_KIND};
use keel_kubehub::ClusterApi;

#[derive(Clone)]
pub struct OwnershipPredicates {
    cluster: Arc<dyn ClusterApi>,
}

fn is_keel_owner(r: &OwnerReference, kind: &str) -> bool {
    r.kind == kind && r.api_version == API_VERSION
}

impl OwnershipPredicates {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// True iff one of `owners` is a visible `Track` group.
    pub async fn direct_owner_in_namespace(&self, owners: &[OwnerReference]) -> bool {
        if !owners.iter().any(|r| is_keel_owner(r, GROUP_KIND)) {
            return false;
        }
        let groups = match self.cluster.list_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                debug!(error = %e, "cannot list groups; rejecting event");
                return false;
            }
        };
        owners
            .iter()
            .filter(|r| is_keel_owner(r, GROUP_KIND))
            .any(|r| groups.iter().any(|g| g.uid.as_deref() == Some(r.uid.as_str())))
    }

    /// True iff the tracking object owning this object is itself owned by a visible group.
    ///
    /// The first owner reference that resolves to a cached tracking object decides.
    pub async fn transitive_owner_in_namespace(&self, owners: &[OwnerReference]) -> bool {
        for r in owners {
            let scope = if is_keel_owner(r, TRACK_OBJECT_KIND) {
                TrackingScope::Namespaced
            } else if is_keel_owner(r, CLUSTER_TRACK_OBJECT_KIND) {
                TrackingScope::Cluster
            } else {
                continue;
            };
            let candidates = match self.cluster.list_tracking(scope).await {
                Ok(list) => list,
                Err(e) => {
                    debug!(error = %e, kind = scope.kind(), "cannot list tracking objects; rejecting event");
                    return false;
                }
            };
            if let Some(owner) = candidates.iter().find(|t| t.uid() == Some(r.uid.as_str())) {
                return self.direct_owner_in_namespace(owner.owner_references()).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_core::{DesiredObjectRecord, TrackingObject};
    use keel_kubehub::{mock::group_owner, MockCluster};

    fn tracking(kind: &str, ns: Option<&str>, name: &str, owner: OwnerReference) -> TrackingObject {
        TrackingObject {
            api_version: API_VERSION.into(),
            kind: kind.into(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: ns.map(Into::into),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: DesiredObjectRecord::default(),
            status: None,
        }
    }

    fn owner_ref(kind: &str, name: &str, uid: &str) -> OwnerReference {
        OwnerReference { kind: kind.into(), ..group_owner(name, uid) }
    }

    #[tokio::test]
    async fn direct_owner_accepts_only_visible_groups() {
        let mock = MockCluster::new().restricted_to("team-a");
        let mine = mock.add_group("team-a", "repo");
        let theirs = mock.add_group("team-b", "repo");
        let p = OwnershipPredicates::new(Arc::new(mock.clone()));

        assert!(p.direct_owner_in_namespace(&[group_owner("repo", &mine)]).await);
        assert!(!p.direct_owner_in_namespace(&[group_owner("repo", &theirs)]).await);
        assert!(!p.direct_owner_in_namespace(&[]).await);
        // Right UID, wrong kind.
        assert!(!p.direct_owner_in_namespace(&[owner_ref("ReplicaSet", "repo", &mine)]).await);
    }

    #[tokio::test]
    async fn transitive_owner_walks_two_hops() {
        let mock = MockCluster::new().restricted_to("team-a");
        let mine = mock.add_group("team-a", "repo");
        let theirs = mock.add_group("team-b", "repo");
        let p = OwnershipPredicates::new(Arc::new(mock.clone()));

        let cluster_ok = mock.put_tracking(tracking(CLUSTER_TRACK_OBJECT_KIND, None, "ok", group_owner("repo", &mine))).expect("put");
        let cluster_foreign =
            mock.put_tracking(tracking(CLUSTER_TRACK_OBJECT_KIND, None, "foreign", group_owner("repo", &theirs))).expect("put");
        let ns_ok = mock.put_tracking(tracking(TRACK_OBJECT_KIND, Some("team-a"), "ok", group_owner("repo", &mine))).expect("put");

        let child_of = |t: &TrackingObject| owner_ref(&t.kind, t.metadata.name.as_deref().unwrap_or_default(), t.uid().unwrap_or_default());
        assert!(p.transitive_owner_in_namespace(&[child_of(&cluster_ok)]).await);
        assert!(p.transitive_owner_in_namespace(&[child_of(&ns_ok)]).await);
        assert!(!p.transitive_owner_in_namespace(&[child_of(&cluster_foreign)]).await);
        // Unknown tracking object UID.
        assert!(!p.transitive_owner_in_namespace(&[owner_ref(TRACK_OBJECT_KIND, "ghost", "nope")]).await);
        // A group is not a tracking object.
        assert!(!p.transitive_owner_in_namespace(&[group_owner("repo", &mine)]).await);
    }

    #[tokio::test]
    async fn lookup_failures_fail_closed() {
        let mock = MockCluster::new();
        let uid = mock.add_group("default", "repo");
        let t = mock.put_tracking(tracking(TRACK_OBJECT_KIND, Some("default"), "t", group_owner("repo", &uid))).expect("put");
        let p = OwnershipPredicates::new(Arc::new(mock.clone()));
        let child = [owner_ref(TRACK_OBJECT_KIND, "t", t.uid().unwrap_or_default())];
        assert!(p.transitive_owner_in_namespace(&child).await);

        mock.fail_lists(true);
        assert!(!p.direct_owner_in_namespace(&[group_owner("repo", &uid)]).await);
        assert!(!p.transitive_owner_in_namespace(&child).await);
    }
}
