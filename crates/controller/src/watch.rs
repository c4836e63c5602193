//! One live watch per Kind, started on first sight and kept until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::core::{DynamicObject, GroupVersionKind};
use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{gvk_key, TrackingRef, TrackingScope};
use keel_kubehub::{ClusterApi, ClusterError, ResolvedKind, WatchTarget};
use keel_store::WorkQueue;

use crate::predicates::OwnershipPredicates;

/// A running watch.
pub struct WatchRegistration {
    pub kind: ResolvedKind,
    pub namespace: Option<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchRegistration {
    pub fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.cancel.is_cancelled()
    }
}

/// How a watched object maps to reconcile requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// A tracking object: gated by its own group owner, enqueued as itself.
    Primary(TrackingScope),
    /// A child: gated by its owner's group, enqueued as its controlling tracking object.
    Child,
}

pub struct DynamicWatchManager {
    cluster: Arc<dyn ClusterApi>,
    predicates: OwnershipPredicates,
    queue: WorkQueue<TrackingRef>,
    namespace: Option<String>,
    registry: Mutex<HashMap<String, WatchRegistration>>,
    shutdown: CancellationToken,
}

impl DynamicWatchManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        queue: WorkQueue<TrackingRef>,
        namespace: Option<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let predicates = OwnershipPredicates::new(cluster.clone());
        Self { cluster, predicates, queue, namespace, registry: Mutex::new(HashMap::new()), shutdown }
    }

    /// Start the watches on both tracking kinds.
    pub async fn start_primary(&self) -> Result<(), ClusterError> {
        for scope in [TrackingScope::Namespaced, TrackingScope::Cluster] {
            self.register(&scope.gvk(), Role::Primary(scope)).await?;
        }
        Ok(())
    }

    /// Make sure a watch on `gvk` is running, starting it if this is the first request.
    /// Concurrent callers for the same kind share one registration.
    pub async fn ensure(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, ClusterError> {
        self.register(gvk, Role::Child).await
    }

    async fn register(&self, gvk: &GroupVersionKind, role: Role) -> Result<ResolvedKind, ClusterError> {
        let key = gvk_key(gvk);
        if let Some(existing) = self.registry.lock().await.get(&key) {
            return Ok(existing.kind.clone());
        }
        let kind = self.cluster.resolve(gvk).await?;

        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&key) {
            return Ok(existing.kind.clone());
        }
        let namespace = if kind.namespaced { self.namespace.clone() } else { None };
        let target = WatchTarget { kind: kind.clone(), namespace: namespace.clone() };
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_watch(
            self.cluster.clone(),
            target,
            role,
            self.predicates.clone(),
            self.queue.clone(),
            cancel.clone(),
        ));
        counter!("watch_started_total", 1u64, "gvk" => key.clone());
        info!(gvk = %key, ns = ?namespace, "watch started");
        registry.insert(key, WatchRegistration { kind: kind.clone(), namespace, cancel, task });
        Ok(kind)
    }

    /// Keys of every registered watch, sorted.
    pub async fn registered(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn is_live(&self, gvk: &GroupVersionKind) -> bool {
        self.registry.lock().await.get(&gvk_key(gvk)).is_some_and(WatchRegistration::is_live)
    }

    /// Cancel every watch and wait for the tasks to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let drained: Vec<(String, WatchRegistration)> = self.registry.lock().await.drain().collect();
        for (key, reg) in drained {
            reg.cancel.cancel();
            if let Err(e) = reg.task.await {
                warn!(gvk = %key, error = %e, "watch task ended abnormally");
            }
        }
        info!("all watches stopped");
    }
}

async fn run_watch(
    cluster: Arc<dyn ClusterApi>,
    target: WatchTarget,
    role: Role,
    predicates: OwnershipPredicates,
    queue: WorkQueue<TrackingRef>,
    cancel: CancellationToken,
) {
    let key = target.kind.key();
    let mut stream = cluster.watch(&target);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                debug!(gvk = %key, event = event.label(), "watch event");
                for obj in event.objects() {
                    route(obj, role, &predicates, &queue, &key).await;
                }
            }
            Some(Err(e)) => warn!(gvk = %key, error = %e, "watch error"),
            None => {
                warn!(gvk = %key, "watch stream ended");
                break;
            }
        }
    }
    debug!(gvk = %key, "watch task exiting");
}

async fn route(obj: &DynamicObject, role: Role, predicates: &OwnershipPredicates, queue: &WorkQueue<TrackingRef>, key: &str) {
    let owners = obj.metadata.owner_references.as_deref().unwrap_or(&[]);
    let name = obj.metadata.name.as_deref().unwrap_or_default();
    let accepted = match role {
        Role::Primary(_) => predicates.direct_owner_in_namespace(owners).await,
        Role::Child => predicates.transitive_owner_in_namespace(owners).await,
    };
    if !accepted {
        counter!("watch_events_dropped_total", 1u64, "gvk" => key.to_string());
        debug!(gvk = %key, name, ns = ?obj.metadata.namespace, "event filtered by ownership");
        return;
    }
    match role {
        Role::Primary(scope) => {
            let reference = match scope {
                TrackingScope::Namespaced => obj.metadata.namespace.clone().map(|ns| TrackingRef::namespaced(ns, name)),
                TrackingScope::Cluster => Some(TrackingRef::cluster(name)),
            };
            if let Some(reference) = reference {
                queue.add(reference);
            }
        }
        Role::Child => {
            let ns = obj.metadata.namespace.as_deref();
            for reference in owners
                .iter()
                .filter(|r| r.controller == Some(true))
                .filter_map(|r| TrackingRef::from_owner(r, ns))
            {
                queue.add(reference);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kubehub::MockCluster;
    use keel_store::QueueConfig;

    fn manager(mock: &MockCluster) -> DynamicWatchManager {
        DynamicWatchManager::new(
            Arc::new(mock.clone()),
            WorkQueue::new(QueueConfig::default()),
            Some("default".into()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn concurrent_ensure_starts_one_watch() {
        let mock = MockCluster::new();
        let mgr = Arc::new(manager(&mock));
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            let gvk = gvk.clone();
            handles.push(tokio::spawn(async move { mgr.ensure(&gvk).await.map(|k| k.key()) }));
        }
        for h in handles {
            assert_eq!(h.await.expect("join").expect("ensure"), "apps/v1/Deployment");
        }
        assert_eq!(mock.counts().watches, 1);
        assert_eq!(mgr.registered().await, vec!["apps/v1/Deployment".to_string()]);
        assert!(mgr.is_live(&gvk).await);
        mgr.stop().await;
        assert!(mgr.registered().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_not_registered() {
        let mock = MockCluster::new();
        let mgr = manager(&mock);
        let err = mgr.ensure(&GroupVersionKind::gvk("example.com", "v1", "Widget")).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownKind(_)));
        assert!(mgr.registered().await.is_empty());
        assert_eq!(mock.counts().watches, 0);
    }

    #[tokio::test]
    async fn primary_watches_cover_both_tracking_kinds() {
        let mock = MockCluster::new();
        let mgr = manager(&mock);
        mgr.start_primary().await.expect("primary");
        assert_eq!(
            mgr.registered().await,
            vec!["keel.io/v1alpha1/ClusterTrackObject".to_string(), "keel.io/v1alpha1/TrackObject".to_string()]
        );
        mgr.stop().await;
    }
}
