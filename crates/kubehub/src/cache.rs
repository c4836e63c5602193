//! Reflector-backed caches of the keel kinds, used by the ownership predicates and resync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        reflector::{store::Writer, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{API_GROUP, GROUP_KIND};

use crate::error::{ClusterError, Result};

pub(crate) fn keel_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(API_GROUP, "v1alpha1", kind), plural)
}

/// One reflector store plus a flag raised after its first full list.
#[derive(Clone)]
pub(crate) struct KindCache {
    label: &'static str,
    store: Store<DynamicObject>,
    ready: Arc<AtomicBool>,
}

impl KindCache {
    /// Spawn the reflector task. `namespace: None` caches the whole cluster.
    pub(crate) fn spawn(
        client: Client,
        label: &'static str,
        resource: ApiResource,
        namespace: Option<&str>,
        shutdown: CancellationToken,
    ) -> Self {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };
        let writer = Writer::<DynamicObject>::new(resource);
        let store = writer.as_reader();
        let ready = Arc::new(AtomicBool::new(false));
        let flag = ready.clone();
        let ns = namespace.map(str::to_string);
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff().reflect(writer);
            futures::pin_mut!(stream);
            info!(kind = label, ns = ?ns, "cache started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    ev = stream.next() => match ev {
                        Some(Ok(Event::Restarted(list))) => {
                            debug!(kind = label, count = list.len(), "cache relisted");
                            flag.store(true, Ordering::Release);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!(kind = label, error = %e, "cache watch error"),
                        None => break,
                    }
                }
            }
            info!(kind = label, "cache stopped");
        });
        Self { label, store, ready }
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<Arc<DynamicObject>>> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(ClusterError::CacheNotSynced(self.label));
        }
        Ok(self.store.state())
    }
}

/// Caches for groups, namespaced and cluster-scoped tracking objects.
#[derive(Clone)]
pub(crate) struct TrackingCache {
    pub(crate) groups: KindCache,
    pub(crate) namespaced: KindCache,
    pub(crate) cluster: KindCache,
}

impl TrackingCache {
    pub(crate) fn spawn(client: Client, namespace: Option<&str>, shutdown: CancellationToken) -> Self {
        Self {
            groups: KindCache::spawn(client.clone(), GROUP_KIND, keel_resource(GROUP_KIND, "tracks"), namespace, shutdown.clone()),
            namespaced: KindCache::spawn(
                client.clone(),
                keel_core::TRACK_OBJECT_KIND,
                keel_resource(keel_core::TRACK_OBJECT_KIND, "trackobjects"),
                namespace,
                shutdown.clone(),
            ),
            cluster: KindCache::spawn(
                client,
                keel_core::CLUSTER_TRACK_OBJECT_KIND,
                keel_resource(keel_core::CLUSTER_TRACK_OBJECT_KIND, "clustertrackobjects"),
                None,
                shutdown,
            ),
        }
    }
}
