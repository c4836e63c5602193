//! `ClusterApi` backed by a live API server through kube-rs.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::{
        events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_core::{gvk_key, ChildEvent, EventType, TrackingObject, TrackingRef, TrackingScope, TrackingStatus};

use crate::cache::{keel_resource, TrackingCache};
use crate::error::{ClusterError, Result};
use crate::{readable_tracking, tracking_from_dynamic, ClusterApi, ResolvedKind, WatchEvent, WatchTarget, FIELD_MANAGER};

pub struct KubeCluster {
    client: Client,
    kinds: RwLock<HashMap<String, ResolvedKind>>,
    cache: TrackingCache,
    reporter: Reporter,
}

impl KubeCluster {
    /// Start the tracking caches. They stop when `shutdown` is cancelled.
    pub fn new(client: Client, namespace: Option<&str>, shutdown: CancellationToken) -> Self {
        info!(ns = ?namespace, "starting tracking caches");
        Self {
            cache: TrackingCache::spawn(client.clone(), namespace, shutdown),
            client,
            kinds: RwLock::new(HashMap::new()),
            reporter: Reporter { controller: FIELD_MANAGER.to_string(), instance: std::env::var("POD_NAME").ok() },
        }
    }

    fn api(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &kind.resource),
            _ => Api::all_with(self.client.clone(), &kind.resource),
        }
    }

    fn tracking_api(&self, reference: &TrackingRef) -> Api<DynamicObject> {
        match (reference.scope, reference.namespace.as_deref()) {
            (TrackingScope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &keel_resource(keel_core::TRACK_OBJECT_KIND, "trackobjects"))
            }
            _ => Api::all_with(
                self.client.clone(),
                &keel_resource(keel_core::CLUSTER_TRACK_OBJECT_KIND, "clustertrackobjects"),
            ),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.kinds.read().await.get(&key) {
            return Ok(hit.clone());
        }
        let (resource, caps) = match discovery::pinned_kind(&self.client, gvk).await {
            Ok(found) => found,
            Err(kube::Error::Discovery(e)) => {
                debug!(gvk = %key, error = %e, "kind not served");
                return Err(ClusterError::UnknownKind(key));
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Err(ClusterError::UnknownKind(key)),
            Err(e) => return Err(e.into()),
        };
        let resolved = ResolvedKind { gvk: gvk.clone(), resource, namespaced: matches!(caps.scope, Scope::Namespaced) };
        self.kinds.write().await.insert(key, resolved.clone());
        Ok(resolved)
    }

    async fn get(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.api(kind, namespace).get_opt(name).await?)
    }

    async fn create(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        Ok(self.api(kind, obj.metadata.namespace.as_deref()).create(&pp, obj).await?)
    }

    async fn patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        Ok(self.api(kind, namespace).patch(name, &pp, &Patch::Merge(patch)).await?)
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()> {
        match self.api(kind, namespace).delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_tracking(&self, reference: &TrackingRef) -> Result<Option<TrackingObject>> {
        match self.tracking_api(reference).get_opt(&reference.name).await? {
            Some(obj) => Ok(Some(tracking_from_dynamic(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list_tracking(&self, scope: TrackingScope) -> Result<Vec<TrackingObject>> {
        let cache = match scope {
            TrackingScope::Namespaced => &self.cache.namespaced,
            TrackingScope::Cluster => &self.cache.cluster,
        };
        let snapshot = cache.snapshot()?;
        Ok(readable_tracking(snapshot.iter().map(|o| &**o)))
    }

    async fn list_groups(&self) -> Result<Vec<ObjectMeta>> {
        Ok(self.cache.groups.snapshot()?.iter().map(|o| o.metadata.clone()).collect())
    }

    async fn update_tracking_status(&self, reference: &TrackingRef, status: &TrackingStatus) -> Result<()> {
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let patch = json!({ "status": status });
        self.tracking_api(reference).patch_status(&reference.name, &pp, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn publish_event(&self, event: &ChildEvent) -> Result<()> {
        let reference = ObjectReference {
            api_version: Some(event.involved.api_version.clone()),
            kind: Some(event.involved.kind.clone()),
            name: Some(event.involved.name.clone()),
            namespace: event.involved.namespace.clone(),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let type_ = match event.type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };
        recorder
            .publish(KubeEvent {
                type_,
                reason: event.reason.as_str().to_string(),
                note: Some(event.note.clone()),
                action: event.reason.action().to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }

    fn watch(&self, target: &WatchTarget) -> BoxStream<'static, Result<WatchEvent>> {
        let api = self.api(&target.kind, target.namespace.as_deref());
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|ev| {
                ev.map(|ev| match ev {
                    Event::Applied(o) => WatchEvent::Applied(o),
                    Event::Deleted(o) => WatchEvent::Deleted(o),
                    Event::Restarted(list) => WatchEvent::Restarted(list),
                })
                .map_err(ClusterError::from)
            })
            .boxed()
    }
}
