//! In-memory `ClusterApi` for tests: objects, discovery, watches and events without
//! an API server.
//!
//! It imitates the server behaviour the engine depends on: UIDs and resource
//! versions are assigned on write, a no-op patch leaves the resourceVersion alone,
//! registered immutable fields reject changes with 422 `Invalid`, and deletions can
//! be held in a terminating state to mimic foreground deletion.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use serde_json::Value as Json;
use tokio::sync::broadcast;

use keel_core::{
    gvk_key, ChildEvent, TrackingObject, TrackingRef, TrackingScope, TrackingStatus, API_VERSION, GROUP_KIND,
};

use crate::error::{ClusterError, Result};
use crate::merge::apply_merge_patch;
use crate::{readable_tracking, tracking_from_dynamic, ClusterApi, ResolvedKind, WatchEvent, WatchTarget};

type ObjectKey = (String, Option<String>, String);

/// Calls the engine made against the mock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub creates: usize,
    pub patches: usize,
    pub deletes: usize,
    pub status_updates: usize,
    pub watches: usize,
}

struct MockKind {
    resolved: ResolvedKind,
    /// JSON pointers the server refuses to change once set.
    immutable: Vec<String>,
}

#[derive(Clone)]
struct Broadcast {
    kind: String,
    namespace: Option<String>,
    event: WatchEvent,
}

#[derive(Default)]
struct MockState {
    kinds: HashMap<String, MockKind>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    namespace: Option<String>,
    next_rv: u64,
    hold_deletions: bool,
    fail_lists: bool,
    events: Vec<ChildEvent>,
    counts: OperationCounts,
}

#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
    tx: broadcast::Sender<Broadcast>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Mock serving the keel kinds plus ConfigMap, Service, Deployment and ClusterRoleBinding.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        let mock = Self { state: Arc::new(Mutex::new(MockState::default())), tx };
        mock.with_kind("keel.io", "v1alpha1", GROUP_KIND, "tracks", true, &[])
            .with_kind("keel.io", "v1alpha1", keel_core::TRACK_OBJECT_KIND, "trackobjects", true, &[])
            .with_kind("keel.io", "v1alpha1", keel_core::CLUSTER_TRACK_OBJECT_KIND, "clustertrackobjects", false, &[])
            .with_kind("", "v1", "ConfigMap", "configmaps", true, &[])
            .with_kind("", "v1", "Service", "services", true, &["/spec/clusterIP"])
            .with_kind("apps", "v1", "Deployment", "deployments", true, &["/spec/selector"])
            .with_kind("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false, &["/roleRef"])
    }

    /// Register a served kind.
    pub fn with_kind(self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool, immutable: &[&str]) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, plural);
        let mock_kind = MockKind {
            resolved: ResolvedKind { gvk: gvk.clone(), resource, namespaced },
            immutable: immutable.iter().map(|p| p.to_string()).collect(),
        };
        self.state().kinds.insert(gvk_key(&gvk), mock_kind);
        self
    }

    /// Scope the cached listings (`list_tracking`, `list_groups`) to one namespace.
    pub fn restricted_to(self, namespace: &str) -> Self {
        self.state().namespace = Some(namespace.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, kind: &str, namespace: Option<&str>, event: WatchEvent) {
        // No receivers is fine: nobody watches yet.
        let _ = self.tx.send(Broadcast { kind: kind.to_string(), namespace: namespace.map(str::to_string), event });
    }

    /// Create a `Track` group object and return its UID.
    pub fn add_group(&self, namespace: &str, name: &str) -> String {
        let gvk = GroupVersionKind::gvk("keel.io", "v1alpha1", GROUP_KIND);
        let obj = DynamicObject {
            types: Some(TypeMeta { api_version: API_VERSION.to_string(), kind: GROUP_KIND.to_string() }),
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
            data: serde_json::json!({ "spec": {} }),
        };
        let stored = self.insert(&gvk_key(&gvk), obj);
        stored.metadata.uid.unwrap_or_default()
    }

    /// Create or replace a tracking object. The UID survives replacement; status is
    /// kept when the new object carries none.
    pub fn put_tracking(&self, tracking: TrackingObject) -> Result<TrackingObject> {
        let scope = tracking.scope().ok_or(ClusterError::MissingField("kind"))?;
        let mut obj: DynamicObject = serde_json::from_value(serde_json::to_value(&tracking)?)?;
        let key = (gvk_key(&scope.gvk()), obj.metadata.namespace.clone(), obj.metadata.name.clone().unwrap_or_default());
        if let Some(existing) = self.state().objects.get(&key) {
            obj.metadata.uid = existing.metadata.uid.clone();
            obj.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
            if obj.data.get("status").is_none() {
                if let Some(status) = existing.data.get("status") {
                    obj.data["status"] = status.clone();
                }
            }
        }
        let stored = self.insert(&key.0, obj);
        tracking_from_dynamic(&stored)
    }

    /// Snapshot of a tracking object.
    pub fn tracking(&self, reference: &TrackingRef) -> Option<TrackingObject> {
        let key = (gvk_key(&reference.scope.gvk()), reference.namespace.clone(), reference.name.clone());
        let obj = self.state().objects.get(&key).cloned()?;
        tracking_from_dynamic(&obj).ok()
    }

    /// Delete a tracking object, garbage-collecting the children it controls.
    pub fn delete_tracking(&self, reference: &TrackingRef) {
        let key = (gvk_key(&reference.scope.gvk()), reference.namespace.clone(), reference.name.clone());
        self.remove(&key);
    }

    /// Store an arbitrary object as if another actor created it.
    pub fn put_object(&self, obj: DynamicObject) -> DynamicObject {
        let kind = obj
            .types
            .as_ref()
            .map(|t| {
                let (g, v) = keel_core::split_api_version(&t.api_version);
                gvk_key(&GroupVersionKind::gvk(g, v, &t.kind))
            })
            .unwrap_or_default();
        self.insert(&kind, obj)
    }

    /// Live object by `gvk_key` (e.g. `apps/v1/Deployment`).
    pub fn child(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        self.state().objects.get(&key).cloned()
    }

    /// Merge-patch an object as another actor would (no immutability checks).
    pub fn external_patch(&self, kind: &str, namespace: Option<&str>, name: &str, patch: &Json) -> Option<DynamicObject> {
        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        let current = self.state().objects.get(&key).cloned()?;
        let mut raw = serde_json::to_value(&current).ok()?;
        apply_merge_patch(&mut raw, patch);
        let mut next: DynamicObject = serde_json::from_value(raw).ok()?;
        next.metadata.uid = current.metadata.uid.clone();
        Some(self.insert(kind, next))
    }

    /// Remove an object immediately, bypassing held deletions.
    pub fn external_delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        self.remove(&(kind.to_string(), namespace.map(str::to_string), name.to_string()))
    }

    /// While held, deletes only mark objects terminating (foreground deletion in flight).
    pub fn hold_deletions(&self, hold: bool) {
        self.state().hold_deletions = hold;
    }

    /// Complete every deletion in flight.
    pub fn finish_deletions(&self) {
        let terminating: Vec<ObjectKey> = self
            .state()
            .objects
            .iter()
            .filter(|(_, o)| o.metadata.deletion_timestamp.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        for key in terminating {
            self.remove(&key);
        }
    }

    /// Make cached listings fail, as an unsynced cache would.
    pub fn fail_lists(&self, fail: bool) {
        self.state().fail_lists = fail;
    }

    pub fn events(&self) -> Vec<ChildEvent> {
        self.state().events.clone()
    }

    pub fn counts(&self) -> OperationCounts {
        self.state().counts.clone()
    }

    fn insert(&self, kind: &str, mut obj: DynamicObject) -> DynamicObject {
        let stored = {
            let mut st = self.state();
            st.next_rv += 1;
            obj.metadata.resource_version = Some(st.next_rv.to_string());
            if obj.metadata.uid.is_none() {
                obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            }
            if obj.metadata.creation_timestamp.is_none() {
                obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            }
            let key = (kind.to_string(), obj.metadata.namespace.clone(), obj.metadata.name.clone().unwrap_or_default());
            st.objects.insert(key, obj.clone());
            obj
        };
        self.send(kind, stored.metadata.namespace.as_deref(), WatchEvent::Applied(stored.clone()));
        stored
    }

    fn remove(&self, key: &ObjectKey) -> bool {
        let removed = self.state().objects.remove(key);
        let Some(obj) = removed else { return false };
        self.send(&key.0, key.1.as_deref(), WatchEvent::Deleted(obj.clone()));
        // Garbage collection of controlled dependents.
        if let Some(uid) = obj.metadata.uid.as_deref() {
            let dependents: Vec<ObjectKey> = self
                .state()
                .objects
                .iter()
                .filter(|(_, o)| {
                    o.metadata
                        .owner_references
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .any(|r| r.uid == uid && r.controller == Some(true))
                })
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                self.remove(&dep);
            }
        }
        true
    }

    fn kind(&self, gvk: &GroupVersionKind) -> Option<(ResolvedKind, Vec<String>)> {
        self.state().kinds.get(&gvk_key(gvk)).map(|k| (k.resolved.clone(), k.immutable.clone()))
    }

    fn scoped_key(kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> ObjectKey {
        let ns = if kind.namespaced { namespace.map(str::to_string) } else { None };
        (kind.key(), ns, name.to_string())
    }
}

fn invalid(kind: &str, name: &str, field: &str) -> ClusterError {
    ClusterError::api(
        422,
        "Invalid",
        format!("{kind} \"{name}\" is invalid: {}: Invalid value: field is immutable", field.trim_start_matches('/').replace('/', ".")),
    )
}

fn not_found(kind: &ResolvedKind, name: &str) -> ClusterError {
    ClusterError::api(404, "NotFound", format!("{} \"{name}\" not found", kind.plural()))
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        self.kind(gvk).map(|(k, _)| k).ok_or_else(|| ClusterError::UnknownKind(gvk_key(gvk)))
    }

    async fn get(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.state().objects.get(&Self::scoped_key(kind, namespace, name)).cloned())
    }

    async fn create(&self, kind: &ResolvedKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().ok_or(ClusterError::MissingField("metadata.name"))?;
        if kind.namespaced && obj.metadata.namespace.is_none() {
            return Err(ClusterError::api(400, "BadRequest", "the server could not find the requested resource"));
        }
        let key = Self::scoped_key(kind, obj.metadata.namespace.as_deref(), &name);
        {
            let mut st = self.state();
            st.counts.creates += 1;
            if st.objects.contains_key(&key) {
                return Err(ClusterError::api(409, "AlreadyExists", format!("{} \"{name}\" already exists", kind.plural())));
            }
        }
        let mut new = obj.clone();
        new.types = Some(TypeMeta { api_version: kind.resource.api_version.clone(), kind: kind.resource.kind.clone() });
        new.metadata.namespace = key.1.clone();
        new.metadata.uid = None;
        new.metadata.resource_version = None;
        new.metadata.creation_timestamp = None;
        Ok(self.insert(&key.0, new))
    }

    async fn patch(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str, patch: &Json) -> Result<DynamicObject> {
        let key = Self::scoped_key(kind, namespace, name);
        let (current, immutable) = {
            let mut st = self.state();
            st.counts.patches += 1;
            let current = st.objects.get(&key).cloned().ok_or_else(|| not_found(kind, name))?;
            let immutable = st.kinds.get(&key.0).map(|k| k.immutable.clone()).unwrap_or_default();
            (current, immutable)
        };
        let before = serde_json::to_value(&current)?;
        let mut after = before.clone();
        apply_merge_patch(&mut after, patch);
        for field in &immutable {
            if let Some(old) = before.pointer(field) {
                if after.pointer(field) != Some(old) {
                    return Err(invalid(&kind.gvk.kind, name, field));
                }
            }
        }
        if after == before {
            return Ok(current);
        }
        let mut next: DynamicObject = serde_json::from_value(after)?;
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.namespace = key.1.clone();
        Ok(self.insert(&key.0, next))
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = Self::scoped_key(kind, namespace, name);
        let held = {
            let mut st = self.state();
            st.counts.deletes += 1;
            let hold = st.hold_deletions;
            match st.objects.get(&key) {
                None => return Ok(()),
                Some(o) if o.metadata.deletion_timestamp.is_some() => return Ok(()),
                Some(o) if hold => Some(o.clone()),
                Some(_) => None,
            }
        };
        match held {
            Some(mut obj) => {
                obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                obj.metadata.finalizers.get_or_insert_with(Vec::new).push("foregroundDeletion".to_string());
                self.insert(&key.0, obj);
            }
            None => {
                self.remove(&key);
            }
        }
        Ok(())
    }

    async fn get_tracking(&self, reference: &TrackingRef) -> Result<Option<TrackingObject>> {
        let key = (gvk_key(&reference.scope.gvk()), reference.namespace.clone(), reference.name.clone());
        let obj = self.state().objects.get(&key).cloned();
        obj.map(|o| tracking_from_dynamic(&o)).transpose()
    }

    async fn list_tracking(&self, scope: TrackingScope) -> Result<Vec<TrackingObject>> {
        let kind = gvk_key(&scope.gvk());
        let objects: Vec<DynamicObject> = {
            let st = self.state();
            if st.fail_lists {
                return Err(ClusterError::CacheNotSynced(scope.kind()));
            }
            st.objects
                .iter()
                .filter(|((k, ns, _), _)| {
                    *k == kind && (scope == TrackingScope::Cluster || st.namespace.is_none() || *ns == st.namespace)
                })
                .map(|(_, o)| o.clone())
                .collect()
        };
        Ok(readable_tracking(&objects))
    }

    async fn list_groups(&self) -> Result<Vec<ObjectMeta>> {
        let kind = gvk_key(&GroupVersionKind::gvk("keel.io", "v1alpha1", GROUP_KIND));
        let st = self.state();
        if st.fail_lists {
            return Err(ClusterError::CacheNotSynced(GROUP_KIND));
        }
        Ok(st
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (st.namespace.is_none() || *ns == st.namespace))
            .map(|(_, o)| o.metadata.clone())
            .collect())
    }

    async fn update_tracking_status(&self, reference: &TrackingRef, status: &TrackingStatus) -> Result<()> {
        let key = (gvk_key(&reference.scope.gvk()), reference.namespace.clone(), reference.name.clone());
        let current = {
            let mut st = self.state();
            st.counts.status_updates += 1;
            st.objects.get(&key).cloned()
        };
        let mut obj = current.ok_or_else(|| ClusterError::api(404, "NotFound", format!("{reference} not found")))?;
        let status = serde_json::to_value(status)?;
        if obj.data.get("status") == Some(&status) {
            return Ok(());
        }
        obj.data["status"] = status;
        self.insert(&key.0, obj);
        Ok(())
    }

    async fn publish_event(&self, event: &ChildEvent) -> Result<()> {
        self.state().events.push(event.clone());
        Ok(())
    }

    fn watch(&self, target: &WatchTarget) -> BoxStream<'static, Result<WatchEvent>> {
        let kind = target.kind.key();
        let namespace = if target.kind.namespaced { target.namespace.clone() } else { None };
        let rx = self.tx.subscribe();
        let initial: Vec<DynamicObject> = {
            let mut st = self.state();
            st.counts.watches += 1;
            st.objects
                .iter()
                .filter(|((k, ns, _), _)| *k == kind && (namespace.is_none() || *ns == namespace))
                .map(|(_, o)| o.clone())
                .collect()
        };
        let live = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => return Some((ev, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |b| {
            let keep = b.kind == kind && (namespace.is_none() || b.namespace == namespace);
            futures::future::ready(keep)
        })
        .map(|b| Ok(b.event));
        futures::stream::once(futures::future::ready(Ok(WatchEvent::Restarted(initial)))).chain(live).boxed()
    }
}

/// Owner reference pointing at a `Track` group.
pub fn group_owner(name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: GROUP_KIND.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
