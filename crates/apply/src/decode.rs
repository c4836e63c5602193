//! Desired-document decoding: YAML first, JSON as fallback.

use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value as Json;

use keel_core::split_api_version;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("document too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("document too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("unable to parse document: {0}")]
    Syntax(String),
    #[error("document is not an object")]
    NotAnObject,
    #[error("document missing {0}")]
    Missing(&'static str),
    #[error("invalid object: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Guards applied before a document is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl DecodeLimits {
    /// Defaults overridden by `KEEL_MAX_DOCUMENT_BYTES` / `KEEL_MAX_DOCUMENT_NODES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let read = |key: &str, fallback: usize| std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(fallback);
        Self { max_bytes: read("KEEL_MAX_DOCUMENT_BYTES", d.max_bytes), max_nodes: read("KEEL_MAX_DOCUMENT_NODES", d.max_nodes) }
    }
}

/// A decoded desired object and its kind.
#[derive(Debug, Clone)]
pub struct DecodedObject {
    pub gvk: GroupVersionKind,
    pub object: DynamicObject,
}

impl DecodedObject {
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.object.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }

    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Stops counting one past the budget.
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Remove fields the API server owns; they are never part of a desired state.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink", "deletionTimestamp"] {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn parse(data: &[u8]) -> Result<Json, DecodeError> {
    match serde_yaml::from_slice::<serde_yaml::Value>(data) {
        Ok(yaml) => serde_json::to_value(yaml).map_err(|e| DecodeError::Syntax(e.to_string())),
        Err(yaml_err) => serde_json::from_slice::<Json>(data).map_err(|_| DecodeError::Syntax(yaml_err.to_string())),
    }
}

fn non_empty_str<'a>(v: &'a Json, pointer: &str, what: &'static str) -> Result<&'a str, DecodeError> {
    v.pointer(pointer).and_then(Json::as_str).filter(|s| !s.is_empty()).ok_or(DecodeError::Missing(what))
}

pub fn decode(data: &[u8]) -> Result<DecodedObject, DecodeError> {
    decode_with(data, &DecodeLimits::default())
}

pub fn decode_with(data: &[u8], limits: &DecodeLimits) -> Result<DecodedObject, DecodeError> {
    if data.len() > limits.max_bytes {
        return Err(DecodeError::TooLarge(limits.max_bytes));
    }
    let json = parse(data)?;
    if !json.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    if json_node_budget_exceeded(&json, limits.max_nodes) {
        return Err(DecodeError::TooComplex(limits.max_nodes));
    }
    let (group, version) = split_api_version(non_empty_str(&json, "/apiVersion", "apiVersion")?);
    let gvk = GroupVersionKind::gvk(group, version, non_empty_str(&json, "/kind", "kind")?);
    non_empty_str(&json, "/metadata/name", "metadata.name")?;
    let object: DynamicObject = serde_json::from_value(strip_server_fields(json))?;
    Ok(DecodedObject { gvk, object })
}
