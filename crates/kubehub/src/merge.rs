//! JSON merge patch application (RFC 7386), as performed by the API server.

use serde_json::Value as Json;

/// Apply `patch` onto `target` in place. `null` removes a key; objects merge
/// recursively; everything else (arrays included) replaces.
pub fn apply_merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                apply_merge_patch(target_map.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}
