//! Three-way JSON merge patches and change summaries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Build the merge patch that moves `current` to `modified`, using `original`
/// (the last applied document) to find fields that were dropped from the desired state.
///
/// * keys present in `original` but gone from `modified` are cleared (`null`);
/// * keys in `modified` whose live value differs are overwritten;
/// * keys only the live object has are left alone.
///
/// Arrays are replaced whole. An unchanged object yields an empty patch (`{}`).
pub fn three_way_merge_patch(original: Option<&Json>, modified: &Json, current: &Json) -> Json {
    let empty = Json::Object(Map::new());
    let deletions = deletions(original.unwrap_or(&empty), modified, current);
    let delta = delta(current, modified);
    Json::Object(merge_maps(deletions, delta))
}

/// `null` for every key dropped between `original` and `modified` that the live object still has.
fn deletions(original: &Json, modified: &Json, current: &Json) -> Map<String, Json> {
    let mut out = Map::new();
    let (Json::Object(orig), Json::Object(modi)) = (original, modified) else {
        return out;
    };
    let cur = current.as_object();
    for (k, ov) in orig {
        let live = cur.and_then(|c| c.get(k));
        match modi.get(k) {
            None => {
                if live.is_some() {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Some(mv) if ov.is_object() && mv.is_object() => {
                if let Some(lv) = live {
                    let nested = deletions(ov, mv, lv);
                    if !nested.is_empty() {
                        out.insert(k.clone(), Json::Object(nested));
                    }
                }
            }
            Some(_) => {}
        }
    }
    out
}

/// Keys of `modified` whose value differs from `current`, recursing through objects.
fn delta(current: &Json, modified: &Json) -> Map<String, Json> {
    let mut out = Map::new();
    let Json::Object(modi) = modified else {
        return out;
    };
    let cur = current.as_object();
    for (k, mv) in modi {
        match cur.and_then(|c| c.get(k)) {
            Some(cv) if cv == mv => {}
            Some(cv) if cv.is_object() && mv.is_object() => {
                let nested = delta(cv, mv);
                if !nested.is_empty() {
                    out.insert(k.clone(), Json::Object(nested));
                }
            }
            // A null in the desired document means "remove" in merge-patch terms.
            None if mv.is_null() => {}
            _ => {
                out.insert(k.clone(), mv.clone());
            }
        }
    }
    out
}

fn merge_maps(mut into: Map<String, Json>, from: Map<String, Json>) -> Map<String, Json> {
    for (k, v) in from {
        match (into.remove(&k), v) {
            (Some(Json::Object(a)), Json::Object(b)) => {
                into.insert(k, Json::Object(merge_maps(a, b)));
            }
            (_, v) => {
                into.insert(k, v);
            }
        }
    }
    into
}

pub fn is_empty_patch(patch: &Json) -> bool {
    patch.as_object().map_or(false, Map::is_empty)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} added, {} updated, {} removed", self.adds, self.updates, self.removes)
    }
}

/// Summarize what `patch` does to `live`: new keys, overwritten values and cleared keys.
pub fn patch_summary(patch: &Json, live: &Json) -> DiffSummary {
    fn walk(p: &Json, l: Option<&Json>, s: &mut DiffSummary) {
        match (p, l) {
            (Json::Null, _) => s.removes += 1,
            (Json::Object(po), Some(Json::Object(lo))) => {
                for (k, pv) in po {
                    walk(pv, lo.get(k), s);
                }
            }
            (_, None) => s.adds += 1,
            (_, Some(_)) => s.updates += 1,
        }
    }
    let mut s = DiffSummary::default();
    if let Json::Object(po) = patch {
        for (k, pv) in po {
            walk(pv, live.get(k), &mut s);
        }
    }
    s
}
