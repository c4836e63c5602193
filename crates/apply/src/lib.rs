//! Keel apply: turn a stored desired document into a live child object.
//!
//! `decode` parses the document, `annotations` reads the per-object directives,
//! `merge` computes three-way merge patches and `engine` drives the child through
//! create, patch, delete and recreate.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod decode;
pub mod engine;
pub mod merge;

pub use annotations::{resource_state, update_strategy, AnnotationError, ResourceState, UpdateStrategy};
pub use decode::{decode, decode_with, DecodeError, DecodeLimits, DecodedObject};
pub use engine::{ApplyEngine, ApplyError, ApplyOutcome, ApplyRequest};
pub use merge::{three_way_merge_patch, DiffSummary};
