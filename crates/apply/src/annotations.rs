//! Per-object directives carried as annotations on the desired document.

use std::fmt;
use std::str::FromStr;

use keel_core::annotations::{RESOURCE_STATE, UPDATE_STRATEGY};

use crate::decode::DecodedObject;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    #[error("invalid update strategy: {0}")]
    InvalidStrategy(String),
    #[error("invalid resource state: {0}")]
    InvalidState(String),
}

/// How an existing child is brought in line with its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Patch in place; immutable-field conflicts are reported.
    #[default]
    Update,
    /// Patch in place; delete and re-create on immutable-field conflicts.
    Recreate,
    /// Create when missing, never touch afterwards.
    Never,
}

impl FromStr for UpdateStrategy {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(UpdateStrategy::Update),
            "recreate" => Ok(UpdateStrategy::Recreate),
            "never" => Ok(UpdateStrategy::Never),
            other => Err(AnnotationError::InvalidStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateStrategy::Update => "update",
            UpdateStrategy::Recreate => "recreate",
            UpdateStrategy::Never => "never",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceState {
    #[default]
    Active,
    MarkedForDeletion,
}

impl FromStr for ResourceState {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ResourceState::Active),
            "marked-for-deletion" => Ok(ResourceState::MarkedForDeletion),
            other => Err(AnnotationError::InvalidState(other.to_string())),
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceState::Active => "active",
            ResourceState::MarkedForDeletion => "marked-for-deletion",
        })
    }
}

/// Strategy from `keel.io/update-strategy`; absent means `update`.
pub fn update_strategy(obj: &DecodedObject) -> Result<UpdateStrategy, AnnotationError> {
    obj.annotation(UPDATE_STRATEGY).map_or(Ok(UpdateStrategy::default()), str::parse)
}

/// State from `keel.io/resource-state`; absent means `active`.
pub fn resource_state(obj: &DecodedObject) -> Result<ResourceState, AnnotationError> {
    obj.annotation(RESOURCE_STATE).map_or(Ok(ResourceState::default()), str::parse)
}
