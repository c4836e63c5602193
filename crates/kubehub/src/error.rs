//! Errors surfaced by the cluster seam.

use kube::core::ErrorResponse;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("GVK not found: {0}")]
    UnknownKind(String),

    #[error("object cache for {0} has not synced yet")]
    CacheNotSynced(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object missing {0}")]
    MissingField(&'static str),
}

impl ClusterError {
    /// Build an API-server style error (used by the mock and by tests).
    pub fn api(code: u16, reason: &str, message: impl Into<String>) -> Self {
        ClusterError::Api(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }))
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            ClusterError::Api(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// 409: the object already exists or the resourceVersion was stale.
    pub fn is_conflict(&self) -> bool {
        self.code() == Some(409)
    }

    /// 422 `Invalid`: the server refused the change, typically an immutable field.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ClusterError::Api(kube::Error::Api(resp)) if resp.code == 422 || resp.reason == "Invalid")
    }
}
