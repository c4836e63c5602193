use std::time::Duration;

use keel_apply::DecodeLimits;
use keel_core::IgnoredResource;
use keel_store::QueueConfig;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Restrict reconciliation to one namespace. `None` manages every namespace.
    pub namespace: Option<String>,
    /// Stamp children with a controller owner reference to their tracking object.
    pub create_owner_reference: bool,
    pub ignored: Vec<IgnoredResource>,
    pub workers: usize,
    pub queue: QueueConfig,
    /// Periodic full relist of tracking objects. `None` disables it.
    pub resync: Option<Duration>,
    /// Delay before revisiting a child that is being deleted or recreated.
    pub pending_requeue: Duration,
    pub decode_limits: DecodeLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            create_owner_reference: true,
            ignored: Vec::new(),
            workers: 4,
            queue: QueueConfig::default(),
            resync: Some(Duration::from_secs(600)),
            pending_requeue: Duration::from_secs(5),
            decode_limits: DecodeLimits::default(),
        }
    }
}

impl ControllerConfig {
    pub fn is_ignored(&self, group: &str, version: &str, plural: &str) -> bool {
        self.ignored.iter().any(|r| r.matches(group, version, plural))
    }
}
