//! Keel controller: turns tracking objects into live children and keeps them there.
//!
//! Watches on the two tracking kinds and on every child kind seen so far push
//! `TrackingRef`s into a shared work queue; a fixed pool of workers drains it through
//! the [`Reconciler`]. Everything is level-triggered: a key carries no payload.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{TrackingRef, TrackingScope};
use keel_kubehub::{ClusterApi, ClusterError};
use keel_store::WorkQueue;

pub mod config;
pub mod predicates;
pub mod reconciler;
pub mod status;
pub mod watch;

pub use config::ControllerConfig;
pub use predicates::OwnershipPredicates;
pub use reconciler::{ReconcileError, Reconciled, Reconciler};
pub use status::StatusReporter;
pub use watch::DynamicWatchManager;

const CACHE_SYNC_POLL: Duration = Duration::from_millis(250);

pub struct Controller {
    cluster: Arc<dyn ClusterApi>,
    cfg: ControllerConfig,
    queue: WorkQueue<TrackingRef>,
    watches: Arc<DynamicWatchManager>,
    reconciler: Arc<Reconciler>,
}

impl Controller {
    /// Watches stop when `shutdown` is cancelled.
    pub fn new(cluster: Arc<dyn ClusterApi>, cfg: ControllerConfig, shutdown: &CancellationToken) -> Self {
        let queue = WorkQueue::new(cfg.queue);
        let watches = Arc::new(DynamicWatchManager::new(
            cluster.clone(),
            queue.clone(),
            cfg.namespace.clone(),
            shutdown.child_token(),
        ));
        let reconciler = Arc::new(Reconciler::new(cluster.clone(), cfg.clone(), watches.clone()));
        Self { cluster, cfg, queue, watches, reconciler }
    }

    pub fn queue(&self) -> &WorkQueue<TrackingRef> {
        &self.queue
    }

    pub fn watches(&self) -> &DynamicWatchManager {
        &self.watches
    }

    /// Run until `shutdown` is cancelled. In-flight reconciles finish before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClusterError> {
        if !self.wait_for_caches(&shutdown).await {
            return Ok(());
        }
        self.watches.start_primary().await?;
        info!(ns = ?self.cfg.namespace, workers = self.cfg.workers, "controller started");

        let workers: Vec<JoinHandle<()>> = (0..self.cfg.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(id, self.queue.clone(), self.reconciler.clone(), self.cfg.pending_requeue))
            })
            .collect();

        match self.cfg.resync {
            Some(period) if !period.is_zero() => {
                let mut ticker = tokio::time::interval(period);
                // The primary watches already delivered the initial list.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => self.resync().await,
                    }
                }
            }
            _ => shutdown.cancelled().await,
        }

        info!("controller shutting down");
        self.queue.shutdown();
        self.watches.stop().await;
        for w in workers {
            if let Err(e) = w.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!("controller stopped");
        Ok(())
    }

    /// Ownership predicates fail closed, so events seen before the caches sync would be
    /// dropped. Returns false when cancelled first.
    async fn wait_for_caches(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let synced = self.cluster.list_groups().await.is_ok()
                && self.cluster.list_tracking(TrackingScope::Namespaced).await.is_ok()
                && self.cluster.list_tracking(TrackingScope::Cluster).await.is_ok();
            if synced {
                return true;
            }
            debug!("waiting for caches to sync");
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(CACHE_SYNC_POLL) => {}
            }
        }
    }

    /// Enqueue every visible tracking object. Recovers keys dropped on overflow.
    pub async fn resync(&self) {
        let predicates = OwnershipPredicates::new(self.cluster.clone());
        let mut added = 0usize;
        for scope in [TrackingScope::Namespaced, TrackingScope::Cluster] {
            let list = match self.cluster.list_tracking(scope).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(kind = scope.kind(), error = %e, "resync listing failed");
                    continue;
                }
            };
            for tracking in list {
                if !predicates.direct_owner_in_namespace(tracking.owner_references()).await {
                    continue;
                }
                if let Some(reference) = tracking.tracking_ref() {
                    self.queue.add(reference);
                    added += 1;
                }
            }
        }
        debug!(added, "resync");
    }
}

async fn worker(id: usize, queue: WorkQueue<TrackingRef>, reconciler: Arc<Reconciler>, pending_requeue: Duration) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let result = reconciler.reconcile(&key).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_total", 1u64);
        match result {
            Ok(reconciled) => {
                queue.forget(&key);
                if reconciled.is_pending() {
                    queue.add_after(key.clone(), pending_requeue);
                }
            }
            Err(e) if e.is_retryable() => {
                counter!("reconcile_errors_total", 1u64, "reason" => e.reason().as_str());
                let delay = queue.add_rate_limited(key.clone());
                warn!(tracking = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed");
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "reason" => e.reason().as_str());
                queue.forget(&key);
                warn!(tracking = %key, error = %e, "reconcile failed; waiting for the tracking object to change");
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
