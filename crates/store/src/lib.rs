//! Keel store: the reconcile work queue.
//!
//! Keys are deduplicated while queued, never handed to two workers at once, and
//! re-queued after `done` when they were re-added mid-flight. The queue is bounded
//! and drops its oldest key on overflow; failures back off exponentially per key.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 4096, base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(300) }
    }
}

struct State<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    dropped: u64,
    shutdown: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    cfg: QueueConfig,
}

/// Cloneable handle; all clones share one queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new(cfg: QueueConfig) -> Self {
        let state = State {
            order: VecDeque::new(),
            queued: FxHashSet::default(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            failures: FxHashMap::default(),
            dropped: 0,
            shutdown: false,
        };
        Self { inner: Arc::new(Inner { state: Mutex::new(state), notify: Notify::new(), cfg: QueueConfig { capacity: cfg.capacity.max(1), ..cfg } }) }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a key. No-op when already queued; deferred until `done` when in flight.
    pub fn add(&self, key: K) {
        let mut st = self.state();
        if st.shutdown || st.queued.contains(&key) {
            return;
        }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        Self::push(&mut st, key, self.inner.cfg.capacity);
        drop(st);
        self.inner.notify.notify_one();
    }

    fn push(st: &mut State<K>, key: K, cap: usize) {
        if st.order.len() >= cap {
            if let Some(old) = st.order.pop_front() {
                st.queued.remove(&old);
                st.dropped += 1;
                counter!("queue_dropped_total", 1u64);
                warn!(key = ?old, dropped = st.dropped, "work queue full; dropped oldest key");
            }
        }
        st.queued.insert(key.clone());
        st.order.push_back(key);
        gauge!("queue_depth", st.order.len() as f64);
    }

    /// Enqueue after `delay` (immediately when zero). Needs a tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Record a failure for `key` and enqueue it after its backoff delay.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut st = self.state();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            self.backoff(*n)
        };
        debug!(key = ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.inner.cfg.base_delay.saturating_mul(1u32 << exp).min(self.inner.cfg.max_delay)
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if st.shutdown {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("queue_depth", st.order.len() as f64);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; a re-add that arrived while it was in flight is queued now.
    pub fn done(&self, key: &K) {
        let mut st = self.state();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutdown && !st.queued.contains(key) {
            Self::push(&mut st, key.clone(), self.inner.cfg.capacity);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutdown
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }
}
