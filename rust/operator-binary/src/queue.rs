//! Rate-limited work queue with per-key deduplication.
//!
//! At most one item per key is queued, and at most one worker owns a key
//! at any instant. Re-adds that arrive while a key is being processed are
//! deferred until the worker reports completion, then coalesced into a
//! single new item. Retries back off exponentially per key and reset on
//! success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

use source_operator_crd::SourceKind;

/// Identity of a reconciled resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// The kinds this operator reconciles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum ResourceKind {
    HelmChart,
    HelmRepository,
    OCIRepository,
}

impl ResourceKind {
    /// The storage directory segment for this kind.
    pub fn as_kind_str(&self) -> &'static str {
        match self {
            ResourceKind::HelmChart => "HelmChart",
            ResourceKind::HelmRepository => "HelmRepository",
            ResourceKind::OCIRepository => "OCIRepository",
        }
    }

    /// The reconciled kind behind a chart source reference, if this
    /// operator owns it.
    pub fn from_source_kind(kind: SourceKind) -> Option<ResourceKind> {
        match kind {
            SourceKind::HelmRepository => Some(ResourceKind::HelmRepository),
            SourceKind::GitRepository | SourceKind::Bucket => None,
        }
    }
}

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct State {
    /// FIFO of ready keys.
    queue: VecDeque<ObjectKey>,
    /// Mirror of `queue` for O(1) dedup.
    queued: HashSet<ObjectKey>,
    /// Keys currently owned by a worker.
    active: HashSet<ObjectKey>,
    /// Keys re-added while active; delivered once the worker is done.
    deferred: HashSet<ObjectKey>,
    /// Earliest due time per delayed key.
    delayed: HashMap<ObjectKey, Instant>,
    /// Consecutive retry count per key.
    retries: HashMap<ObjectKey, u32>,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    shutdown: AtomicBool,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            base_delay,
            max_delay,
        }
    }

    /// Enqueues a key for immediate processing.
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        Self::enqueue(&mut state, key);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Enqueues a key once `delay` has elapsed. An earlier pending due
    /// time wins.
    pub async fn add_after(&self, key: ObjectKey, delay: Duration) {
        let due = Instant::now() + delay;
        let mut state = self.state.lock().await;
        if state.queued.contains(&key) || state.deferred.contains(&key) {
            return;
        }
        let entry = state.delayed.entry(key).or_insert(due);
        if due < *entry {
            *entry = due;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Re-enqueues a failed key with exponential backoff and returns the
    /// applied delay.
    pub async fn add_rate_limited(&self, key: ObjectKey) -> Duration {
        let retries = {
            let mut state = self.state.lock().await;
            let counter = state.retries.entry(key.clone()).or_insert(0);
            let current = *counter;
            *counter = counter.saturating_add(1);
            current
        };
        let delay = self.backoff_delay(retries);
        self.add_after(key, delay).await;
        delay
    }

    /// Resets the retry counter of a key after a success.
    pub async fn forget(&self, key: &ObjectKey) {
        self.state.lock().await.retries.remove(key);
    }

    /// Releases ownership of a key. A deferred re-add becomes a fresh
    /// queue item.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.active.remove(key);
        if state.deferred.remove(key) {
            Self::enqueue(&mut state, key.clone());
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down
    /// and drained of ready items.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let wait_until = {
                let mut state = self.state.lock().await;
                Self::promote_due(&mut state);

                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    trace!("Dispatching {}", key);
                    return Some(key);
                }

                if self.shutdown.load(Ordering::SeqCst) {
                    return None;
                }

                state.delayed.values().min().copied()
            };

            // A notification can slip in between releasing the state lock
            // and registering the waiter; the poll bound keeps that from
            // turning into a lost wakeup.
            let fallback = Instant::now() + Duration::from_millis(250);
            let deadline = wait_until.map_or(fallback, |due| due.min(fallback));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// The delay applied after `retries` consecutive failures.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let factor = 2u32.checked_pow(retries.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn enqueue(state: &mut State, key: ObjectKey) {
        state.delayed.remove(&key);
        if state.active.contains(&key) {
            state.deferred.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
        }
    }

    fn promote_due(state: &mut State) {
        let now = Instant::now();
        let due: Vec<ObjectKey> = state
            .delayed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            state.delayed.remove(&key);
            Self::enqueue(state, key);
        }
    }
}
