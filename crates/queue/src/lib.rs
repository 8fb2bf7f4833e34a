//! carctl work queue: deduplicating, rate-limited, at-least-once delivery keyed
//! by object identity.
//!
//! An item is in at most one of *pending* (waiting for a worker), *processing*
//! (handed out, not yet `done`) or *dirty* (re-added while processing). Dirty
//! items go back to pending the moment their in-flight copy is marked done, so
//! no identity is ever worked on by two workers at once and no re-add is lost.
//! Delayed adds wait in a separate `DelayQueue` owned by a background task.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, trace};

mod rate_limit;

pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Longest delay `add_after` honours. Longer requests are clamped; the timer
/// wheel behind the waiting loop cannot hold deadlines past about two years.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Anything usable as a queue key.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

/// Where an item currently sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Absent,
    Pending,
    Processing,
    /// Processing, with a re-add waiting for `done`.
    Dirty,
}

struct State<K> {
    pending: VecDeque<K>,
    pending_set: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    added_at: FxHashMap<K, Instant>,
    started_at: FxHashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: QueueKey> State<K> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            pending_set: FxHashSet::default(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            added_at: FxHashMap::default(),
            started_at: FxHashMap::default(),
            shutting_down: false,
        }
    }

    fn push_pending(&mut self, item: K) -> bool {
        if !self.pending_set.insert(item.clone()) {
            return false;
        }
        self.added_at.insert(item.clone(), Instant::now());
        self.pending.push_back(item);
        true
    }
}

enum Next<K> {
    Item(K),
    ShuttingDown,
    Empty,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    ready: Notify,
    idle: Notify,
    shutdown: CancellationToken,
}

impl<K: QueueKey> Shared<K> {
    fn add(&self, item: K) {
        let mut st = lock(&self.state);
        if st.shutting_down {
            trace!(queue = %self.name, item = ?item, "add ignored: shutting down");
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
        if st.processing.contains(&item) {
            st.dirty.insert(item);
            return;
        }
        if !st.push_pending(item) {
            return;
        }
        gauge!("workqueue_depth", st.pending.len() as f64, "name" => self.name.clone());
        drop(st);
        self.ready.notify_one();
    }

    fn try_next(&self) -> Next<K> {
        let mut st = lock(&self.state);
        if st.shutting_down {
            return Next::ShuttingDown;
        }
        let Some(item) = st.pending.pop_front() else { return Next::Empty };
        st.pending_set.remove(&item);
        if let Some(t) = st.added_at.remove(&item) {
            histogram!("workqueue_queue_ms", t.elapsed().as_secs_f64() * 1000.0, "name" => self.name.clone());
        }
        st.started_at.insert(item.clone(), Instant::now());
        st.processing.insert(item.clone());
        gauge!("workqueue_depth", st.pending.len() as f64, "name" => self.name.clone());
        Next::Item(item)
    }
}

/// Cloneable handle to a rate-limited work queue.
///
/// Must be created inside a Tokio runtime: construction spawns the task that
/// releases delayed items.
pub struct RateLimitingQueue<K: QueueKey> {
    shared: Arc<Shared<K>>,
    limiter: Arc<dyn RateLimiter<K>>,
    delay_tx: mpsc::UnboundedSender<(K, Instant)>,
}

impl<K: QueueKey> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), limiter: Arc::clone(&self.limiter), delay_tx: self.delay_tx.clone() }
    }
}

impl<K: QueueKey> RateLimitingQueue<K> {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self::with_limiter(name, Arc::new(limiter))
    }

    pub fn with_limiter(name: impl Into<String>, limiter: Arc<dyn RateLimiter<K>>) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(State::new()),
            ready: Notify::new(),
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        tokio::spawn(waiting_loop(Arc::clone(&shared), delay_rx));
        Self { shared, limiter, delay_tx }
    }

    pub fn name(&self) -> &str { &self.shared.name }

    /// Make `item` available now, deduplicated against pending and in-flight copies.
    pub fn add(&self, item: K) { self.shared.add(item); }

    /// Make `item` available after `delay`, capped at [`MAX_DELAY`]. While
    /// waiting, a later request can only move the ready time earlier.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.shared.add(item);
            return;
        }
        let delay = delay.min(MAX_DELAY);
        if let Err(mpsc::error::SendError((item, _))) = self.delay_tx.send((item, Instant::now() + delay)) {
            error!(queue = %self.shared.name, item = ?item, "waiting loop stopped; delayed add dropped");
        }
    }

    /// Add after the delay the rate limiter assigns to `item`.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "name" => self.shared.name.clone());
        trace!(queue = %self.shared.name, item = ?item, delay_ms = delay.as_millis() as u64, "rate limited add");
        self.add_after(item, delay);
    }

    /// Wait for the next item. `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.shared.try_next() {
                Next::Item(item) => return Some(item),
                Next::ShuttingDown => return None,
                Next::Empty => notified.await,
            }
        }
    }

    /// Mark `item` finished. A re-add that arrived while it was processing is
    /// redelivered now.
    pub fn done(&self, item: &K) {
        let mut st = lock(&self.shared.state);
        if !st.processing.remove(item) {
            return;
        }
        if let Some(t) = st.started_at.remove(item) {
            histogram!("workqueue_work_ms", t.elapsed().as_secs_f64() * 1000.0, "name" => self.shared.name.clone());
        }
        let requeued = st.dirty.remove(item) && !st.shutting_down && st.push_pending(item.clone());
        let idle = st.processing.is_empty();
        drop(st);
        if requeued {
            self.shared.ready.notify_one();
        }
        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    pub fn forget(&self, item: &K) { self.limiter.forget(item); }

    pub fn num_requeues(&self, item: &K) -> u32 { self.limiter.num_requeues(item) }

    /// Number of items waiting for a worker.
    pub fn len(&self) -> usize { lock(&self.shared.state).pending.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn processing_len(&self) -> usize { lock(&self.shared.state).processing.len() }

    pub fn item_state(&self, item: &K) -> ItemState {
        let st = lock(&self.shared.state);
        if st.processing.contains(item) {
            if st.dirty.contains(item) { ItemState::Dirty } else { ItemState::Processing }
        } else if st.pending_set.contains(item) {
            ItemState::Pending
        } else {
            ItemState::Absent
        }
    }

    pub fn is_shutting_down(&self) -> bool { lock(&self.shared.state).shutting_down }

    /// Stop handing out work. Blocked and future `get` callers see `None`,
    /// delayed items are discarded and further adds are ignored.
    pub fn shut_down(&self) {
        {
            let mut st = lock(&self.shared.state);
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        debug!(queue = %self.shared.name, "shutting down");
        self.shared.shutdown.cancel();
        self.shared.ready.notify_waiters();
    }

    /// Shut down, then wait until every in-flight item has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if lock(&self.shared.state).processing.is_empty() {
                return;
            }
            idle.await;
        }
    }
}

async fn waiting_loop<K: QueueKey>(shared: Arc<Shared<K>>, mut rx: mpsc::UnboundedReceiver<(K, Instant)>) {
    let mut delayed: DelayQueue<K> = DelayQueue::new();
    let mut waiting: FxHashMap<K, (delay_queue::Key, Instant)> = FxHashMap::default();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            msg = rx.recv() => {
                let Some((item, ready_at)) = msg else { break };
                if ready_at <= Instant::now() {
                    shared.add(item);
                    continue;
                }
                match waiting.get_mut(&item) {
                    Some((key, at)) => {
                        if ready_at < *at {
                            delayed.reset_at(key, ready_at);
                            *at = ready_at;
                        }
                    }
                    None => {
                        let key = delayed.insert_at(item.clone(), ready_at);
                        waiting.insert(item, (key, ready_at));
                    }
                }
            }
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let item = expired.into_inner();
                waiting.remove(&item);
                shared.add(item);
            }
        }
    }
    debug!(queue = %shared.name, dropped = waiting.len(), "waiting loop stopped");
}
