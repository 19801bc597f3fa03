//! Rate-Limited Work Queue
//!
//! A deduplicating FIFO of object keys shared by the controller workers.
//!
//! - An item queued but not yet picked up is held once, however many times
//!   it is added (`dirty` set).
//! - An item being processed is never handed to a second worker; adds that
//!   arrive meanwhile are parked and replayed on [`WorkQueue::done`].
//! - Delayed adds wait in a min-heap; a later add of the same item only
//!   ever moves its deadline earlier.
//! - After [`WorkQueue::shut_down`], [`WorkQueue::get`] drains what is
//!   queued and then returns `None`.

use crate::controller::rate_limiter::RateLimiter;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Deadline used when a delay does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Bounds every queue key must satisfy
pub trait QueueKey: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> QueueKey for T {}

// =============================================================================
// Delayed Items
// =============================================================================

struct WaitingItem<K> {
    ready_at: Instant,
    seq: u64,
    item: K,
}

impl<K> PartialEq for WaitingItem<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for WaitingItem<K> {}

impl<K> PartialOrd for WaitingItem<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for WaitingItem<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

// =============================================================================
// Queue State
// =============================================================================

struct QueueState<K> {
    /// Items ready for a worker, in arrival order
    queue: VecDeque<K>,
    /// Items that need processing (queued, or re-added while processing)
    dirty: HashSet<K>,
    /// Items currently held by a worker
    processing: HashSet<K>,
    /// Delayed adds, earliest first. Entries whose deadline no longer
    /// matches `waiting_ready_at` are stale and skipped.
    waiting: BinaryHeap<Reverse<WaitingItem<K>>>,
    waiting_ready_at: HashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<K: QueueKey> QueueState<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            waiting_ready_at: HashMap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true if the item became available to a worker
    fn insert(&mut self, item: K) -> bool {
        if self.shutting_down || self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn schedule(&mut self, item: K, ready_at: Instant) {
        if let Some(existing) = self.waiting_ready_at.get(&item) {
            if *existing <= ready_at {
                return;
            }
        }
        self.seq += 1;
        self.waiting_ready_at.insert(item.clone(), ready_at);
        self.waiting.push(Reverse(WaitingItem {
            ready_at,
            seq: self.seq,
            item,
        }));
    }

    /// Move every delayed item whose deadline has passed into the queue
    fn promote_ready(&mut self, now: Instant) {
        while let Some(Reverse(next)) = self.waiting.peek() {
            if next.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.waiting.pop() else {
                break;
            };
            if self.waiting_ready_at.get(&entry.item) == Some(&entry.ready_at) {
                self.waiting_ready_at.remove(&entry.item);
                self.insert(entry.item);
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse(w)| w.ready_at)
    }
}

// =============================================================================
// Work Queue
// =============================================================================

/// Deduplicating, delay-capable, rate-limited work queue
pub struct WorkQueue<K: QueueKey> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a named queue using the given requeue policy
    pub fn new(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an item for processing
    pub fn add(&self, item: K) {
        if self.state.lock().insert(item) {
            self.notify.notify_one();
        }
    }

    /// Queue an item once `delay` has elapsed
    pub fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let now = Instant::now();
            let ready_at = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
            state.schedule(item, ready_at);
        }
        // Sleeping workers recompute their deadline
        self.notify.notify_waiters();
    }

    /// Queue an item after the delay its failure history calls for
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the failure history of an item
    pub fn forget(&self, item: &K) {
        self.rate_limiter.forget(item);
    }

    /// Failures recorded for an item since it was last forgotten
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down
    /// and drained. Every item returned must be passed to [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut state = self.state.lock();
                state.promote_ready(Instant::now());
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_ready_at()
            };

            match next_ready {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark an item as finished. If it was added again while processing,
    /// it goes back on the queue.
    pub fn done(&self, item: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every waiting worker
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.waiting_ready_at.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Items ready for a worker (excludes delayed and in-flight items)
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: QueueKey> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("waiting", &state.waiting_ready_at.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
