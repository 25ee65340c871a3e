//! Rate-limited, deduplicating work queue
//!
//! Keys move through three states: *queued* (waiting for a worker),
//! *processing* (handed out by [`WorkQueue::get`], not yet [`WorkQueue::done`])
//! and *waiting* (scheduled by [`WorkQueue::add_after`]). A key is queued at
//! most once. Adding a key that is being processed marks it dirty; `done`
//! puts it back so the follow-up run sees the latest state. A key is never
//! handed to two workers at once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use portico_common::metrics;
use portico_common::retry::RetryConfig;
use portico_common::ResourceKey;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Decides how long a failing key waits before its next attempt
pub trait RateLimiter: Send + Sync {
    /// Delay for the next attempt of `key`; records one more failure
    fn when(&self, key: &ResourceKey) -> Duration;

    /// Clear the failure history of `key`
    fn forget(&self, key: &ResourceKey);

    /// Number of failures recorded for `key` since the last `forget`
    fn num_requeues(&self, key: &ResourceKey) -> u32;
}

/// Per-key exponential backoff: `initial_delay * multiplier^failures`, capped
pub struct ItemExponentialBackoff {
    config: RetryConfig,
    failures: DashMap<ResourceKey, u32>,
}

impl ItemExponentialBackoff {
    /// Create a limiter following the given curve
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(RetryConfig::per_item())
    }
}

impl RateLimiter for ItemExponentialBackoff {
    fn when(&self, key: &ResourceKey) -> Duration {
        let mut entry = self.failures.entry(key.clone()).or_insert(0);
        let failures = *entry;
        *entry = failures.saturating_add(1);
        self.config.delay_for(failures)
    }

    fn forget(&self, key: &ResourceKey) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.failures.get(key).map(|n| *n).unwrap_or(0)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<ResourceKey>,
    // Keys that need processing: queued ones plus in-flight ones re-added meanwhile
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    // Earliest deadline per delayed key; the heap may hold stale entries
    waiting: HashMap<ResourceKey, Instant>,
    deadlines: BinaryHeap<Reverse<(Instant, ResourceKey)>>,
    shutting_down: bool,
}

impl State {
    fn insert(&mut self, key: ResourceKey) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, key))) = self.deadlines.pop() else {
                break;
            };
            if self.waiting.get(&key) == Some(&deadline) {
                self.waiting.remove(&key);
                self.insert(key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

/// Work queue shared between the event router and the worker pool
pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    limiter: Arc<dyn RateLimiter>,
}

impl WorkQueue {
    /// Create a queue with the default per-key backoff
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Arc::new(ItemExponentialBackoff::default()))
    }

    /// Create a queue with a custom rate limiter
    pub fn with_rate_limiter(name: impl Into<String>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            limiter,
        }
    }

    /// Queue name, used in logs and metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `key` unless it is already queued
    ///
    /// If `key` is currently being processed it is re-queued once the worker
    /// calls [`done`](Self::done).
    pub fn add(&self, key: ResourceKey) {
        let depth = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            if !state.insert(key) {
                return;
            }
            state.queue.len()
        };
        metrics::record_queue_add(&self.name, depth);
        self.notify.notify_one();
    }

    /// Enqueue `key` after `delay`
    ///
    /// If `key` is already waiting, the earlier of the two deadlines wins.
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&key) {
                if *existing <= deadline {
                    return;
                }
            }
            state.waiting.insert(key.clone(), deadline);
            state.deadlines.push(Reverse((deadline, key)));
        }
        // Wake a getter so it re-arms its timer on the new deadline
        self.notify.notify_one();
    }

    /// Enqueue `key` after the rate limiter's delay for it
    pub fn add_rate_limited(&self, key: ResourceKey) {
        let delay = self.limiter.when(&key);
        trace!(queue = %self.name, key = %key, delay_ms = delay.as_millis(), "Requeue with backoff");
        metrics::record_queue_retry(&self.name);
        self.add_after(key, delay);
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down and no queued keys remain.
    /// The caller owns the returned key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let depth = state.queue.len();
                    drop(state);
                    metrics::record_queue_depth(&self.name, depth);
                    if depth > 0 {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match next_deadline {
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

    /// Mark `key` as no longer being processed
    pub fn done(&self, key: &ResourceKey) {
        let requeued_depth = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                Some(state.queue.len())
            } else {
                None
            }
        };
        if let Some(depth) = requeued_depth {
            metrics::record_queue_depth(&self.name, depth);
            self.notify.notify_one();
        }
    }

    /// Clear the retry history of `key`
    pub fn forget(&self, key: &ResourceKey) {
        self.limiter.forget(key);
    }

    /// Number of rate-limited requeues of `key` since the last `forget`
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Stop accepting keys and release idle getters
    ///
    /// Keys that are already queued are still handed out; delayed keys are
    /// dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.deadlines.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently handed out to workers
    pub fn in_flight(&self) -> usize {
        self.state.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResourceKey {
        ResourceKey::from(s)
    }

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let q = WorkQueue::new("test");
        q.add(key("gitlab/web"));
        q.add(key("gitlab/web"));
        q.add(key("gitlab/api"));
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some(key("gitlab/web")));
        assert_eq!(q.get().await, Some(key("gitlab/api")));
        assert!(q.is_empty());
    }

    /// Story: an event arrives while the key is being reconciled
    ///
    /// The key must not be handed to a second worker, but it must run again
    /// after the current run completes.
    #[tokio::test]
    async fn story_add_while_processing_requeues_on_done() {
        let q = WorkQueue::new("test");
        q.add(key("gitlab/web"));
        let k = q.get().await.unwrap();

        q.add(key("gitlab/web"));
        assert_eq!(q.len(), 0, "in-flight key must not be queued twice");
        assert_eq!(q.in_flight(), 1);

        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key("gitlab/web")));
    }

    /// Story: a burst drains and the depth follows it down, then back up on a requeue
    #[tokio::test]
    async fn story_depth_tracks_gets_and_requeues() {
        let q = WorkQueue::new("test");
        for name in ["gitlab/web", "gitlab/api", "gitlab/docs"] {
            q.add(key(name));
        }
        assert_eq!(q.len(), 3);

        let web = q.get().await.unwrap();
        assert_eq!(q.len(), 2);
        let api = q.get().await.unwrap();
        let docs = q.get().await.unwrap();
        assert!(q.is_empty());

        q.add(key("gitlab/web"));
        assert_eq!(q.len(), 0, "in-flight key waits for done");
        q.done(&web);
        assert_eq!(q.len(), 1);
        q.done(&api);
        q.done(&docs);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let q = WorkQueue::new("test");
        q.add(key("a"));
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn shut_down_drains_then_returns_none() {
        let q = WorkQueue::new("test");
        q.add(key("a"));
        q.shut_down();
        q.add(key("b"));

        assert!(q.is_shutting_down());
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shut_down_releases_blocked_getters() {
        let q = Arc::new(WorkQueue::new("test"));
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(getter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let q = Arc::new(WorkQueue::new("test"));
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add(key("gitlab/web"));
        assert_eq!(getter.await.unwrap(), Some(key("gitlab/web")));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delivers_once_deadline_passes() {
        let q = WorkQueue::new("test");
        q.add_after(key("a"), Duration::from_secs(5));
        assert!(q.is_empty());

        let start = Instant::now();
        assert_eq!(q.get().await, Some(key("a")));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_keeps_earliest_deadline() {
        let q = WorkQueue::new("test");
        q.add_after(key("a"), Duration::from_secs(60));
        q.add_after(key("a"), Duration::from_secs(1));
        q.add_after(key("a"), Duration::from_secs(30));

        let start = Instant::now();
        assert_eq!(q.get().await, Some(key("a")));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(30));

        // The superseded deadlines must not produce extra deliveries
        q.done(&key("a"));
        q.shut_down();
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_drops_delayed_keys() {
        let q = WorkQueue::new("test");
        q.add_after(key("a"), Duration::from_secs(1));
        q.shut_down();
        assert_eq!(q.get().await, None);
    }

    #[test]
    fn exponential_backoff_counts_failures_per_key() {
        let limiter = ItemExponentialBackoff::default();
        let a = key("a");

        assert_eq!(limiter.when(&a), Duration::from_millis(5));
        assert_eq!(limiter.when(&a), Duration::from_millis(10));
        assert_eq!(limiter.when(&a), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&a), 3);
        assert_eq!(limiter.num_requeues(&key("b")), 0);

        limiter.forget(&a);
        assert_eq!(limiter.num_requeues(&a), 0);
        assert_eq!(limiter.when(&a), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn add_rate_limited_increments_requeues() {
        let q = WorkQueue::new("test");
        let a = key("a");
        q.add_rate_limited(a.clone());
        q.add_rate_limited(a.clone());
        assert_eq!(q.num_requeues(&a), 2);

        assert_eq!(q.get().await, Some(a.clone()));
        q.forget(&a);
        assert_eq!(q.num_requeues(&a), 0);
    }
}
