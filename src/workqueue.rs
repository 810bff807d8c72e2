//! # Work Queue
//!
//! De-duplicating delay queue shared by a pool of reconcile workers.
//!
//! - A key is queued at most once; adding a queued key again is a no-op.
//! - A key handed to a worker is "processing" until [`WorkQueue::done`]. Adds
//!   that arrive meanwhile mark it dirty and it is queued again on `done`, so
//!   one key never has two workers at once.
//! - [`WorkQueue::add_after`] parks a key until its deadline. Parking an
//!   already parked key keeps the earlier deadline.
//!
//! ```rust
//! use flowmill_core::workqueue::WorkQueue;
//!
//! # tokio_test::block_on(async {
//! let queue = WorkQueue::new();
//! queue.add("default/nightly".to_string());
//! queue.add("default/nightly".to_string());
//! assert_eq!(queue.len(), 1);
//!
//! let key = queue.get().await.unwrap();
//! queue.done(&key);
//! assert!(queue.is_empty());
//! # });
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue `key` for processing now
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if Self::insert_ready(&mut state, key) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        let entry = state.waiting.entry(key).or_insert(deadline);
        if deadline < *entry {
            *entry = deadline;
        }
        drop(state);
        // a waiting worker recomputes its wake-up time
        self.notify.notify_one();
    }

    fn insert_ready(state: &mut QueueState<K>, key: K) -> bool {
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }
        state.waiting.remove(&key);
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return false;
        }
        state.queue.push_back(key);
        true
    }

    /// Promote parked keys whose deadline passed; returns the next deadline
    fn promote_due(state: &mut QueueState<K>, now: Instant) -> Option<Instant> {
        let due: Vec<K> = state
            .waiting
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            state.waiting.remove(&key);
            Self::insert_ready(state, key);
        }
        state.waiting.values().min().copied()
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.state.lock();
                let next = Self::promote_due(&mut state, Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                next
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

    /// Mark `key` as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; pending `get` calls return `None`
    pub fn shut_down(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.waiting.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys parked until a deadline
    pub fn waiting_len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.state.lock().processing.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let queue = WorkQueue::new();
        queue.add("wf-1");
        queue.add("wf-1");
        queue.add("wf-2");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("wf-1"));
        assert_eq!(queue.get().await, Some("wf-2"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_requeued_on_done() {
        let queue = WorkQueue::new();
        queue.add("wf-1");
        let key = queue.get().await.unwrap();
        assert!(queue.is_processing(&key));

        // re-added while processing: held back until done
        queue.add("wf-1");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("wf-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after("wf-ttl", Duration::from_secs(6));
        queue.add_after("wf-ttl", Duration::from_secs(60));
        assert_eq!(queue.waiting_len(), 1);

        let started = Instant::now();
        let key = queue.get().await;
        assert_eq!(key, Some("wf-ttl"));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6));
        assert!(waited < Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        queue.add("late".to_string());
        assert!(queue.is_empty());
    }
}
