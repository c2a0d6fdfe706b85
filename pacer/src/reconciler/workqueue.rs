//! A level-triggered work queue.
//!
//! Keys instead of events are queued, so a burst of changes to the same record turns into a single reconcile.
//! A key is never handed to two workers at once: if it is added again while a worker holds it, it is parked
//! until that worker calls [`WorkQueue::done`] and only then queued again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct Inner<K> {
    queue: VecDeque<K>,

    /// Keys that need processing. Everything in `queue` is dirty, but a dirty key may also be waiting for a
    /// worker to finish with it.
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    /// Consecutive failures per key.
    failures: HashMap<K, u32>,

    shutting_down: bool,
}

impl<K> Default for Inner<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `key` as needing processing. Adding a key that is already waiting does nothing.
    pub fn add(&self, key: K) {
        let mut inner = self.lock();

        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }

        inner.dirty.insert(key.clone());

        if inner.processing.contains(&key) {
            return;
        }

        inner.queue.push_back(key);
        drop(inner);

        self.notify.notify_one();
    }

    /// Waits for the next key. Returns None once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.lock();

                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }

                if inner.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Releases a key handed out by [`WorkQueue::get`]. If it was added again in the meantime it goes back on the
    /// queue.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);

        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Adds `key` again after a delay that doubles with every consecutive failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }

            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = backoff(self.base_delay, self.max_delay, *failures);
            *failures = failures.saturating_add(1);
            delay
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys. Workers keep receiving what is already queued and then get None.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failures)).min(max)
}
