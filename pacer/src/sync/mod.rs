//! Per repository admission control.
//!
//! Every repository gets a queue holding the executions currently allowed to run and the ones waiting for a
//! slot. The queue manager is the only owner of that state; everything else goes through its methods. All
//! mutation of one repository's queue happens while holding that repository's map entry, so two admissions for
//! the same repository can never both take the last slot.


use crate::models::{execution::State, ExecutionKey, ExecutionRecord, Repository};
use crate::store::{LabelSelector, StoreError, Stores};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("could not load existing state to initialize queues; {0}")]
    Store(#[from] StoreError),

    #[error("repository '{0}' is registered more than once")]
    DuplicateRepository(String),
}

/// The outcome of asking for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The execution holds a running slot.
    Running,

    /// The execution waits. `position` counts the executions ahead of it; 0 means it is next.
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub admission: Admission,

    /// Other executions that were granted a slot during this call because the limit grew. The caller is
    /// responsible for starting them.
    pub promoted: Vec<ExecutionKey>,
}

/// A wait list entry. The wait list is kept ordered by creation time, then name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Waiting {
    created: u64,
    key: ExecutionKey,
}

impl Waiting {
    fn order(&self) -> (u64, &str) {
        (self.created, &self.key.name)
    }
}

#[derive(Debug, Default)]
struct RepoQueue {
    /// None means no limit.
    limit: Option<u64>,
    running: BTreeSet<ExecutionKey>,
    pending: VecDeque<Waiting>,
}

impl RepoQueue {
    fn has_capacity(&self) -> bool {
        self.limit
            .map_or(true, |limit| (self.running.len() as u64) < limit)
    }

    /// Moves waiting executions into free slots, head first.
    fn promote(&mut self) -> Vec<ExecutionKey> {
        let mut promoted = vec![];

        while self.has_capacity() {
            let Some(next) = self.pending.pop_front() else {
                break;
            };

            self.running.insert(next.key.clone());
            promoted.push(next.key);
        }

        promoted
    }

    /// Drops `key` from the queue. Returns the execution that took over its slot, if any.
    fn remove(&mut self, key: &ExecutionKey) -> Option<ExecutionKey> {
        if self.running.remove(key) {
            if !self.has_capacity() {
                return None;
            }

            let next = self.pending.pop_front()?.key;
            self.running.insert(next.clone());
            return Some(next);
        }

        self.pending.retain(|waiting| waiting.key != *key);
        None
    }

    /// Puts `key` on the wait list behind everything created before it. Returns its position.
    fn enqueue(&mut self, key: &ExecutionKey, created: u64) -> usize {
        let position = self
            .pending
            .partition_point(|waiting| waiting.order() <= (created, key.name.as_str()));

        self.pending.insert(
            position,
            Waiting {
                created,
                key: key.clone(),
            },
        );

        position
    }
}

/// Combines the repository's own limit with the global ceiling. Zero counts as unset on both.
pub fn effective_limit(repository_limit: Option<u64>, max_concurrency: u64) -> Option<u64> {
    let repository_limit = repository_limit.filter(|limit| *limit > 0);
    let max_concurrency = Some(max_concurrency).filter(|limit| *limit > 0);

    match (repository_limit, max_concurrency) {
        (Some(repository_limit), Some(max_concurrency)) => {
            Some(repository_limit.min(max_concurrency))
        }
        (repository_limit, max_concurrency) => repository_limit.or(max_concurrency),
    }
}

/// The queue key of the repository a record belongs to. Records without a repository label belong to no queue.
pub fn queue_key_for(record: &ExecutionRecord) -> Option<String> {
    record
        .repository()
        .map(|repository| format!("{}/{}", record.namespace, repository))
}

#[derive(Debug, Default)]
pub struct QueueManager {
    queues: DashMap<String, RepoQueue>,

    /// Global ceiling on running executions per repository. 0 means none.
    max_concurrency: AtomicU64,
}

impl QueueManager {
    pub fn new(max_concurrency: u64) -> Self {
        Self {
            queues: DashMap::new(),
            max_concurrency: AtomicU64::new(max_concurrency),
        }
    }

    /// Takes effect on the next admission for each repository.
    pub fn set_max_concurrency(&self, max_concurrency: u64) {
        let previous = self.max_concurrency.swap(max_concurrency, Ordering::SeqCst);
        if previous != max_concurrency {
            info!(previous, max_concurrency, "global concurrency ceiling changed");
        }
    }

    pub fn effective_limit(&self, repository: &Repository) -> Option<u64> {
        effective_limit(
            repository.concurrency_limit,
            self.max_concurrency.load(Ordering::SeqCst),
        )
    }

    /// Rebuilds every queue from the records that exist right now. Started records that are not done take
    /// running slots (even past the limit; nothing new is admitted until they drain), queued records wait in
    /// creation order. Replaces whatever state was there before, so calling it again with the same input gives
    /// the same queues.
    pub fn init_queues(
        &self,
        repositories: &[Repository],
        records: &[ExecutionRecord],
    ) -> Result<(), QueueError> {
        self.queues.clear();

        for repository in repositories {
            let previous = self.queues.insert(
                repository.queue_key(),
                RepoQueue {
                    limit: self.effective_limit(repository),
                    ..Default::default()
                },
            );

            if previous.is_some() {
                self.queues.clear();
                return Err(QueueError::DuplicateRepository(repository.queue_key()));
            }
        }

        let mut waiting: HashMap<String, Vec<&ExecutionRecord>> = HashMap::new();

        for record in records {
            if record.is_done() {
                continue;
            }

            let Some(repo_key) = queue_key_for(record) else {
                continue;
            };

            let Some(mut queue) = self.queues.get_mut(&repo_key) else {
                warn!(namespace = record.namespace, name = record.name, repository = repo_key,
                    "record belongs to an unknown repository; not tracking it");
                continue;
            };

            match record.state() {
                Some(State::Started) => {
                    queue.running.insert(record.key());
                }
                Some(State::Queued) if !record.spec_status.is_final() => {
                    waiting.entry(repo_key).or_default().push(record);
                }
                _ => {}
            }
        }

        for (repo_key, mut records) in waiting {
            records.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));

            if let Some(mut queue) = self.queues.get_mut(&repo_key) {
                queue.pending = records
                    .into_iter()
                    .map(|record| Waiting {
                        created: record.created,
                        key: record.key(),
                    })
                    .collect();
            }
        }

        for entry in self.queues.iter() {
            debug!(repository = entry.key(), running = entry.running.len(),
                pending = entry.pending.len(), limit = ?entry.limit, "queue initialized");
        }

        info!(repositories = self.queues.len(), "queues initialized");
        Ok(())
    }

    /// Loads every repository and managed record from the store and initializes the queues from them.
    pub async fn init_from_store(&self, stores: &Stores) -> Result<(), QueueError> {
        let repositories = stores.repositories.list_repositories(None).await?;
        let records = stores
            .executions
            .list_executions(None, &LabelSelector::new().exists(crate::models::labels::STATE))
            .await?;

        self.init_queues(&repositories, &records)
    }

    /// Asks for a running slot for `key`. Executions already holding a slot keep it and executions already
    /// waiting keep their place. New waiters are placed by `created` (then name), the same order a rebuild through
    /// [`QueueManager::init_queues`] produces.
    pub fn add_to_pending_queue(
        &self,
        repository: &Repository,
        key: &ExecutionKey,
        created: u64,
    ) -> Admitted {
        let limit = self.effective_limit(repository);
        let mut queue = self.queues.entry(repository.queue_key()).or_default();
        queue.limit = limit;

        let mut promoted = queue.promote();

        let admission = if queue.running.contains(key) {
            promoted.retain(|other| other != key);
            Admission::Running
        } else if let Some(position) = queue.pending.iter().position(|waiting| waiting.key == *key) {
            Admission::Queued { position }
        } else if queue.has_capacity() {
            queue.running.insert(key.clone());
            Admission::Running
        } else {
            Admission::Queued {
                position: queue.enqueue(key, created),
            }
        };

        debug!(repository = repository.queue_key(), execution = %key, admission = ?admission,
            running = queue.running.len(), pending = queue.pending.len(), "admission evaluated");

        Admitted {
            admission,
            promoted,
        }
    }

    /// Records `key` as holding a running slot regardless of the limit. Used for executions that were started
    /// without going through admission, so later admissions count them.
    pub fn mark_running(&self, repository: &Repository, key: &ExecutionKey) {
        let limit = self.effective_limit(repository);
        let mut queue = self.queues.entry(repository.queue_key()).or_default();
        queue.limit = limit;

        queue.pending.retain(|waiting| waiting.key != *key);
        queue.running.insert(key.clone());
    }

    /// Releases whatever `key` holds in the repository's queue. Returns the execution that was granted the freed
    /// slot. Unknown executions are ignored.
    pub fn remove_from_queue(&self, repo_key: &str, key: &ExecutionKey) -> Option<ExecutionKey> {
        let mut queue = self.queues.get_mut(repo_key)?;
        let promoted = queue.remove(key);

        debug!(repository = repo_key, execution = %key, promoted = ?promoted,
            running = queue.running.len(), pending = queue.pending.len(), "removed from queue");

        promoted
    }

    /// Removes `key` from every queue. Used when the record is gone and its repository can no longer be
    /// looked up. Returns (queue key, promoted execution) pairs.
    pub fn forget(&self, key: &ExecutionKey) -> Vec<(String, ExecutionKey)> {
        let mut promoted = vec![];

        for mut entry in self.queues.iter_mut() {
            if let Some(next) = entry.remove(key) {
                promoted.push((entry.key().clone(), next));
            }
        }

        promoted
    }

    /// Every execution holding or waiting for a slot, across all repositories.
    pub fn tracked(&self) -> BTreeSet<ExecutionKey> {
        let mut tracked = BTreeSet::new();

        for entry in self.queues.iter() {
            tracked.extend(entry.running.iter().cloned());
            tracked.extend(entry.pending.iter().map(|waiting| waiting.key.clone()));
        }

        tracked
    }

    pub fn running(&self, repo_key: &str) -> Vec<ExecutionKey> {
        self.queues
            .get(repo_key)
            .map(|queue| queue.running.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, repo_key: &str) -> Vec<ExecutionKey> {
        self.queues
            .get(repo_key)
            .map(|queue| queue.pending.iter().map(|waiting| waiting.key.clone()).collect())
            .unwrap_or_default()
    }
}
