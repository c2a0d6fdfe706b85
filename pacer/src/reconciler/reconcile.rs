use super::ReconcileError;
use crate::models::{execution::State, ExecutionKey, ExecutionRecord, SpecStatus};
use crate::store::{retry_on_conflict, RetryConfig, StoreError, Stores};
use crate::sync::{Admission, QueueManager};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened when a queued execution was granted its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promotion {
    Started,
    AlreadyStarted,

    /// The record is gone from the store.
    Vanished,

    /// The record finished or was asked to stop while it waited.
    Ineligible,
}

/// Drives a single execution record toward the state its queue allows.
#[derive(Debug, Clone)]
pub struct Reconciler {
    stores: Stores,
    queues: Arc<QueueManager>,
    retry: RetryConfig,
}

impl Reconciler {
    pub fn new(stores: Stores, queues: Arc<QueueManager>, retry: RetryConfig) -> Self {
        Self {
            stores,
            queues,
            retry,
        }
    }

    pub async fn reconcile(&self, key: &ExecutionKey) -> Result<(), ReconcileError> {
        let record = match self.stores.executions.get_execution(key).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => {
                debug!(namespace = key.namespace, name = key.name, "execution is gone; releasing its slot");
                for (repo_key, next) in self.queues.forget(key) {
                    self.start(&repo_key, next).await?;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(state) = record.state() else {
            return Ok(());
        };

        let Some(repository_name) = record.repository() else {
            warn!(namespace = record.namespace, name = record.name,
                "managed execution carries no repository label; ignoring");
            return Ok(());
        };

        let repository = match self
            .stores
            .repositories
            .get_repository(&record.namespace, repository_name)
            .await
        {
            Ok(repository) => repository,
            Err(StoreError::NotFound) => {
                warn!(namespace = record.namespace, name = record.name, repository = repository_name,
                    "execution belongs to an unknown repository; ignoring");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let repo_key = repository.queue_key();

        if record.is_done() {
            if state != State::Completed {
                self.complete(&repo_key, &record).await?;
            }
            return Ok(());
        }

        match state {
            State::Completed => {}
            State::Started => self.queues.mark_running(&repository, key),
            State::Queued if record.spec_status.is_final() => {
                info!(namespace = record.namespace, name = record.name, spec_status = %record.spec_status,
                    "queued execution was stopped before it started");
                self.complete(&repo_key, &record).await?;
            }
            State::Queued => {
                let admitted = self
                    .queues
                    .add_to_pending_queue(&repository, key, record.created);

                for promoted in admitted.promoted {
                    self.start(&repo_key, promoted).await?;
                }

                match admitted.admission {
                    Admission::Running => self.start(&repo_key, key.clone()).await?,
                    Admission::Queued { position } => {
                        debug!(namespace = record.namespace, name = record.name, position,
                            "execution is waiting for a free slot");
                    }
                }
            }
        }

        Ok(())
    }

    /// Labels the record completed, then gives its slot away. The label keeps the release from happening twice.
    async fn complete(&self, repo_key: &str, record: &ExecutionRecord) -> Result<(), ReconcileError> {
        let key = record.key();
        let executions = &self.stores.executions;
        let target = &key;

        let relabeled = retry_on_conflict(self.retry, move || async move {
            let mut current = match executions.get_execution(target).await {
                Ok(current) => current,
                Err(StoreError::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            };

            if current.state() == Some(State::Completed) {
                return Ok(false);
            }

            current.set_state(State::Completed);
            executions.update_execution(&current).await?;
            Ok(true)
        })
        .await?;

        if relabeled {
            info!(namespace = key.namespace, name = key.name, "execution completed");
        }

        if let Some(next) = self.queues.remove_from_queue(repo_key, &key) {
            self.start(repo_key, next).await?;
        }

        Ok(())
    }

    /// Starts `key`. If it can no longer be started its slot goes to the next waiting execution instead, and so
    /// on until one starts or the wait list is empty.
    async fn start(&self, repo_key: &str, key: ExecutionKey) -> Result<(), ReconcileError> {
        let mut next = Some(key);

        while let Some(key) = next.take() {
            match self.promote(&key).await? {
                Promotion::Started => {
                    info!(namespace = key.namespace, name = key.name, repository = repo_key,
                        "execution started");
                }
                Promotion::AlreadyStarted => {}
                Promotion::Vanished | Promotion::Ineligible => {
                    debug!(namespace = key.namespace, name = key.name,
                        "promoted execution can no longer start; passing its slot on");
                    next = self.queues.remove_from_queue(repo_key, &key);
                }
            }
        }

        Ok(())
    }

    async fn promote(&self, key: &ExecutionKey) -> Result<Promotion, StoreError> {
        let executions = &self.stores.executions;

        retry_on_conflict(self.retry, move || async move {
            let mut record = match executions.get_execution(key).await {
                Ok(record) => record,
                Err(StoreError::NotFound) => return Ok(Promotion::Vanished),
                Err(e) => return Err(e),
            };

            if record.is_done() || record.spec_status.is_final() {
                return Ok(Promotion::Ineligible);
            }

            if record.state() == Some(State::Started) && record.spec_status != SpecStatus::Pending {
                return Ok(Promotion::AlreadyStarted);
            }

            record.set_state(State::Started);
            record.spec_status = SpecStatus::Unset;
            executions.update_execution(&record).await?;
            Ok(Promotion::Started)
        })
        .await
    }
}
